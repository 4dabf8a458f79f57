use super::{DeepScan, LanguageInspector};
use crate::models::{Confidence, DetectionResult, Language};
use crate::proc::ProcessContext;

/// Rust binaries carry no reliable process-name or cmdline signature, so
/// detection rests entirely on symbol analysis.
pub struct RustInspector;

impl Default for RustInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl RustInspector {
    pub fn new() -> Self {
        Self
    }
}

impl LanguageInspector for RustInspector {
    fn language(&self) -> Language {
        Language::Rust
    }

    fn quick_scan(&self, _ctx: &ProcessContext) -> Option<DetectionResult> {
        None
    }

    fn deep_scan(&self, ctx: &ProcessContext, deep: &DeepScan<'_>) -> Option<DetectionResult> {
        if deep.elf.has_rust_symbols(&ctx.executable) {
            return Some(DetectionResult {
                language: Language::Rust,
                framework: String::new(),
                version: String::new(),
                confidence: Confidence::High,
            });
        }
        None
    }
}
