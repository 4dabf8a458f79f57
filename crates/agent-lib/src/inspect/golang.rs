use regex::Regex;

use super::{DeepScan, LanguageInspector};
use crate::models::{Confidence, DetectionResult, Language};
use crate::proc::{ElfAnalyzer, ProcessContext};

pub struct GoInspector {
    elf: ElfAnalyzer,
    version_re: Regex,
}

impl Default for GoInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl GoInspector {
    pub fn new() -> Self {
        Self {
            elf: ElfAnalyzer::new(),
            version_re: Regex::new(r"go(\d+\.\d+\.?\d*)").unwrap(),
        }
    }

    /// "go1.21.3" -> "1.21.3"
    fn clean_version(&self, version: &str) -> String {
        if let Some(caps) = self.version_re.captures(version) {
            return caps[1].to_string();
        }
        version.trim_start_matches("go").to_string()
    }

    fn version_from_env(&self, ctx: &ProcessContext) -> String {
        for key in ["GO_VERSION", "GOLANG_VERSION"] {
            if let Some(raw) = ctx.environ.get(key) {
                return self.clean_version(raw);
            }
        }
        String::new()
    }
}

impl LanguageInspector for GoInspector {
    fn language(&self) -> Language {
        Language::Go
    }

    fn quick_scan(&self, ctx: &ProcessContext) -> Option<DetectionResult> {
        let (is_go, version) = self.elf.go_build_info(&ctx.executable);
        if is_go {
            // Dynatrace wrappers are Go binaries fronting arbitrary apps,
            // a known false positive.
            if !ctx.cmdline.to_lowercase().contains("dynatrace") {
                return Some(DetectionResult {
                    language: Language::Go,
                    framework: String::new(),
                    version: self.clean_version(&version),
                    confidence: Confidence::High,
                });
            }
        }

        for key in ["GOOS", "GOARCH", "GOPATH"] {
            if ctx.environ.contains_key(key) {
                return Some(DetectionResult {
                    language: Language::Go,
                    framework: String::new(),
                    version: self.version_from_env(ctx),
                    confidence: Confidence::Medium,
                });
            }
        }

        None
    }

    fn deep_scan(&self, _ctx: &ProcessContext, _deep: &DeepScan<'_>) -> Option<DetectionResult> {
        // The build-info probe in quick_scan is already conclusive.
        None
    }
}
