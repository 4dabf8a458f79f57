//! Language inspectors and the two-stage detection orchestrator
//!
//! Each language contributes one inspector with a cheap `quick_scan`
//! (executable basename, cmdline, env vars) and an expensive `deep_scan`
//! (memory maps, ELF analysis). The orchestrator runs all quick scans
//! first and only pays for the deep stage when the quick stage is
//! inconclusive.

mod dotnet;
mod golang;
mod java;
mod nodejs;
mod php;
mod python;
mod ruby;
mod rustlang;


pub use dotnet::DotNetInspector;
pub use golang::GoInspector;
pub use java::JavaInspector;
pub use nodejs::NodeJsInspector;
pub use php::PhpInspector;
pub use python::PythonInspector;
pub use ruby::RubyInspector;
pub use rustlang::RustInspector;

use thiserror::Error;

use crate::models::{Confidence, DetectionResult, Language};
use crate::proc::{ElfAnalyzer, ProcessContext};

/// Input for the deep stage: the process's maps text (when it could be
/// read) and a shared ELF analyzer.
pub struct DeepScan<'a> {
    pub maps: Option<&'a str>,
    pub elf: &'a ElfAnalyzer,
}

pub trait LanguageInspector: Send + Sync {
    fn language(&self) -> Language;

    /// Fast detection from process metadata alone. `high` for an exact
    /// process-name match, `medium` for a pattern match, `None` otherwise.
    fn quick_scan(&self, ctx: &ProcessContext) -> Option<DetectionResult>;

    /// Thorough detection from memory maps and ELF analysis; `high` or
    /// `None`.
    fn deep_scan(&self, ctx: &ProcessContext, deep: &DeepScan<'_>) -> Option<DetectionResult>;
}

/// Two or more inspectors claimed different languages with comparable
/// confidence. The affected container gets no result this cycle and is
/// retried on the next scan.
#[derive(Debug, Error)]
#[error("detected more than one language: [{}]", languages_list(.languages))]
pub struct LanguageConflict {
    pub languages: Vec<Language>,
}

fn languages_list(languages: &[Language]) -> String {
    languages
        .iter()
        .map(Language::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Orchestrates the inspector pipeline.
pub struct LanguageDetector {
    inspectors: Vec<Box<dyn LanguageInspector>>,
}

impl Default for LanguageDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl LanguageDetector {
    pub fn new() -> Self {
        Self {
            inspectors: vec![
                Box::new(JavaInspector::new()),
                Box::new(PythonInspector::new()),
                Box::new(NodeJsInspector::new()),
                Box::new(GoInspector::new()),
                Box::new(DotNetInspector::new()),
                Box::new(PhpInspector::new()),
                Box::new(RubyInspector::new()),
                Box::new(RustInspector::new()),
            ],
        }
    }

    /// Stage 1 only. `Ok(Some(_))` is a conclusive quick result, `Ok(None)`
    /// means the deep stage is needed.
    pub fn quick_detect(
        &self,
        ctx: &ProcessContext,
    ) -> Result<Option<DetectionResult>, LanguageConflict> {
        let results: Vec<DetectionResult> = self
            .inspectors
            .iter()
            .filter_map(|i| i.quick_scan(ctx))
            .collect();

        match results.len() {
            0 => Ok(None),
            1 if results[0].confidence == Confidence::High => Ok(Some(results[0].clone())),
            1 => Ok(None),
            _ => resolve_multi(results).map(Some),
        }
    }

    /// Both stages. The deep stage runs only when the quick stage is
    /// inconclusive; an empty deep stage yields `Unknown/low` regardless
    /// of any non-conclusive quick matches.
    pub fn detect(
        &self,
        ctx: &ProcessContext,
        deep: &DeepScan<'_>,
    ) -> Result<DetectionResult, LanguageConflict> {
        let quick: Vec<DetectionResult> = self
            .inspectors
            .iter()
            .filter_map(|i| i.quick_scan(ctx))
            .collect();

        match quick.len() {
            1 if quick[0].confidence == Confidence::High => return Ok(quick[0].clone()),
            0 | 1 => {}
            _ => return resolve_multi(quick),
        }

        let deep_results: Vec<DetectionResult> = self
            .inspectors
            .iter()
            .filter_map(|i| i.deep_scan(ctx, deep))
            .collect();

        match deep_results.len() {
            1 => Ok(deep_results[0].clone()),
            0 => Ok(DetectionResult::unknown()),
            _ => resolve_multi(deep_results),
        }
    }

    /// Re-check that a previously detected language still matches a process.
    pub fn verify_language(
        &self,
        ctx: &ProcessContext,
        deep: &DeepScan<'_>,
        expected: Language,
    ) -> bool {
        self.inspectors
            .iter()
            .filter(|i| i.language() == expected)
            .any(|i| {
                i.quick_scan(ctx).is_some_and(|r| r.language == expected)
                    || i.deep_scan(ctx, deep).is_some_and(|r| r.language == expected)
            })
    }
}

/// Multi-result resolution: same language everywhere merges via the
/// tie-break, distinct languages are a conflict.
fn resolve_multi(results: Vec<DetectionResult>) -> Result<DetectionResult, LanguageConflict> {
    let first = results[0].language;
    if results.iter().all(|r| r.language == first) {
        return Ok(select_best(results));
    }
    Err(LanguageConflict {
        languages: results.iter().map(|r| r.language).collect(),
    })
}

/// Tie-break among same-language results: higher confidence wins; among
/// equal confidence, a non-empty framework wins, then a non-empty version.
fn select_best(results: Vec<DetectionResult>) -> DetectionResult {
    let mut iter = results.into_iter();
    let mut best = iter.next().expect("select_best called with empty results");
    for result in iter {
        if result.confidence > best.confidence {
            best = result;
        } else if result.confidence == best.confidence {
            if !result.framework.is_empty() && best.framework.is_empty() {
                best = result;
            } else if !result.version.is_empty() && best.version.is_empty() {
                best = result;
            }
        }
    }
    best
}

/// Shared helper: first framework whose pattern list matches the lowered
/// cmdline.
pub(crate) fn framework_from_cmdline(
    ctx: &ProcessContext,
    table: &[(&'static str, &[&str])],
) -> String {
    let cmdline = ctx.cmdline.to_lowercase();
    for (framework, patterns) in table {
        if patterns.iter().any(|p| cmdline.contains(p)) {
            return (*framework).to_string();
        }
    }
    String::new()
}

/// Shared helper: first matching env var, cleaned through the given
/// version pattern.
pub(crate) fn version_from_env(
    ctx: &ProcessContext,
    keys: &[&str],
    pattern: &regex::Regex,
) -> String {
    for key in keys {
        if let Some(raw) = ctx.environ.get(*key) {
            if let Some(caps) = pattern.captures(raw) {
                return caps[1].to_string();
            }
            return raw.clone();
        }
    }
    String::new()
}
