use regex::Regex;

use super::{framework_from_cmdline, version_from_env, DeepScan, LanguageInspector};
use crate::models::{Confidence, DetectionResult, Language};
use crate::proc::{maps_contains, ProcessContext};

const FRAMEWORKS: [(&str, &[&str]); 2] = [
    ("Rails", &["rails", "actionpack", "activerecord"]),
    ("Sinatra", &["sinatra"]),
];

const PROCESS_NAMES: [&str; 10] = [
    "ruby", "rails", "rake", "rackup", "puma", "unicorn", "gem", "bundler", "irb", "pry",
];

const VERSION_ENV_KEYS: [&str; 2] = ["RUBY_VERSION", "RBENV_VERSION"];

pub struct RubyInspector {
    version_re: Regex,
}

impl Default for RubyInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl RubyInspector {
    pub fn new() -> Self {
        Self {
            version_re: Regex::new(r"(\d+\.\d+\.?\d*)").unwrap(),
        }
    }

    fn result(&self, ctx: &ProcessContext, confidence: Confidence) -> DetectionResult {
        DetectionResult {
            language: Language::Ruby,
            framework: framework_from_cmdline(ctx, &FRAMEWORKS),
            version: version_from_env(ctx, &VERSION_ENV_KEYS, &self.version_re),
            confidence,
        }
    }
}

impl LanguageInspector for RubyInspector {
    fn language(&self) -> Language {
        Language::Ruby
    }

    fn quick_scan(&self, ctx: &ProcessContext) -> Option<DetectionResult> {
        if ctx.matches_process_name(&PROCESS_NAMES) {
            return Some(self.result(ctx, Confidence::High));
        }
        None
    }

    fn deep_scan(&self, ctx: &ProcessContext, deep: &DeepScan<'_>) -> Option<DetectionResult> {
        let maps = deep.maps?;
        if maps_contains(maps, &["libruby.so"]) {
            return Some(self.result(ctx, Confidence::High));
        }
        None
    }
}
