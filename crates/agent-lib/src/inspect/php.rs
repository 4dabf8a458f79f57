use regex::Regex;

use super::{framework_from_cmdline, DeepScan, LanguageInspector};
use crate::models::{Confidence, DetectionResult, Language};
use crate::proc::{maps_contains, ProcessContext};

const FRAMEWORKS: [(&str, &[&str]); 2] = [
    ("Laravel", &["artisan", "laravel"]),
    ("Symfony", &["bin/console", "symfony"]),
];

pub struct PhpInspector {
    version_re: Regex,
}

impl Default for PhpInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl PhpInspector {
    pub fn new() -> Self {
        Self {
            version_re: Regex::new(r"(\d+\.\d+\.?\d*)").unwrap(),
        }
    }

    fn version_from_env(&self, ctx: &ProcessContext) -> String {
        if let Some(raw) = ctx.environ.get("PHP_VERSION") {
            if let Some(caps) = self.version_re.captures(raw) {
                return caps[1].to_string();
            }
            return raw.clone();
        }
        String::new()
    }
}

impl LanguageInspector for PhpInspector {
    fn language(&self) -> Language {
        Language::Php
    }

    fn quick_scan(&self, ctx: &ProcessContext) -> Option<DetectionResult> {
        if ctx.matches_process_name(&["php", "php-fpm"]) {
            return Some(DetectionResult {
                language: Language::Php,
                framework: framework_from_cmdline(ctx, &FRAMEWORKS),
                version: self.version_from_env(ctx),
                confidence: Confidence::High,
            });
        }
        None
    }

    fn deep_scan(&self, ctx: &ProcessContext, deep: &DeepScan<'_>) -> Option<DetectionResult> {
        let maps = deep.maps?;
        if maps_contains(maps, &["libphp", "php-fpm"]) {
            // Prefer the exact version embedded in the binary over env hints.
            let version = deep
                .elf
                .php_version(&ctx.executable)
                .unwrap_or_else(|| self.version_from_env(ctx));
            return Some(DetectionResult {
                language: Language::Php,
                framework: framework_from_cmdline(ctx, &FRAMEWORKS),
                version,
                confidence: Confidence::High,
            });
        }
        None
    }
}
