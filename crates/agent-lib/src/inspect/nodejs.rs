use regex::Regex;

use super::{framework_from_cmdline, DeepScan, LanguageInspector};
use crate::models::{Confidence, DetectionResult, Language};
use crate::proc::{maps_contains, ProcessContext};

const FRAMEWORKS: [(&str, &[&str]); 3] = [
    ("Next.js", &["next start", "next dev", ".next/server", "next-server"]),
    ("NestJS", &["@nestjs/core", "nest start", "nestjs"]),
    ("Express", &["express", "express.js", "expressjs"]),
];

const PROCESS_NAMES: [&str; 5] = ["node", "npm", "npx", "yarn", "pnpm"];

pub struct NodeJsInspector {
    version_re: Regex,
}

impl Default for NodeJsInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeJsInspector {
    pub fn new() -> Self {
        Self {
            // Tolerates the leading "v" of NODE_VERSION=v18.17.1.
            version_re: Regex::new(r"v?(\d+\.\d+\.?\d*)").unwrap(),
        }
    }

    fn extract_version(&self, ctx: &ProcessContext) -> String {
        for key in ["NODE_VERSION", "NPM_VERSION"] {
            if let Some(raw) = ctx.environ.get(key) {
                if let Some(caps) = self.version_re.captures(raw) {
                    return caps[1].to_string();
                }
                return raw.trim_start_matches('v').to_string();
            }
        }
        String::new()
    }

    fn result(&self, ctx: &ProcessContext, confidence: Confidence) -> DetectionResult {
        DetectionResult {
            language: Language::NodeJs,
            framework: framework_from_cmdline(ctx, &FRAMEWORKS),
            version: self.extract_version(ctx),
            confidence,
        }
    }
}

impl LanguageInspector for NodeJsInspector {
    fn language(&self) -> Language {
        Language::NodeJs
    }

    fn quick_scan(&self, ctx: &ProcessContext) -> Option<DetectionResult> {
        let exe = ctx.exe_basename();
        let cmdline = ctx.cmdline.to_lowercase();

        for name in PROCESS_NAMES {
            if exe == name || cmdline.contains(&format!("/{name} ")) {
                return Some(self.result(ctx, Confidence::High));
            }
        }

        let patterns = ["node_modules", "npm start", "yarn start", "pnpm start"];
        if patterns.iter().any(|p| cmdline.contains(p)) {
            return Some(self.result(ctx, Confidence::Medium));
        }

        None
    }

    fn deep_scan(&self, ctx: &ProcessContext, deep: &DeepScan<'_>) -> Option<DetectionResult> {
        let maps = deep.maps?;
        if maps_contains(maps, &["libnode.so", "libnode.so.", "node"]) {
            return Some(self.result(ctx, Confidence::High));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(exe: &str, cmdline: &str) -> ProcessContext {
        ProcessContext {
            pid: 1,
            executable: exe.to_string(),
            cmdline: cmdline.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn node_binary_is_high() {
        let result = NodeJsInspector::new()
            .quick_scan(&ctx("/usr/local/bin/node", "node server.js"))
            .unwrap();
        assert_eq!(result.confidence, Confidence::High);
    }

    #[test]
    fn next_framework_detected() {
        let result = NodeJsInspector::new()
            .quick_scan(&ctx("/usr/local/bin/node", "node /app/.next/server/index.js"))
            .unwrap();
        assert_eq!(result.framework, "Next.js");
    }

    #[test]
    fn node_modules_pattern_is_medium() {
        let result = NodeJsInspector::new()
            .quick_scan(&ctx("/bin/sh", "sh -c node_modules/.bin/serve"))
            .unwrap();
        assert_eq!(result.confidence, Confidence::Medium);
    }

    #[test]
    fn version_strips_v_prefix() {
        let mut c = ctx("/usr/local/bin/node", "node index.js");
        c.environ.insert("NODE_VERSION".into(), "v18.17.1".into());
        let result = NodeJsInspector::new().quick_scan(&c).unwrap();
        assert_eq!(result.version, "18.17.1");
    }
}
