use regex::Regex;

use super::{framework_from_cmdline, version_from_env, DeepScan, LanguageInspector};
use crate::models::{Confidence, DetectionResult, Language};
use crate::proc::{maps_contains, ProcessContext};

const FRAMEWORKS: [(&str, &[&str]); 6] = [
    ("Spring Boot", &["spring-boot", "org.springframework.boot"]),
    ("Micronaut", &["micronaut"]),
    ("Quarkus", &["quarkus"]),
    ("Tomcat", &["tomcat", "catalina"]),
    ("Jetty", &["jetty"]),
    ("Wildfly", &["wildfly", "jboss"]),
];

const VERSION_ENV_KEYS: [&str; 3] = ["JAVA_VERSION", "JDK_VERSION", "OPENJDK_VERSION"];

pub struct JavaInspector {
    // Accepts both "1.8.0_292" and "11.0.12" style version strings.
    version_re: Regex,
}

impl Default for JavaInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl JavaInspector {
    pub fn new() -> Self {
        Self {
            version_re: Regex::new(r"(\d+\.[\d._]+)").unwrap(),
        }
    }

    fn result(&self, ctx: &ProcessContext, confidence: Confidence) -> DetectionResult {
        DetectionResult {
            language: Language::Java,
            framework: framework_from_cmdline(ctx, &FRAMEWORKS),
            version: version_from_env(ctx, &VERSION_ENV_KEYS, &self.version_re),
            confidence,
        }
    }
}

impl LanguageInspector for JavaInspector {
    fn language(&self) -> Language {
        Language::Java
    }

    fn quick_scan(&self, ctx: &ProcessContext) -> Option<DetectionResult> {
        if ctx.exe_basename() == "java" {
            return Some(self.result(ctx, Confidence::High));
        }

        let cmdline = ctx.cmdline.to_lowercase();
        let patterns = ["openjdk", "java -jar", "javac", "jre", "jdk"];
        if patterns.iter().any(|p| cmdline.contains(p)) {
            return Some(self.result(ctx, Confidence::Medium));
        }

        None
    }

    fn deep_scan(&self, ctx: &ProcessContext, deep: &DeepScan<'_>) -> Option<DetectionResult> {
        let maps = deep.maps?;
        if maps_contains(maps, &["libjvm.so", "libjava.so"]) {
            return Some(self.result(ctx, Confidence::High));
        }
        None
    }
}
