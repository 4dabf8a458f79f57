use regex::Regex;

use super::{framework_from_cmdline, version_from_env, DeepScan, LanguageInspector};
use crate::models::{Confidence, DetectionResult, Language};
use crate::proc::{maps_contains, ProcessContext};

const FRAMEWORKS: [(&str, &[&str]); 1] =
    [("ASP.NET Core", &["aspnetcore", "microsoft.aspnetcore"])];

const VERSION_ENV_KEYS: [&str; 2] = ["DOTNET_VERSION", "ASPNETCORE_VERSION"];

pub struct DotNetInspector {
    version_re: Regex,
}

impl Default for DotNetInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl DotNetInspector {
    pub fn new() -> Self {
        Self {
            version_re: Regex::new(r"(\d+\.\d+\.?\d*)").unwrap(),
        }
    }

    fn result(&self, ctx: &ProcessContext, confidence: Confidence) -> DetectionResult {
        DetectionResult {
            language: Language::DotNet,
            framework: framework_from_cmdline(ctx, &FRAMEWORKS),
            version: version_from_env(ctx, &VERSION_ENV_KEYS, &self.version_re),
            confidence,
        }
    }
}

impl LanguageInspector for DotNetInspector {
    fn language(&self) -> Language {
        Language::DotNet
    }

    fn quick_scan(&self, ctx: &ProcessContext) -> Option<DetectionResult> {
        if ctx.exe_basename() == "dotnet" {
            return Some(self.result(ctx, Confidence::High));
        }

        let cmdline = ctx.cmdline.to_lowercase();
        let patterns = ["/dotnet ", "\\dotnet.exe", "/usr/bin/dotnet", "/usr/share/dotnet"];
        if patterns.iter().any(|p| cmdline.contains(p)) {
            return Some(self.result(ctx, Confidence::Medium));
        }

        None
    }

    fn deep_scan(&self, ctx: &ProcessContext, deep: &DeepScan<'_>) -> Option<DetectionResult> {
        let maps = deep.maps?;
        if maps_contains(maps, &["libcoreclr.so", "System.Private.CoreLib.dll"]) {
            return Some(self.result(ctx, Confidence::High));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dotnet_binary_is_high() {
        let ctx = ProcessContext {
            pid: 1,
            executable: "/usr/share/dotnet/dotnet".into(),
            cmdline: "dotnet MyApp.dll".into(),
            ..Default::default()
        };
        let result = DotNetInspector::new().quick_scan(&ctx).unwrap();
        assert_eq!(result.language, Language::DotNet);
        assert_eq!(result.confidence, Confidence::High);
    }

    #[test]
    fn coreclr_in_maps_is_high() {
        let ctx = ProcessContext {
            pid: 1,
            cmdline: "MyApp".into(),
            ..Default::default()
        };
        let elf = crate::proc::ElfAnalyzer::new();
        let deep = DeepScan {
            maps: Some("7f r-xp /usr/share/dotnet/shared/Microsoft.NETCore.App/8.0.0/libcoreclr.so\n"),
            elf: &elf,
        };
        let result = DotNetInspector::new().deep_scan(&ctx, &deep).unwrap();
        assert_eq!(result.confidence, Confidence::High);
    }
}
