use regex::Regex;

use super::{framework_from_cmdline, version_from_env, DeepScan, LanguageInspector};
use crate::models::{Confidence, DetectionResult, Language};
use crate::proc::{maps_contains, ProcessContext};

const FRAMEWORKS: [(&str, &[&str]); 4] = [
    (
        "Django",
        &["django", "manage.py", "django.core", "django-admin", "wsgi.py"],
    ),
    ("FastAPI", &["fastapi", "uvicorn", "starlette", "asgi"]),
    ("Flask", &["flask", "werkzeug", "flask run"]),
    ("Gunicorn", &["gunicorn", "gunicorn.app"]),
];

const VERSION_ENV_KEYS: [&str; 2] = ["PYTHON_VERSION", "PY_VERSION"];

pub struct PythonInspector {
    exe_re: Regex,
    version_re: Regex,
}

impl Default for PythonInspector {
    fn default() -> Self {
        Self::new()
    }
}

impl PythonInspector {
    pub fn new() -> Self {
        Self {
            exe_re: Regex::new(r"^(python|python3|python\d+|python3\.\d+)$").unwrap(),
            version_re: Regex::new(r"(\d+\.\d+\.?\d*)").unwrap(),
        }
    }

    fn result(&self, ctx: &ProcessContext, confidence: Confidence) -> DetectionResult {
        DetectionResult {
            language: Language::Python,
            framework: framework_from_cmdline(ctx, &FRAMEWORKS),
            version: version_from_env(ctx, &VERSION_ENV_KEYS, &self.version_re),
            confidence,
        }
    }
}

impl LanguageInspector for PythonInspector {
    fn language(&self) -> Language {
        Language::Python
    }

    fn quick_scan(&self, ctx: &ProcessContext) -> Option<DetectionResult> {
        if self.exe_re.is_match(ctx.exe_basename()) {
            return Some(self.result(ctx, Confidence::High));
        }

        let cmdline = ctx.cmdline.to_lowercase();
        let patterns = ["python", "gunicorn", "uvicorn", "pip ", "poetry run", "pipenv run"];
        if patterns.iter().any(|p| cmdline.contains(p)) {
            return Some(self.result(ctx, Confidence::Medium));
        }

        None
    }

    fn deep_scan(&self, ctx: &ProcessContext, deep: &DeepScan<'_>) -> Option<DetectionResult> {
        if let Some(version) = deep.elf.python_linkage(&ctx.executable) {
            return Some(DetectionResult {
                language: Language::Python,
                framework: framework_from_cmdline(ctx, &FRAMEWORKS),
                version,
                confidence: Confidence::High,
            });
        }

        let maps = deep.maps?;
        if maps_contains(maps, &["libpython3", "libpython2", "python3.", "python2."]) {
            return Some(self.result(ctx, Confidence::High));
        }
        None
    }
}
