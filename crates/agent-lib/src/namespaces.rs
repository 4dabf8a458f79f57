//! Namespace monitoring policy
//!
//! An explicit allow-list restricts monitoring to exactly those namespaces
//! and overrides the deny-list entirely; otherwise the deny-list excludes
//! its members; otherwise everything is monitored.

/// Parse a comma-separated namespace list, trimming whitespace and
/// dropping empties.
pub fn parse_namespace_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct NamespacePolicy {
    monitored: Vec<String>,
    ignored: Vec<String>,
}

impl NamespacePolicy {
    pub fn new(monitored: Vec<String>, ignored: Vec<String>) -> Self {
        Self { monitored, ignored }
    }

    pub fn from_env_strings(monitored: &str, ignored: &str) -> Self {
        Self::new(parse_namespace_list(monitored), parse_namespace_list(ignored))
    }

    pub fn should_monitor(&self, namespace: &str) -> bool {
        if !self.monitored.is_empty() {
            return self.monitored.iter().any(|ns| ns == namespace);
        }
        if !self.ignored.is_empty() {
            return !self.ignored.iter().any(|ns| ns == namespace);
        }
        true
    }
}
