//! Core data models for the detection agent

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A detected programming language.
///
/// The serialized names are part of the wire contract with the config
/// updater and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Language {
    Java,
    Python,
    #[serde(rename = "nodejs")]
    NodeJs,
    Go,
    #[serde(rename = ".NET")]
    DotNet,
    #[serde(rename = "PHP")]
    Php,
    Ruby,
    Rust,
    Unknown,
}

impl Language {
    /// Languages the config updater can auto-instrument. Anything else is
    /// cached and logged but never forwarded.
    pub fn otel_supported(&self) -> bool {
        matches!(
            self,
            Language::Go | Language::NodeJs | Language::Python | Language::Java | Language::DotNet
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Java => "Java",
            Language::Python => "Python",
            Language::NodeJs => "nodejs",
            Language::Go => "Go",
            Language::DotNet => ".NET",
            Language::Php => "PHP",
            Language::Ruby => "Ruby",
            Language::Rust => "Rust",
            Language::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Qualitative detection confidence, ordered low < medium < high.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of running the inspector pipeline against one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionResult {
    pub language: Language,
    pub framework: String,
    pub version: String,
    pub confidence: Confidence,
}

impl DetectionResult {
    pub fn unknown() -> Self {
        Self {
            language: Language::Unknown,
            framework: String::new(),
            version: String::new(),
            confidence: Confidence::Low,
        }
    }
}

/// Kind of the controller that owns a pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    DaemonSet,
    StatefulSet,
    ReplicaSet,
    Pod,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::StatefulSet => "StatefulSet",
            WorkloadKind::ReplicaSet => "ReplicaSet",
            WorkloadKind::Pod => "Pod",
        }
    }

    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "Deployment" => Some(WorkloadKind::Deployment),
            "DaemonSet" => Some(WorkloadKind::DaemonSet),
            "StatefulSet" => Some(WorkloadKind::StatefulSet),
            "ReplicaSet" => Some(WorkloadKind::ReplicaSet),
            "Pod" => Some(WorkloadKind::Pod),
            _ => None,
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name used for pods with no controller owner.
pub const STANDALONE_POD: &str = "Standalone Pod";

/// The unit that flows upstream: one container's detection result plus the
/// cluster coordinates needed to apply instrumentation to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub pod_name: String,
    pub namespace: String,
    pub container_name: String,
    pub image: String,
    pub kind: WorkloadKind,
    pub deployment_name: String,
    pub env_vars: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub process_commands: Vec<String>,
    pub detected_at: DateTime<Utc>,
    pub language: Language,
    pub framework: String,
    pub confidence: Confidence,
    pub evidence: Vec<String>,
    /// Whether the owning workload already carries instrumentation
    /// annotations. Reserved for the updater; never gates forwarding here.
    pub enabled: bool,
}

impl ContainerInfo {
    /// Blank record for a container that has been located in the cluster but
    /// not yet classified.
    pub fn pending(pod_name: &str, namespace: &str, container_name: &str, image: &str) -> Self {
        Self {
            pod_name: pod_name.to_string(),
            namespace: namespace.to_string(),
            container_name: container_name.to_string(),
            image: image.to_string(),
            kind: WorkloadKind::Pod,
            deployment_name: String::new(),
            env_vars: HashMap::new(),
            process_commands: Vec::new(),
            detected_at: Utc::now(),
            language: Language::Unknown,
            framework: String::new(),
            confidence: Confidence::Low,
            evidence: Vec::new(),
            enabled: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_wire_names_match_updater_contract() {
        assert_eq!(serde_json::to_string(&Language::NodeJs).unwrap(), "\"nodejs\"");
        assert_eq!(serde_json::to_string(&Language::DotNet).unwrap(), "\".NET\"");
        assert_eq!(serde_json::to_string(&Language::Php).unwrap(), "\"PHP\"");
        assert_eq!(serde_json::to_string(&Language::Go).unwrap(), "\"Go\"");
    }

    #[test]
    fn confidence_ordering() {
        assert!(Confidence::High > Confidence::Medium);
        assert!(Confidence::Medium > Confidence::Low);
    }

    #[test]
    fn otel_supported_set() {
        for lang in [
            Language::Go,
            Language::NodeJs,
            Language::Python,
            Language::Java,
            Language::DotNet,
        ] {
            assert!(lang.otel_supported(), "{lang} should be forwarded");
        }
        for lang in [Language::Php, Language::Ruby, Language::Rust, Language::Unknown] {
            assert!(!lang.otel_supported(), "{lang} should not be forwarded");
        }
    }

    #[test]
    fn unknown_result_is_low_confidence() {
        let r = DetectionResult::unknown();
        assert_eq!(r.language, Language::Unknown);
        assert_eq!(r.confidence, Confidence::Low);
    }
}
