//! Core library for the polylang detection agent
//!
//! This crate provides:
//! - Process and ELF inspection over a configurable proc root
//! - Per-language inspectors and the two-stage detection orchestrator
//! - Container-to-PID resolution across cgroup v1/v2 layouts
//! - The dual-index detection cache and cluster-state reconciler
//! - The batched, reconnecting client for the config updater
//! - Namespace policy, health checks and observability

pub mod cache;
pub mod cluster;
pub mod health;
pub mod inspect;
pub mod models;
pub mod namespaces;
pub mod observability;
pub mod proc;
pub mod scanner;
pub mod sync;

pub use cache::DetectionCache;
pub use health::{ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse};
pub use models::{Confidence, ContainerInfo, DetectionResult, Language, WorkloadKind};
pub use namespaces::NamespacePolicy;
pub use observability::{AgentMetrics, DomainLogger};
