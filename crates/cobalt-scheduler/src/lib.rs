//! # cobalt-scheduler
//!
//! Places inference requests on a pool of virtual compute nodes.
//!
//! Nodes that can take a request are scored on free memory, load and model
//! affinity; the best one runs it. Requests can also be queued for a
//! background load balancer, and a second loop keeps [`EngineStats`]
//! current from node snapshots.
//!
//! [`EngineStats`]: cobalt_types::EngineStats

pub mod balancer;
pub mod queue;
pub mod report;
pub mod scheduler;
pub mod scoring;

pub use queue::{PendingRequest, RequestQueue};
pub use report::StatusReport;
pub use scheduler::MultiNodeScheduler;
pub use scoring::{best_score, score_node, NodeScore};

pub use cobalt_types::{CobaltError, Result};
