//! Deployment orchestration and lifecycle management.
//!
//! This module coordinates a service from artifact download through process
//! supervision, database provisioning and routing, and undoes partial
//! deploys step by step when something fails.

mod journal;
mod manager;
mod requests;

pub use journal::{CompletedStep, Journal};
pub use manager::{Components, Orchestrator};
pub use requests::{
    DeployRequest, DeployResult, RemoveRequest, RemoveResult, RollbackResult, ServiceStatus,
    UpgradeOutcome, UpgradeRequest, UpgradeResult,
};
