//! VirtualMachineInstanceMigration reconciliation
//!
//! This crate drives a live migration from creation to a final phase:
//!
//! - **controller**: The reconcile loop, its Kubernetes write seam and context
//! - **gate**: Cluster and per-node parallel migration limits
//! - **pod**: Target and attachment pod classification and rendering
//! - **pdb**: Disruption budget expansion for protected VMIs
//! - **timeout**: Unschedulable and pending target pod timers
//! - **policy**: MigrationPolicy matching and configuration overlay
//! - **gc**: Pruning of finalized migrations
//! - **patch**: Test-and-set JSON patches for VMI writes
//! - **store**: Reflector-backed read side
//!
//! # Handoff
//!
//! Until the target pod is ready the controller owns the migration. It then
//! writes `status.migrationState` on the VMI in one conditional patch, and
//! from there on only follows what the node agents report.

#![deny(missing_docs)]

pub mod controller;
pub mod gate;
pub mod gc;
pub mod patch;
pub mod pdb;
pub mod pod;
pub mod policy;
pub mod renderer;
pub mod store;
pub mod timeout;

pub use controller::{error_policy, reconcile, Context, ContextBuilder, KubeClient, KubeClientImpl};
pub use store::{object_store, ObjectStore, StoreWriters};
