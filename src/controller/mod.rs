//! Controller module for Checkly resource reconciliation
//! This module contains the generic reconcile loop, the synchronizer for
//! annotation-derived checks and their wiring into kube-runtime.

mod backoff;
pub mod conditions;
pub mod derived;
pub mod finalizers;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod reconcile_loop;
mod runner;

pub use backoff::{calculate_backoff, BackoffTracker, DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX};
pub use derived::{
    derived_name, DerivedResourceSynchronizer, OwnerIndex, OwnerKey, SyncPlan, SyncReport,
};
pub use finalizers::{finalizer_name, FinalizerManager};
pub use reconcile_loop::{LoopConfig, ObjectKey, ReconcileLoop, REJECTED_REQUEUE};
pub use runner::{run_controllers, ControllerState};
