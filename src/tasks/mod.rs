//! Long-running background tasks

mod reconcile;

pub use reconcile::ReconcileTask;
