//! PR-scoped canary routing and reconciliation control plane.
//!
//! Lifecycle events from a GitHub repository's pull requests drive the
//! desired set of isolated canary environments; the reconcile manager
//! converges cluster state toward that set and publishes a routing rule
//! table that resolves tagged requests, identically over HTTP and gRPC,
//! to the matching environment or to stable.

pub mod applier;
pub mod config;
pub mod reconcile;
pub mod registry;
pub mod routing;
pub mod signal;
pub mod state;
pub mod types;

pub use reconcile::ReconcileManager;
pub use registry::EnvironmentRegistry;
pub use routing::{RuleTable, RuleTablePublisher};
pub use types::{Error, Result};
