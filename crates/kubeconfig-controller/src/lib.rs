//! Kubeconfig controller: desired-state builder, stale cleanup, token
//! rotation and the state machine driving them.

#![deny(missing_docs)]

pub mod bundle;
pub mod controller;
pub mod differ;
pub mod manifest;
pub mod phases;
pub mod resource;
pub mod store;
pub mod token;

pub use controller::{
    error_policy, reconcile, run_pass, Clock, Context, ContextBuilder, KubeClient, KubeClientImpl,
    PassOutcome, SystemClock,
};
pub use resource::{ObjectKey, ResourceKind};
pub use store::{LiveObject, ObjectStore};
pub use token::{TokenInfo, TokenIssuer};
