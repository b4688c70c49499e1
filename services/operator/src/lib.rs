//! # keepalived-operator
//!
//! Kubernetes operator that runs keepalived for `KeepalivedGroup` resources.
//!
//! ## Architecture
//!
//! - **Watches** ([`watch`]): groups, annotated services and keepalived pods
//!   are watched; [`routing`] maps each change to the group keys it affects
//! - **Work queue** ([`queue`]): deduplicates keys and retries failures with
//!   exponential backoff
//! - **Controller** ([`controller`]): one pass per key; validates, assigns
//!   router ids, and converges artifacts
//! - **Rendering** ([`render`], [`converge`]): a minijinja template turns the
//!   group, its services and its pods into Kubernetes objects
//! - **Store** ([`store`]): the API server in production, memory in tests

pub mod artifact;
pub mod config;
pub mod controller;
pub mod converge;
pub mod error;
pub mod queue;
pub mod render;
pub mod routing;
pub mod store;
pub mod watch;

pub use config::{Config, OperatorContext};
pub use controller::{Controller, Outcome, Phase};
pub use error::ReconcileError;
