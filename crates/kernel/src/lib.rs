//! Reconciliation and runtime control kernel for a single-node container
//! platform: persistent intent (projects, services, routes, certificates),
//! a per-service lifecycle state machine over the container engine, an
//! embedded-proxy reconciler, health probing, and the event fan-out that
//! log/stats subscribers consume.

pub mod actor;
pub mod certs;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod health;
pub mod jobs;
pub mod lifecycle;
pub mod net;
pub mod ops;
pub mod proxy;
pub mod store;
pub mod supervisor;

pub use actor::{Actor, Role};
pub use config::Config;
pub use error::{Error, Result};
pub use ops::Kernel;
