//! Worldsmith — prompt templating and a durable generation queue for
//! world building.
//!
//! A world is assembled from structured modules. Publishing a world turns
//! every module that is not already up to date into a queued generation job;
//! a single-consumer worker renders each module's prompt through the template
//! engine, calls an external chat model and promotes the world to active once
//! its queue drains.

pub mod config;
pub mod core;
pub mod error;
pub mod llm;
pub mod schema;
pub mod service;
pub mod store;
pub mod telemetry;

pub use crate::error::ServiceError;
pub use crate::service::engine::{WorldEngine, WorldEngineBuilder};
