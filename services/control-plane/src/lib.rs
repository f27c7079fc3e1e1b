//! berth control plane library.
//!
//! This crate primarily ships a `control-plane` binary, but we expose the
//! engine as a library to enable integration testing and reuse.
//!
//! - [`hierarchy`]: effective limits down the tenant tree
//! - [`cascade`]: re-enforcement after limit changes
//! - [`ports`]: per-node port allocation and reservations
//! - [`deploy`]: deployment lifecycle, task queue and node push
//! - [`store`] / [`db`]: persistence seams and the Postgres store

pub mod api;
pub mod cascade;
pub mod cleanup;
pub mod config;
pub mod context;
pub mod db;
pub mod deploy;
pub mod engine;
pub mod error;
pub mod hierarchy;
pub mod model;
pub mod ports;
pub mod state;
pub mod store;
