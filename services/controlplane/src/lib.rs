//! Identity control-plane library crate.
//!
//! # Purpose
//! Exposes the tenant model, storage adapters, signing keys, tenant-scoped
//! resources, the replicated log glue and the service layer for use by the
//! binary and tests.
//!
//! # Notes
//! Control-plane writes flow `service` -> `cluster` -> `store`; reads go to
//! `store` directly.
pub mod app;
pub mod cluster;
pub mod config;
pub mod jobs;
pub mod keys;
pub mod model;
pub mod observability;
pub mod service;
pub mod store;
pub mod tenancy;
