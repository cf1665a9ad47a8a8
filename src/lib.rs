//! kanari: canary rollout controller for NGINX Ingress
//!
//! Steps the `canary-weight` annotation of an Ingress pair towards a new
//! revision while its Prometheus success ratio holds, and returns all
//! traffic to the stable revision when it does not.

pub mod client;
pub mod config;
pub mod controller;
pub mod error;
pub mod model;
pub mod server;
