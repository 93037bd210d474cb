//! Library surface for the `dataroom-node` binary.
//!
//! The binary stays a thin CLI over the config loader and the service
//! wiring so integration tests can drive a fully assembled node.

pub mod config;
pub mod service;
