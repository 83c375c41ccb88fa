//! Shared types for MonoBridge
//!
//! This crate provides the error taxonomy and the RPC value model used by
//! the bridge core. Everything here is engine-agnostic and host-agnostic.

pub mod error;
pub mod value;

pub use error::{BridgeError, Result};
pub use value::RpcValue;
