//! Modelgate Core Library
//! Model routing, protocol translation, account pool and upstream dispatch
//! behind one local gateway.

pub mod account;
pub mod catalog;
pub mod config;
pub mod control;
pub mod error;
pub mod proxy;

pub use control::{ApplyReport, ConfigStore, ControlPlane, FileConfigStore, MemoryConfigStore};
pub use error::{GatewayError, GatewayResult};
