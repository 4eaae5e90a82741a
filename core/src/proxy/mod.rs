//! Proxy module - the gateway data plane and its listener

pub mod adapter;
pub mod config;
pub mod handlers;
pub mod mappers;
pub mod mapping;
pub mod middleware;
pub mod rate_limit;
pub mod selection;
pub mod server;
pub mod token_manager;
pub mod upstream;

pub use config::ProxyConfig;
pub use mapping::{MappingPatch, MappingTable, MappingTables, ModelResolver};
pub use server::{ProxyService, ProxyStatus, ServerPhase};
pub use token_manager::TokenManager;
