// Upstream module
pub mod client;
pub mod dispatcher;

pub use client::UpstreamClient;
pub use dispatcher::{DispatchOutcome, Dispatcher};
