//! HTTP handlers, one module per client protocol.

pub mod claude;
pub mod common;
pub mod gemini;
pub mod openai;
