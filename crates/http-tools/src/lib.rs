//! Tool model and backend HTTP execution for toolmount.
//!
//! This crate is used by:
//! - `toolmount-openapi-tools` (compiles `OpenAPI` operations into [`tool::ToolDefinition`]s)
//! - `toolmount-gateway` (binds definitions to [`adapter::BackendAdapter`]s and invokes them)
//!
//! It intentionally contains **no** session or protocol logic.

pub mod adapter;
pub mod client;
pub mod error;
pub mod request;
pub mod tool;
pub mod validate;
