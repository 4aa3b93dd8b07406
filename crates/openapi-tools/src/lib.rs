//! `OpenAPI` loading and compilation of API operations into namespaced tools.
//!
//! Used by `toolmount-gateway` at bootstrap. Tool execution lives in `toolmount-http-tools`;
//! this crate has no session or protocol logic.

pub mod compiler;
pub mod error;
pub mod loader;
pub mod operation;
pub mod resolver;
pub mod schema;
