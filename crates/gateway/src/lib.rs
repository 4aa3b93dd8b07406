//! toolmount gateway: one MCP endpoint in front of many OpenAPI-described HTTP APIs.
//!
//! Each configured API is compiled into tools, mounted under its namespace in a
//! [`registry::ToolRegistry`], and served through [`gateway::ProtocolGateway`] over the HTTP
//! transport in [`transport`].

pub mod bootstrap;
pub mod config;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;
