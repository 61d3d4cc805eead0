//! Mapping tools exposed over the MCP protocol
//!
//! Argument validation, upstream request construction and result shaping for
//! each tool.

pub mod shaping;
pub mod tools;
pub mod utils;
