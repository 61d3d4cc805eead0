//! Model Context Protocol (MCP) server over length-framed JSON-RPC
//!
//! Covers the wire framing, JSON-RPC envelopes, method dispatch, the stdio
//! transport loop and the server that wires them to the mapping tools.

pub mod dispatcher;
pub mod framing;
pub mod rpc;
pub mod server;
pub mod transport;
