//! Wire types shared by the Cloud Codex gateway: the line-framed JSON-RPC
//! dialect spoken to the agent subprocess, the raw event / run-view IR, and
//! the boundary frames exchanged with clients.

pub mod frames;
pub mod ir;
pub mod jsonrpc;
