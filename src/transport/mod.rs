//! Client transport for upstream MCP servers
//!
//! envctl reaches upstream servers over the 2024-11-05 HTTP+SSE pairing:
//! a long-lived `GET /sse` stream carries server-push events (first an
//! `endpoint` event naming the message URL, then `message` events with
//! JSON-RPC responses and notifications), while requests are POSTed to the
//! message URL.

mod sse;

pub use sse::{SseConnection, SseEvent, SseParser};
