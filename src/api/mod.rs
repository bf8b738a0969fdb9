//! HTTP API
//!
//! The wire surface of a node: client inserts and reads, the peer-to-peer
//! replication verbs, raw file access for sidecars, and operator endpoints.

mod http;

pub use http::{router, HttpServer};
