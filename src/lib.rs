//! A real-time sync server for end-to-end encrypted databases

#![deny(missing_docs, rustdoc::broken_intra_doc_links)]

pub mod commit;
pub mod config;
pub mod metrics;
pub mod peers;
pub mod protos;
pub mod push;
pub mod ratelimit;
pub mod registry;
pub mod server;
pub mod state;
pub mod store;
mod http;
mod util;
mod ws;
