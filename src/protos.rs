//! Wire messages spoken by the server.
//!
//! Two surfaces: the client protocol carried over websockets, and the
//! internal protocol spoken between sibling server instances.

pub mod client;
pub mod peer;
