//! Socket lifecycle, the socket-backed transport, and inbound dispatch.

pub mod handler;
pub mod session;
pub mod transport;
