//! The PostgreSQL frontend/backend protocol: typed messages, the framing
//! codec, the per-connection state machine and the connection manager.

pub mod codec;
pub mod message;
pub mod protocol;
pub mod server;
