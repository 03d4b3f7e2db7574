//! The networking layer: per-connection buffers, the connection state
//! machine, the worker reactors and the accept dispatcher.

pub mod buffer;
pub mod conn;
pub mod dispatch;
pub mod shared;
pub mod worker;
