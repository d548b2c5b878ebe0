//! Networking: buffers, transport, and the comm-server thread (spec.md
//! §4.4).

pub mod buffer;
pub mod server;
pub mod transport;
