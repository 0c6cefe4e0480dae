//! A debug server speaking the GDB remote serial protocol (RSP), with async
//! transport, typed argument codecs and server-initiated Host I/O.
//!
//! The wire layer is [`transport`] (framing, checksums, the ack handshake)
//! built on [`buffer`] and [`codec`]. [`connection`] drives one client's
//! packet and query dispatch; [`server`] accepts sockets and spawns
//! connections. [`hostio`] implements server-initiated file operations over
//! `F` packets, backed by [`scratch`] memory. [`executor`] owns the runtime
//! connections and Host I/O run on; [`timeout`] races any fallible future
//! against a deadline. [`config`] and [`error`] round out the ambient stack.

pub mod buffer;
pub mod codec;
pub mod config;
pub mod connection;
pub mod debugger;
pub mod error;
pub mod executor;
pub mod hostio;
pub mod scratch;
pub mod server;
pub mod timeout;
pub mod transport;

pub use config::Config;
pub use debugger::{Debugger, NullDebugger};
pub use error::{Error, Result};
pub use server::Server;
