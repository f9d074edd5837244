//! Custom CDP (Chrome DevTools Protocol) implementation
//!
//! Just enough protocol surface for instance/view management, with stealth
//! filtering of detectable commands built into the transport.

pub mod connection;
pub mod transport;
pub mod types;

pub use connection::{Connection, ViewSession};
pub use transport::{find_chrome, launch_chrome, CdpMessage, Transport};
