//! Cemuhook/DSU server subsystem.
//!
//! Speaks the UDP protocol that Dolphin-family emulators consume under
//! "Alternate Input Sources > DSU Client":
//!
//! ```text
//! dsu/
//! ├── packet.rs - byte-exact wire framing, CRC32, encode/decode
//! ├── server.rs - socket ownership, client table, per-slot streaming
//! └── ports.rs  - stale-port recovery for crashed prior instances
//! ```
//!
//! The server reads each slot's latest-value cell and pushes pad-data packets
//! to subscribed clients; it never blocks a controller pipeline.

pub mod packet;
pub mod ports;
pub mod server;

pub use server::{DsuConfig, DsuError, DsuPublisher, DsuServer};
