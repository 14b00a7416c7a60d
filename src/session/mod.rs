//! Slot/session management.
//!
//! The session manager owns the DSU server and one supervisor per configured
//! slot. Each supervisor walks a slot through its lifecycle:
//!
//! ```text
//! Resolving ──► Active ──► Disconnected ──► (reconnect: back to Resolving)
//! (locate &     (pipeline    (transport
//!  spawn)        running)     lost)
//! ```
//!
//! A slot failure is isolated to that supervisor; the server and the other
//! slots keep running. Operator shutdown cancels everything, joins every
//! supervisor, and closes the DSU socket last.

pub mod manager;

pub use manager::{SessionError, SessionHandle};
