//! Persistent storage for saved controllers.

pub mod controller_store;

pub use controller_store::{ControllerStore, SavedController, StoreError};
