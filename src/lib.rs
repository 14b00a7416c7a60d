//! gcbridge: NSO GameCube controller to Cemuhook/DSU bridge.
//!
//! Reads the Nintendo Switch Online GameCube controller over USB or
//! Bluetooth LE and re-exposes it to emulators as a virtual gamepad over the
//! DSU UDP protocol (Dolphin: Controllers > Alternate Input Sources > DSU
//! Client).
//!
//! ```text
//! controller ──► transport ──► controller pipeline ──► dsu server ──► emulator
//!  (USB/BLE)     (raw frames)  (decode + calibrate)    (UDP packets)
//! ```

pub mod config;
pub mod controller;
pub mod dsu;
pub mod persistence;
pub mod session;
pub mod transport;
