//! Session configuration.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

use crate::dsu::server::DSU_PORT;

/// How a slot's physical controller is located.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportChoice {
    /// Nth attached USB controller, in enumeration order.
    Usb { device_index: usize },
    /// BLE controller, resolved in order: explicit address, saved-controller
    /// lookup by name, otherwise a filtered scan.
    Ble {
        address: Option<String>,
        saved_name: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConfig {
    /// DSU slot id, 0-3.
    pub slot: u8,
    pub choice: TransportChoice,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub dsu_port: u16,
    pub bind_addr: IpAddr,
    pub slots: Vec<SlotConfig>,
    /// Log inter-arrival latency stats every 100 reports.
    pub latency_stats: bool,
    /// Re-resolve a slot after its transport is lost.
    pub auto_reconnect: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            dsu_port: DSU_PORT,
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            slots: vec![SlotConfig {
                slot: 0,
                choice: TransportChoice::Usb { device_index: 0 },
            }],
            latency_stats: false,
            auto_reconnect: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_round_trips_through_toml() {
        let config = BridgeConfig {
            slots: vec![
                SlotConfig {
                    slot: 0,
                    choice: TransportChoice::Usb { device_index: 0 },
                },
                SlotConfig {
                    slot: 1,
                    choice: TransportChoice::Ble {
                        address: Some("AA:BB:CC:DD:EE:FF".into()),
                        saved_name: None,
                    },
                },
            ],
            latency_stats: true,
            ..BridgeConfig::default()
        };
        let text = toml::to_string(&config).unwrap();
        let parsed: BridgeConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
