// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! BLE service and characteristic UUIDs for the OpenWay gate controller.

use std::time::Duration;
use uuid::Uuid;

/// OpenWay gate GATT service UUID.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);

/// Token characteristic UUID (the phone writes the access token here).
/// Properties: Write, Write Without Response
pub const TOKEN_CHAR_UUID: Uuid = Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8);

/// Name the gate controller advertises under.
pub const DEFAULT_NAME_HINT: &str = "OpenWay ESP32";

/// BLE configuration constants.
pub mod config {
    use super::Duration;

    /// Default MTU (minimum for all BLE devices).
    pub const DEFAULT_MTU: u16 = 23;

    /// ATT protocol overhead (3 bytes).
    pub const ATT_OVERHEAD: u16 = 3;

    /// MTU requested after service discovery.
    pub const DEFAULT_MTU_REQUEST: u16 = 185;

    /// Budget for the adapter and permission query.
    pub const GUARD_TIMEOUT: Duration = Duration::from_secs(3);
    pub const SCAN_TIMEOUT: Duration = Duration::from_secs(10);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const DISCOVER_TIMEOUT: Duration = Duration::from_secs(7);
    pub const MTU_TIMEOUT: Duration = Duration::from_secs(3);
    pub const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Largest value a single write can carry at the given MTU.
    pub fn max_payload_size(mtu: u16) -> usize {
        mtu.saturating_sub(ATT_OVERHEAD) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uuid_format() {
        assert_eq!(
            SERVICE_UUID.to_string(),
            "4fafc201-1fb5-459e-8fcc-c5c9c331914b"
        );
        assert_eq!(
            TOKEN_CHAR_UUID.to_string(),
            "beb5483e-36e1-4688-b7f5-ea07361b26a8"
        );
    }

    #[test]
    fn test_max_payload() {
        assert_eq!(config::max_payload_size(23), 20);
        assert_eq!(config::max_payload_size(100), 97);
        assert_eq!(config::max_payload_size(517), 514);
        // Never underflows on bogus values reported by a peripheral
        assert_eq!(config::max_payload_size(2), 0);
    }
}
