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

//! Configuration module.
//!
//! Handles loading and saving application settings.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::bluetooth::ble_constants::{self, config as ble};
use crate::bluetooth::{DeviceTarget, ScanFilter};

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bluetooth settings.
    pub ble: BleConfig,

    /// Delivery settings.
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BleConfig {
    /// GATT service the gate exposes.
    pub service_uuid: Uuid,

    /// Characteristic the token is written to.
    pub characteristic_uuid: Uuid,

    /// Advertised name to match while scanning. Empty disables the check.
    pub name_hint: Option<String>,

    /// Known gate address. When set, scanning is skipped.
    pub fixed_address: Option<String>,

    pub guard_timeout_ms: u64,
    pub scan_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub discover_timeout_ms: u64,
    pub mtu_timeout_ms: u64,
    pub write_timeout_ms: u64,

    /// MTU to ask for after service discovery.
    pub mtu_request: u16,

    /// Use acknowledged writes whenever the characteristic allows them.
    pub prefer_acknowledged_write: bool,
}

impl Default for BleConfig {
    fn default() -> Self {
        Self {
            service_uuid: ble_constants::SERVICE_UUID,
            characteristic_uuid: ble_constants::TOKEN_CHAR_UUID,
            name_hint: Some(ble_constants::DEFAULT_NAME_HINT.to_string()),
            fixed_address: None,
            guard_timeout_ms: ble::GUARD_TIMEOUT.as_millis() as u64,
            scan_timeout_ms: ble::SCAN_TIMEOUT.as_millis() as u64,
            connect_timeout_ms: ble::CONNECT_TIMEOUT.as_millis() as u64,
            discover_timeout_ms: ble::DISCOVER_TIMEOUT.as_millis() as u64,
            mtu_timeout_ms: ble::MTU_TIMEOUT.as_millis() as u64,
            write_timeout_ms: ble::WRITE_TIMEOUT.as_millis() as u64,
            mtu_request: ble::DEFAULT_MTU_REQUEST,
            prefer_acknowledged_write: true,
        }
    }
}

impl BleConfig {
    /// Discovery strategy selected by this configuration.
    pub fn target(&self) -> DeviceTarget {
        match self.fixed_address.as_deref().map(str::trim) {
            Some(address) if !address.is_empty() => DeviceTarget::FixedAddress(address.to_string()),
            _ => DeviceTarget::ServiceFilter(ScanFilter::new(
                self.service_uuid,
                self.name_hint.clone(),
            )),
        }
    }

    pub fn guard_timeout(&self) -> Duration {
        Duration::from_millis(self.guard_timeout_ms)
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn discover_timeout(&self) -> Duration {
        Duration::from_millis(self.discover_timeout_ms)
    }

    pub fn mtu_timeout(&self) -> Duration {
        Duration::from_millis(self.mtu_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    /// Upper bound on one attempt: the sum of every stage budget.
    pub fn attempt_budget(&self) -> Duration {
        self.guard_timeout()
            + self.scan_timeout()
            + self.connect_timeout()
            + self.discover_timeout()
            + self.mtu_timeout()
            + self.write_timeout()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Gate identifier sent along with the token.
    pub gate_id: Option<String>,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            gate_id: Some("gate-01".to_string()),
        }
    }
}

impl Config {
    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("openway")
            .join("config.toml")
    }

    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load from `path`, writing defaults there if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Ok(toml::from_str(&content)?)
        } else {
            let config = Self::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    /// Save configuration to file.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
