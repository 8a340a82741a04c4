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

//! Seam between the delivery state machine and the host Bluetooth stack.
//!
//! The host stack owns the radio. Operations are started through these traits
//! and return as soon as the request has been queued; completion is reported
//! through the [`CallbackBridge`] handed over when scanning or connecting.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use super::bridge::CallbackBridge;

/// Errors reported by the host Bluetooth stack.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Bluetooth adapter is powered off")]
    AdapterOff,

    #[error("Bluetooth permission revoked")]
    PermissionRevoked,

    #[error("Invalid Bluetooth address: {0}")]
    InvalidAddress(String),

    #[error("Link is not connected")]
    NotConnected,

    #[error("Bluetooth backend error: {0}")]
    Backend(String),
}

/// Runtime authorization scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Permission {
    BluetoothScan,
    BluetoothConnect,
    /// Location access, required for scanning on older platform releases.
    FineLocation,
}

/// Which set of scopes the host platform asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionModel {
    /// Dedicated scan/connect scopes.
    Modern,
    /// Location-based scope.
    Legacy,
}

impl PermissionModel {
    /// Scopes that must be granted before any radio operation.
    pub fn required(&self) -> BTreeSet<Permission> {
        match self {
            PermissionModel::Modern => {
                BTreeSet::from([Permission::BluetoothScan, Permission::BluetoothConnect])
            }
            PermissionModel::Legacy => BTreeSet::from([Permission::FineLocation]),
        }
    }
}

/// Snapshot of adapter capability as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterStatus {
    pub present: bool,
    pub powered: bool,
    pub permission_model: PermissionModel,
    pub granted: BTreeSet<Permission>,
}

/// A peripheral the host can open a link to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDevice {
    /// Hardware address, upper-case colon form.
    pub address: String,
    pub name: Option<String>,
}

/// One advertisement seen while scanning.
#[derive(Debug, Clone)]
pub struct ScanRecord {
    pub device: RemoteDevice,
    pub service_uuids: Vec<Uuid>,
    pub rssi: Option<i16>,
}

/// Advertisement filter for scan-based discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanFilter {
    pub service_uuid: Uuid,
    pub name_hint: Option<String>,
}

impl ScanFilter {
    pub fn new(service_uuid: Uuid, name_hint: Option<String>) -> Self {
        let name_hint = name_hint.filter(|n| !n.trim().is_empty());
        Self {
            service_uuid,
            name_hint,
        }
    }

    /// Service UUID must be advertised; the name hint, if set, must match exactly.
    pub fn matches(&self, record: &ScanRecord) -> bool {
        if !record.service_uuids.contains(&self.service_uuid) {
            return false;
        }
        match &self.name_hint {
            Some(hint) => record.device.name.as_deref() == Some(hint.as_str()),
            None => true,
        }
    }
}

/// Link-layer transport. Only low energy is ever requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Le,
}

/// Connection state reported by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// Capabilities a characteristic advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

/// (service, characteristic) pair resolved from a discovered service tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CharacteristicRef {
    pub service: Uuid,
    pub characteristic: Uuid,
}

/// How a characteristic value is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteMode {
    /// Write request, acknowledged by the peripheral.
    WithResponse,
    /// Write command, no acknowledgement.
    WithoutResponse,
}

/// Host status code attached to a failed GATT operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattStatus(pub u8);

impl GattStatus {
    pub const FAILURE: GattStatus = GattStatus(0x85);
}

/// Condition that ends any in-flight stage immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkFault {
    AdapterOff,
    PermissionRevoked,
    LinkLost,
}

/// Stops an in-flight scan. Dropping the handle must stop it as well.
pub trait ScanHandle: Send {
    fn stop(&mut self);
}

/// An open GATT link to one peripheral.
///
/// Initiators return once the request is queued; results arrive on the
/// bridge the link was opened with.
pub trait GattLink: Send + Sync {
    fn discover_services(&self) -> Result<(), PlatformError>;

    /// `target` is the characteristic the payload goes to next; the exchange
    /// must leave it writable.
    fn request_mtu(&self, mtu: u16, target: CharacteristicRef) -> Result<(), PlatformError>;

    fn write(
        &self,
        target: CharacteristicRef,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), PlatformError>;

    fn disconnect(&self) -> Result<(), PlatformError>;

    /// Release the underlying link handle.
    fn close(&self);
}

/// Host Bluetooth stack, shared with every other BLE consumer in the process.
#[async_trait]
pub trait BlePlatform: Send + Sync {
    async fn adapter_status(&self) -> AdapterStatus;

    async fn start_scan(
        &self,
        filter: &ScanFilter,
        bridge: Arc<CallbackBridge>,
    ) -> Result<Box<dyn ScanHandle>, PlatformError>;

    /// Resolve a device handle without touching the radio.
    fn remote_device(&self, address: &str) -> Result<RemoteDevice, PlatformError>;

    async fn connect(
        &self,
        device: &RemoteDevice,
        transport: Transport,
        bridge: Arc<CallbackBridge>,
    ) -> Result<Box<dyn GattLink>, PlatformError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: Option<&str>, uuids: Vec<Uuid>) -> ScanRecord {
        ScanRecord {
            device: RemoteDevice {
                address: "24:0A:C4:00:11:22".to_string(),
                name: name.map(str::to_string),
            },
            service_uuids: uuids,
            rssi: Some(-60),
        }
    }

    #[test]
    fn test_filter_requires_service() {
        let svc = Uuid::from_u128(1);
        let filter = ScanFilter::new(svc, None);
        assert!(filter.matches(&record(None, vec![svc])));
        assert!(!filter.matches(&record(None, vec![Uuid::from_u128(2)])));
    }

    #[test]
    fn test_filter_name_hint() {
        let svc = Uuid::from_u128(1);
        let filter = ScanFilter::new(svc, Some("OpenWay ESP32".to_string()));
        assert!(filter.matches(&record(Some("OpenWay ESP32"), vec![svc])));
        assert!(!filter.matches(&record(Some("Other"), vec![svc])));
        assert!(!filter.matches(&record(None, vec![svc])));
    }

    #[test]
    fn test_blank_name_hint_ignored() {
        let filter = ScanFilter::new(Uuid::from_u128(1), Some("  ".to_string()));
        assert_eq!(filter.name_hint, None);
    }

    #[test]
    fn test_permission_sets() {
        assert_eq!(
            PermissionModel::Modern.required(),
            BTreeSet::from([Permission::BluetoothScan, Permission::BluetoothConnect])
        );
        assert_eq!(
            PermissionModel::Legacy.required(),
            BTreeSet::from([Permission::FineLocation])
        );
    }
}
