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

//! Bluetooth communication module.
//!
//! Handles the GATT central that writes access tokens to a gate controller.

pub mod ble_constants;
mod bluez;
mod bridge;
mod client;
mod guard;
mod outcome;
mod platform;
mod request;
mod session;

pub use bluez::BluezPlatform;
pub use bridge::{CallbackBridge, DiscoveryResult};
pub use client::BleClient;
pub use guard::{ensure_ready, Readiness};
pub use outcome::{FailureReason, TransferOutcome};
pub use platform::{
    AdapterStatus, BlePlatform, CharacteristicInfo, CharacteristicProperties, CharacteristicRef,
    GattLink, GattStatus, LinkFault, LinkState, Permission, PermissionModel, PlatformError,
    RemoteDevice, ScanFilter, ScanHandle, ScanRecord, ServiceInfo, Transport, WriteMode,
};
pub use request::{parse_address, DeviceTarget, RequestError, TransferRequest};
pub use session::{locate_characteristic, select_write_mode, LinkSession};
