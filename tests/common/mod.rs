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

//! Scripted host stack for delivery tests.
//!
//! Every initiator answers synchronously through the bridge, or stays silent
//! so the stage deadline fires.

#![allow(dead_code)]

use async_trait::async_trait;
use openway_ble::bluetooth::ble_constants::{SERVICE_UUID, TOKEN_CHAR_UUID};
use openway_ble::bluetooth::{
    AdapterStatus, BlePlatform, CallbackBridge, CharacteristicInfo, CharacteristicProperties,
    CharacteristicRef, DiscoveryResult, GattLink, GattStatus, LinkFault, LinkState,
    PermissionModel, PlatformError, RemoteDevice, ScanFilter, ScanHandle, ScanRecord, ServiceInfo,
    Transport, WriteMode,
};
use openway_ble::config::BleConfig;
use parking_lot::Mutex;
use std::sync::Arc;

pub const GATE_ADDRESS: &str = "24:0A:C4:12:34:56";

/// How the link answers a connect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReply {
    Connected,
    Disconnected,
    Silent,
}

/// Host call that never returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stall {
    AdapterStatus,
    StartScan,
    Connect,
}

/// What the link does when asked to enumerate services.
#[derive(Debug, Clone)]
pub enum DiscoverReply {
    Answer(DiscoveryResult),
    Silent,
    /// Link drops instead of answering.
    Drop,
    /// Adapter switches off instead of answering.
    AdapterOff,
    /// Bluetooth permission is withdrawn instead of answering.
    PermissionRevoked,
}

/// Behaviour of the mock host for one test.
#[derive(Debug, Clone)]
pub struct Script {
    pub status: AdapterStatus,
    pub advertisement: Option<ScanRecord>,
    pub scan_error: Option<PlatformError>,
    pub connect: ConnectReply,
    pub discover: DiscoverReply,
    /// `None` leaves the MTU request unanswered.
    pub mtu: Option<Result<u16, GattStatus>>,
    /// `None` leaves the write unanswered.
    pub write: Option<Result<(), GattStatus>>,
    pub stall: Option<Stall>,
}

impl Script {
    /// A gate that does everything right.
    pub fn happy() -> Self {
        Self {
            status: ready_status(),
            advertisement: Some(gate_advertisement(Some("OpenWay ESP32"))),
            scan_error: None,
            connect: ConnectReply::Connected,
            discover: DiscoverReply::Answer(Ok(gate_services(CharacteristicProperties {
                read: true,
                write: true,
                ..Default::default()
            }))),
            mtu: Some(Ok(100)),
            write: Some(Ok(())),
            stall: None,
        }
    }
}

pub fn ready_status() -> AdapterStatus {
    AdapterStatus {
        present: true,
        powered: true,
        permission_model: PermissionModel::Modern,
        granted: PermissionModel::Modern.required(),
    }
}

pub fn gate_advertisement(name: Option<&str>) -> ScanRecord {
    ScanRecord {
        device: RemoteDevice {
            address: GATE_ADDRESS.to_string(),
            name: name.map(str::to_string),
        },
        service_uuids: vec![SERVICE_UUID],
        rssi: Some(-58),
    }
}

pub fn gate_services(properties: CharacteristicProperties) -> Vec<ServiceInfo> {
    vec![ServiceInfo {
        uuid: SERVICE_UUID,
        characteristics: vec![CharacteristicInfo {
            uuid: TOKEN_CHAR_UUID,
            properties,
        }],
    }]
}

/// Everything the mock was asked to do, in order.
#[derive(Debug, Default)]
pub struct Calls {
    pub log: Vec<&'static str>,
    pub scans_started: usize,
    pub scans_stopped: usize,
    pub connects: Vec<String>,
    pub mtu_requests: Vec<u16>,
    pub writes: Vec<(Vec<u8>, WriteMode)>,
    pub disconnects: usize,
    pub closes: usize,
    pub open_links: usize,
    pub max_open_links: usize,
}

pub struct MockPlatform {
    script: Script,
    calls: Arc<Mutex<Calls>>,
}

impl MockPlatform {
    pub fn new(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: Arc::new(Mutex::new(Calls::default())),
        })
    }

    pub fn calls(&self) -> parking_lot::MutexGuard<'_, Calls> {
        self.calls.lock()
    }
}

#[async_trait]
impl BlePlatform for MockPlatform {
    async fn adapter_status(&self) -> AdapterStatus {
        if self.script.stall == Some(Stall::AdapterStatus) {
            std::future::pending::<()>().await;
        }
        self.script.status.clone()
    }

    async fn start_scan(
        &self,
        _filter: &ScanFilter,
        bridge: Arc<CallbackBridge>,
    ) -> Result<Box<dyn ScanHandle>, PlatformError> {
        if self.script.stall == Some(Stall::StartScan) {
            std::future::pending::<()>().await;
        }
        if let Some(e) = &self.script.scan_error {
            return Err(e.clone());
        }
        {
            let mut calls = self.calls.lock();
            calls.scans_started += 1;
            calls.log.push("scan");
        }
        if let Some(record) = &self.script.advertisement {
            bridge.on_scan_result(record.clone());
        }
        Ok(Box::new(MockScan {
            calls: self.calls.clone(),
            stopped: false,
        }))
    }

    fn remote_device(&self, address: &str) -> Result<RemoteDevice, PlatformError> {
        Ok(RemoteDevice {
            address: address.to_string(),
            name: None,
        })
    }

    async fn connect(
        &self,
        device: &RemoteDevice,
        _transport: Transport,
        bridge: Arc<CallbackBridge>,
    ) -> Result<Box<dyn GattLink>, PlatformError> {
        if self.script.stall == Some(Stall::Connect) {
            std::future::pending::<()>().await;
        }
        {
            let mut calls = self.calls.lock();
            calls.connects.push(device.address.clone());
            calls.log.push("connect");
            calls.open_links += 1;
            calls.max_open_links = calls.max_open_links.max(calls.open_links);
        }
        match self.script.connect {
            ConnectReply::Connected => bridge.on_connection_state_change(LinkState::Connected),
            ConnectReply::Disconnected => {
                bridge.on_connection_state_change(LinkState::Disconnected)
            }
            ConnectReply::Silent => (),
        }
        Ok(Box::new(MockLink {
            script: self.script.clone(),
            bridge,
            calls: self.calls.clone(),
        }))
    }
}

struct MockScan {
    calls: Arc<Mutex<Calls>>,
    stopped: bool,
}

impl ScanHandle for MockScan {
    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            let mut calls = self.calls.lock();
            calls.scans_stopped += 1;
            calls.log.push("scan_stop");
        }
    }
}

impl Drop for MockScan {
    fn drop(&mut self) {
        self.stop();
    }
}

struct MockLink {
    script: Script,
    bridge: Arc<CallbackBridge>,
    calls: Arc<Mutex<Calls>>,
}

impl GattLink for MockLink {
    fn discover_services(&self) -> Result<(), PlatformError> {
        self.calls.lock().log.push("discover");
        match &self.script.discover {
            DiscoverReply::Answer(result) => self.bridge.on_services_discovered(result.clone()),
            DiscoverReply::Silent => (),
            DiscoverReply::Drop => self
                .bridge
                .on_connection_state_change(LinkState::Disconnected),
            DiscoverReply::AdapterOff => self.bridge.raise(LinkFault::AdapterOff),
            DiscoverReply::PermissionRevoked => self.bridge.raise(LinkFault::PermissionRevoked),
        }
        Ok(())
    }

    fn request_mtu(&self, mtu: u16, _target: CharacteristicRef) -> Result<(), PlatformError> {
        {
            let mut calls = self.calls.lock();
            calls.mtu_requests.push(mtu);
            calls.log.push("mtu");
        }
        if let Some(result) = self.script.mtu {
            self.bridge.on_mtu_changed(result);
        }
        Ok(())
    }

    fn write(
        &self,
        _target: CharacteristicRef,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), PlatformError> {
        {
            let mut calls = self.calls.lock();
            calls.writes.push((value.to_vec(), mode));
            calls.log.push("write");
        }
        if let Some(result) = self.script.write {
            self.bridge.on_characteristic_write(result);
        }
        Ok(())
    }

    fn disconnect(&self) -> Result<(), PlatformError> {
        let mut calls = self.calls.lock();
        calls.disconnects += 1;
        calls.log.push("disconnect");
        Ok(())
    }

    fn close(&self) {
        let mut calls = self.calls.lock();
        calls.closes += 1;
        calls.open_links -= 1;
        calls.log.push("close");
    }
}

/// Default configuration; the mock gate advertises its UUIDs and name hint.
pub fn config() -> BleConfig {
    BleConfig::default()
}
