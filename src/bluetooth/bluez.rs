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

//! BlueZ backend for the delivery client (GATT central role).

use anyhow::Result;
use async_trait::async_trait;
use bluer::gatt::remote::{Characteristic, CharacteristicWriteRequest};
use bluer::gatt::{CharacteristicWriter, WriteOp};
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, AddressType, Device, DeviceEvent,
    DeviceProperty, DiscoveryFilter, DiscoveryTransport, ErrorKind, Session,
};
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::bridge::CallbackBridge;
use super::platform::{
    AdapterStatus, BlePlatform, CharacteristicInfo, CharacteristicProperties, CharacteristicRef,
    GattLink, GattStatus, LinkFault, LinkState, PermissionModel, PlatformError, RemoteDevice,
    ScanFilter, ScanHandle, ScanRecord, ServiceInfo, Transport, WriteMode,
};

/// RSSI BlueZ reports for a device it can no longer hear.
const RSSI_FLOOR: i16 = -200;

/// Retries of a write while BlueZ releases an acquired write socket.
const RELEASE_RETRIES: u32 = 3;
const RELEASE_BACKOFF: Duration = Duration::from_millis(100);

/// BlueZ replays devices it cached earlier; only a live RSSI means the
/// device is advertising now.
fn advertising_now(rssi: Option<i16>) -> bool {
    matches!(rssi, Some(rssi) if rssi > RSSI_FLOOR)
}

/// An address BlueZ holds no object for must be connected by address.
fn needs_direct_connect(cached: &[Address], addr: Address) -> bool {
    !cached.contains(&addr)
}

/// Probe order for the MTU: the target goes last, since acquiring it blocks
/// plain writes to it.
fn mtu_probe_order<T>(mut candidates: Vec<(CharacteristicRef, T)>, target: CharacteristicRef) -> Vec<(CharacteristicRef, T)> {
    candidates.sort_by_key(|(chr_ref, _)| *chr_ref == target);
    candidates
}

fn retry_after_release(kind: &ErrorKind, released: bool, attempts: u32) -> bool {
    released && matches!(kind, ErrorKind::NotPermitted) && attempts < RELEASE_RETRIES
}

fn map_err(e: bluer::Error) -> PlatformError {
    match e.kind {
        ErrorKind::NotReady => PlatformError::AdapterOff,
        ErrorKind::NotAuthorized | ErrorKind::NotPermitted => PlatformError::PermissionRevoked,
        _ => PlatformError::Backend(e.to_string()),
    }
}

/// Host Bluetooth stack reached through BlueZ over D-Bus.
pub struct BluezPlatform {
    _session: Session,
    adapter: Option<Adapter>,
}

impl BluezPlatform {
    /// Connect to BlueZ and pick the default adapter, if there is one.
    pub async fn new() -> Result<Self> {
        let session = Session::new().await?;
        info!("BlueZ session created");

        let adapter = match session.default_adapter().await {
            Ok(adapter) => {
                info!("Using Bluetooth adapter: {}", adapter.name());
                Some(adapter)
            }
            Err(e) => {
                warn!("No Bluetooth adapter available: {}", e);
                None
            }
        };

        Ok(Self {
            _session: session,
            adapter,
        })
    }

    fn adapter(&self) -> Result<&Adapter, PlatformError> {
        self.adapter
            .as_ref()
            .ok_or_else(|| PlatformError::Backend("no Bluetooth adapter".to_string()))
    }
}

#[async_trait]
impl BlePlatform for BluezPlatform {
    async fn adapter_status(&self) -> AdapterStatus {
        let (present, powered) = match &self.adapter {
            Some(adapter) => (true, adapter.is_powered().await.unwrap_or(false)),
            None => (false, false),
        };
        // BlueZ grants access through D-Bus policy; there are no runtime prompts.
        let permission_model = PermissionModel::Modern;
        AdapterStatus {
            present,
            powered,
            permission_model,
            granted: permission_model.required(),
        }
    }

    async fn start_scan(
        &self,
        filter: &ScanFilter,
        bridge: Arc<CallbackBridge>,
    ) -> Result<Box<dyn ScanHandle>, PlatformError> {
        let adapter = self.adapter()?.clone();

        let discovery_filter = DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            uuids: HashSet::from([filter.service_uuid]),
            ..Default::default()
        };
        adapter
            .set_discovery_filter(discovery_filter)
            .await
            .map_err(map_err)?;

        // Property changes re-emit DeviceAdded, so a cached gate that starts
        // advertising is seen again once its RSSI appears.
        let events = adapter
            .discover_devices_with_changes()
            .await
            .map_err(map_err)?;
        info!("Discovering on adapter {}", adapter.name());

        let task = tokio::spawn(async move {
            let mut events = Box::pin(events);
            while let Some(event) = events.next().await {
                match event {
                    AdapterEvent::DeviceAdded(addr) => match scan_record(&adapter, addr).await {
                        Ok(Some(record)) => {
                            if bridge.on_scan_result(record) {
                                break;
                            }
                        }
                        Ok(None) => debug!("Device {} not in range; skipping", addr),
                        Err(e) => debug!("Skipping {}: {}", addr, e),
                    },
                    AdapterEvent::PropertyChanged(AdapterProperty::Powered(false)) => {
                        bridge.raise(LinkFault::AdapterOff);
                        break;
                    }
                    _ => (),
                }
            }
            debug!("Discovery stream closed");
        });

        Ok(Box::new(BluezScan { task: Some(task) }))
    }

    fn remote_device(&self, address: &str) -> Result<RemoteDevice, PlatformError> {
        let addr: Address = address
            .parse()
            .map_err(|_| PlatformError::InvalidAddress(address.to_string()))?;
        self.adapter()?.device(addr).map_err(map_err)?;
        Ok(RemoteDevice {
            address: addr.to_string(),
            name: None,
        })
    }

    async fn connect(
        &self,
        device: &RemoteDevice,
        _transport: Transport,
        bridge: Arc<CallbackBridge>,
    ) -> Result<Box<dyn GattLink>, PlatformError> {
        let adapter = self.adapter()?.clone();
        let addr: Address = device
            .address
            .parse()
            .map_err(|_| PlatformError::InvalidAddress(device.address.clone()))?;
        let cached = adapter.device_addresses().await.map_err(map_err)?;
        let known = !needs_direct_connect(&cached, addr);
        let link = BluezLink::open(adapter, addr, known, bridge).await?;
        Ok(Box::new(link))
    }
}

async fn scan_record(adapter: &Adapter, addr: Address) -> bluer::Result<Option<ScanRecord>> {
    let device = adapter.device(addr)?;
    let rssi = device.rssi().await?;
    if !advertising_now(rssi) {
        return Ok(None);
    }
    let name = device.name().await?;
    let service_uuids = device
        .uuids()
        .await?
        .unwrap_or_default()
        .into_iter()
        .collect();
    Ok(Some(ScanRecord {
        device: RemoteDevice {
            address: addr.to_string(),
            name,
        },
        service_uuids,
        rssi,
    }))
}

/// Stops discovery by dropping the event stream.
struct BluezScan {
    task: Option<JoinHandle<()>>,
}

impl ScanHandle for BluezScan {
    fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for BluezScan {
    fn drop(&mut self) {
        self.stop();
    }
}

/// GATT link to one device. Operations run on background tasks and report
/// back through the bridge.
struct BluezLink {
    device: Device,
    bridge: Arc<CallbackBridge>,
    runtime: Handle,
    characteristics: Arc<Mutex<HashMap<CharacteristicRef, Characteristic>>>,
    /// Write socket acquired on the token characteristic while learning the MTU.
    held_writer: Arc<Mutex<Option<(CharacteristicRef, CharacteristicWriter)>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl BluezLink {
    /// `known` is false for an address BlueZ has never seen; such a device is
    /// reached with a direct LE connect instead of its (missing) object.
    async fn open(
        adapter: Adapter,
        addr: Address,
        known: bool,
        bridge: Arc<CallbackBridge>,
    ) -> Result<Self, PlatformError> {
        let device = adapter.device(addr).map_err(map_err)?;
        let device_events = device.events().await.map_err(map_err)?;
        let adapter_events = adapter.events().await.map_err(map_err)?;

        let link = Self {
            device: device.clone(),
            bridge: bridge.clone(),
            runtime: Handle::current(),
            characteristics: Arc::new(Mutex::new(HashMap::new())),
            held_writer: Arc::new(Mutex::new(None)),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        };

        {
            let bridge = bridge.clone();
            link.spawn(async move {
                let mut device_events = Box::pin(device_events);
                let mut adapter_events = Box::pin(adapter_events);
                loop {
                    tokio::select! {
                        Some(event) = device_events.next() => {
                            if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                                bridge.on_connection_state_change(LinkState::Disconnected);
                            }
                        }
                        Some(event) = adapter_events.next() => {
                            if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(false)) = event {
                                bridge.raise(LinkFault::AdapterOff);
                            }
                        }
                        else => break,
                    }
                }
            });
        }

        link.spawn(async move {
            let connected = if known {
                device.connect().await
            } else {
                debug!("{} not cached by BlueZ; connecting by address", addr);
                adapter
                    .connect_device(addr, AddressType::LePublic)
                    .await
                    .map(|_| ())
            };
            match connected {
                Ok(()) => bridge.on_connection_state_change(LinkState::Connected),
                Err(e) => {
                    warn!("Connect to {} failed: {}", addr, e);
                    bridge.on_connection_state_change(LinkState::Disconnected);
                }
            }
        });

        Ok(link)
    }

    fn spawn<F>(&self, future: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let task = self.runtime.spawn(future);
        self.tasks.lock().push(task);
    }

    fn ensure_open(&self) -> Result<(), PlatformError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PlatformError::NotConnected);
        }
        Ok(())
    }
}

/// Wait for BlueZ to resolve services, then collect the tree.
async fn enumerate(
    device: &Device,
) -> Result<(Vec<ServiceInfo>, HashMap<CharacteristicRef, Characteristic>), PlatformError> {
    // Subscribe before checking so the resolved event cannot slip past.
    let events = device.events().await.map_err(map_err)?;
    if !device.is_services_resolved().await.map_err(map_err)? {
        let mut events = Box::pin(events);
        loop {
            match events.next().await {
                Some(DeviceEvent::PropertyChanged(DeviceProperty::ServicesResolved(true))) => break,
                Some(DeviceEvent::PropertyChanged(DeviceProperty::Connected(false))) | None => {
                    return Err(PlatformError::NotConnected)
                }
                Some(_) => (),
            }
        }
    }

    let mut services = Vec::new();
    let mut handles = HashMap::new();
    for service in device.services().await.map_err(map_err)? {
        let service_uuid = service.uuid().await.map_err(map_err)?;
        let mut characteristics = Vec::new();
        for characteristic in service.characteristics().await.map_err(map_err)? {
            let uuid = characteristic.uuid().await.map_err(map_err)?;
            let flags = characteristic.flags().await.map_err(map_err)?;
            characteristics.push(CharacteristicInfo {
                uuid,
                properties: CharacteristicProperties {
                    read: flags.read,
                    write: flags.write,
                    write_without_response: flags.write_without_response,
                    notify: flags.notify,
                },
            });
            handles.insert(
                CharacteristicRef {
                    service: service_uuid,
                    characteristic: uuid,
                },
                characteristic,
            );
        }
        services.push(ServiceInfo {
            uuid: service_uuid,
            characteristics,
        });
    }
    Ok((services, handles))
}

/// Plain write. A write socket dropped just before is released by BlueZ
/// asynchronously; until then the write is refused as not permitted.
async fn write_value(
    characteristic: &Characteristic,
    value: &[u8],
    request: &CharacteristicWriteRequest,
    released: bool,
) -> bluer::Result<()> {
    let mut attempts = 0;
    loop {
        match characteristic.write_ext(value, request).await {
            Err(e) if retry_after_release(&e.kind, released, attempts) => {
                attempts += 1;
                debug!("Write socket not yet released; retrying ({})", attempts);
                tokio::time::sleep(RELEASE_BACKOFF).await;
            }
            other => return other,
        }
    }
}

impl GattLink for BluezLink {
    fn discover_services(&self) -> Result<(), PlatformError> {
        self.ensure_open()?;
        let device = self.device.clone();
        let bridge = self.bridge.clone();
        let characteristics = self.characteristics.clone();
        self.spawn(async move {
            match enumerate(&device).await {
                Ok((services, handles)) => {
                    *characteristics.lock() = handles;
                    bridge.on_services_discovered(Ok(services));
                }
                Err(e) => {
                    warn!("Service enumeration failed: {}", e);
                    bridge.on_services_discovered(Err(GattStatus::FAILURE));
                }
            }
        });
        Ok(())
    }

    fn request_mtu(&self, mtu: u16, target: CharacteristicRef) -> Result<(), PlatformError> {
        self.ensure_open()?;
        // BlueZ exchanges the ATT MTU on its own when the link comes up; the
        // value is learned from an acquired write socket.
        debug!("MTU {} requested; reading BlueZ negotiated value", mtu);
        let candidates: Vec<(CharacteristicRef, Characteristic)> = self
            .characteristics
            .lock()
            .iter()
            .map(|(chr_ref, chr)| (*chr_ref, chr.clone()))
            .collect();
        let candidates = mtu_probe_order(candidates, target);

        let bridge = self.bridge.clone();
        let held_writer = self.held_writer.clone();
        self.spawn(async move {
            for (chr_ref, characteristic) in candidates {
                match characteristic.flags().await {
                    Ok(flags) if flags.write_without_response => (),
                    _ => continue,
                }
                match characteristic.write_io().await {
                    Ok(writer) => {
                        let negotiated = u16::try_from(writer.mtu()).unwrap_or(u16::MAX);
                        if chr_ref == target {
                            *held_writer.lock() = Some((chr_ref, writer));
                        }
                        bridge.on_mtu_changed(Ok(negotiated));
                        return;
                    }
                    Err(e) => debug!("Could not acquire write socket: {}", e),
                }
            }
            bridge.on_mtu_changed(Err(GattStatus::FAILURE));
        });
        Ok(())
    }

    fn write(
        &self,
        target: CharacteristicRef,
        value: &[u8],
        mode: WriteMode,
    ) -> Result<(), PlatformError> {
        self.ensure_open()?;
        let characteristic = self
            .characteristics
            .lock()
            .get(&target)
            .cloned()
            .ok_or_else(|| PlatformError::Backend(format!("{:?} not discovered", target)))?;
        let held = self
            .held_writer
            .lock()
            .take()
            .filter(|(chr_ref, _)| *chr_ref == target)
            .map(|(_, writer)| writer);
        let request = CharacteristicWriteRequest {
            op_type: match mode {
                WriteMode::WithResponse => WriteOp::Request,
                WriteMode::WithoutResponse => WriteOp::Command,
            },
            ..Default::default()
        };
        let value = value.to_vec();
        let bridge = self.bridge.clone();
        self.spawn(async move {
            let result = match (mode, held) {
                (WriteMode::WithoutResponse, Some(writer)) => {
                    writer.send(&value).await.map_err(|e| e.to_string())
                }
                (_, held) => {
                    let released = held.is_some();
                    drop(held);
                    write_value(&characteristic, &value, &request, released)
                        .await
                        .map_err(|e| e.to_string())
                }
            };
            bridge.on_characteristic_write(result.map_err(|e| {
                warn!("Characteristic write failed: {}", e);
                GattStatus::FAILURE
            }));
        });
        Ok(())
    }

    fn disconnect(&self) -> Result<(), PlatformError> {
        self.ensure_open()?;
        let device = self.device.clone();
        // Not tracked: must outlive close().
        self.runtime.spawn(async move {
            if let Err(e) = device.disconnect().await {
                debug!("Disconnect of {}: {}", device.address(), e);
            }
        });
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.held_writer.lock().take();
        self.characteristics.lock().clear();
    }
}

impl Drop for BluezLink {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cached_devices_are_not_advertising() {
        assert!(!advertising_now(None));
        assert!(!advertising_now(Some(RSSI_FLOOR)));
        assert!(!advertising_now(Some(-255)));
        assert!(advertising_now(Some(-58)));
        assert!(advertising_now(Some(-199)));
    }

    #[test]
    fn test_uncached_address_connects_directly() {
        let gate: Address = "24:0A:C4:12:34:56".parse().unwrap();
        let other: Address = "24:0A:C4:00:00:01".parse().unwrap();
        assert!(needs_direct_connect(&[], gate));
        assert!(needs_direct_connect(&[other], gate));
        assert!(!needs_direct_connect(&[other, gate], gate));
    }

    #[test]
    fn test_mtu_probe_tries_target_last() {
        let chr = |n: u128| CharacteristicRef {
            service: uuid::Uuid::from_u128(1),
            characteristic: uuid::Uuid::from_u128(n),
        };
        let target = chr(0x11);
        let order = mtu_probe_order(vec![(target, "token"), (chr(0x12), "status"), (chr(0x13), "log")], target);
        assert_eq!(order.last().map(|(r, _)| *r), Some(target));
        assert_eq!(order.len(), 3);

        let only_target = mtu_probe_order(vec![(target, "token")], target);
        assert_eq!(only_target[0].0, target);
    }

    #[test]
    fn test_write_retries_only_after_release() {
        assert!(retry_after_release(&ErrorKind::NotPermitted, true, 0));
        assert!(!retry_after_release(&ErrorKind::NotPermitted, true, RELEASE_RETRIES));
        assert!(!retry_after_release(&ErrorKind::NotPermitted, false, 0));
        assert!(!retry_after_release(&ErrorKind::Failed, true, 0));
    }
}
