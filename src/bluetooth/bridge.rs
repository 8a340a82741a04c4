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

//! Bridges host Bluetooth callbacks into awaitable stage results.
//!
//! Each pending operation gets a single-resolution slot. A stage arms its slot,
//! starts the host operation and awaits the receiver. The host may call back
//! from any thread and may call back more than once; only the first call after
//! arming is delivered, the rest are dropped.

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tracing::debug;

use super::platform::{GattStatus, LinkFault, LinkState, RemoteDevice, ScanFilter, ScanRecord, ServiceInfo};

/// Discovery result as reported by the host.
pub type DiscoveryResult = Result<Vec<ServiceInfo>, GattStatus>;

/// Single-resolution slot for one pending operation.
struct Slot<T> {
    name: &'static str,
    tx: Mutex<Option<oneshot::Sender<T>>>,
}

impl<T> Slot<T> {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            tx: Mutex::new(None),
        }
    }

    fn arm(&self) -> oneshot::Receiver<T> {
        let (tx, rx) = oneshot::channel();
        *self.tx.lock() = Some(tx);
        rx
    }

    fn resolve(&self, value: T) -> bool {
        match self.tx.lock().take() {
            Some(tx) => tx.send(value).is_ok(),
            None => {
                debug!("Ignoring {} callback with no pending wait", self.name);
                false
            }
        }
    }

    fn is_armed(&self) -> bool {
        self.tx.lock().is_some()
    }

    fn disarm(&self) {
        self.tx.lock().take();
    }
}

/// Callback target handed to the host stack for one delivery attempt.
pub struct CallbackBridge {
    scan: Mutex<Option<(ScanFilter, oneshot::Sender<RemoteDevice>)>>,
    connection: Slot<LinkState>,
    discovery: Slot<DiscoveryResult>,
    mtu: Slot<Result<u16, GattStatus>>,
    write: Slot<Result<(), GattStatus>>,
    fault_tx: watch::Sender<Option<LinkFault>>,
}

impl Default for CallbackBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackBridge {
    pub fn new() -> Self {
        let (fault_tx, _) = watch::channel(None);
        Self {
            scan: Mutex::new(None),
            connection: Slot::new("connection"),
            discovery: Slot::new("discovery"),
            mtu: Slot::new("mtu"),
            write: Slot::new("write"),
            fault_tx,
        }
    }

    // --- arming (called by the session) ---

    pub fn arm_scan(&self, filter: ScanFilter) -> oneshot::Receiver<RemoteDevice> {
        let (tx, rx) = oneshot::channel();
        *self.scan.lock() = Some((filter, tx));
        rx
    }

    pub fn arm_connection(&self) -> oneshot::Receiver<LinkState> {
        self.connection.arm()
    }

    pub fn arm_discovery(&self) -> oneshot::Receiver<DiscoveryResult> {
        self.discovery.arm()
    }

    pub fn arm_mtu(&self) -> oneshot::Receiver<Result<u16, GattStatus>> {
        self.mtu.arm()
    }

    pub fn arm_write(&self) -> oneshot::Receiver<Result<(), GattStatus>> {
        self.write.arm()
    }

    /// Drop every pending wait. Late callbacks are ignored afterwards.
    pub fn disarm_all(&self) {
        self.scan.lock().take();
        self.connection.disarm();
        self.discovery.disarm();
        self.mtu.disarm();
        self.write.disarm();
    }

    pub fn subscribe_faults(&self) -> watch::Receiver<Option<LinkFault>> {
        self.fault_tx.subscribe()
    }

    pub fn fault(&self) -> Option<LinkFault> {
        *self.fault_tx.borrow()
    }

    // --- host callbacks ---

    /// Advertisement seen. Resolves the scan wait on the first match only.
    pub fn on_scan_result(&self, record: ScanRecord) -> bool {
        let mut scan = self.scan.lock();
        let matched = matches!(scan.as_ref(), Some((filter, _)) if filter.matches(&record));
        if !matched {
            return false;
        }
        match scan.take() {
            Some((_, tx)) => {
                debug!("Scan matched {}", record.device.address);
                tx.send(record.device).is_ok()
            }
            None => false,
        }
    }

    pub fn on_connection_state_change(&self, state: LinkState) {
        debug!("Connection state changed: {:?}", state);
        if self.connection.is_armed() {
            self.connection.resolve(state);
        } else if state == LinkState::Disconnected {
            self.raise(LinkFault::LinkLost);
        }
    }

    pub fn on_services_discovered(&self, result: DiscoveryResult) {
        self.discovery.resolve(result);
    }

    pub fn on_mtu_changed(&self, result: Result<u16, GattStatus>) {
        self.mtu.resolve(result);
    }

    pub fn on_characteristic_write(&self, result: Result<(), GattStatus>) {
        self.write.resolve(result);
    }

    /// Adapter-level condition. The first fault sticks.
    pub fn raise(&self, fault: LinkFault) {
        self.fault_tx.send_if_modified(|current| {
            if current.is_none() {
                debug!("Link fault raised: {:?}", fault);
                *current = Some(fault);
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record(uuid: Uuid, address: &str) -> ScanRecord {
        ScanRecord {
            device: RemoteDevice {
                address: address.to_string(),
                name: None,
            },
            service_uuids: vec![uuid],
            rssi: None,
        }
    }

    #[test]
    fn test_first_match_wins() {
        let svc = Uuid::from_u128(7);
        let bridge = CallbackBridge::new();
        let mut rx = bridge.arm_scan(ScanFilter::new(svc, None));

        assert!(!bridge.on_scan_result(record(Uuid::from_u128(8), "AA:AA:AA:AA:AA:AA")));
        assert!(bridge.on_scan_result(record(svc, "BB:BB:BB:BB:BB:BB")));
        assert!(!bridge.on_scan_result(record(svc, "CC:CC:CC:CC:CC:CC")));

        assert_eq!(rx.try_recv().unwrap().address, "BB:BB:BB:BB:BB:BB");
    }

    #[test]
    fn test_duplicate_callback_ignored() {
        let bridge = CallbackBridge::new();
        let mut rx = bridge.arm_write();

        bridge.on_characteristic_write(Ok(()));
        bridge.on_characteristic_write(Err(GattStatus::FAILURE));

        assert_eq!(rx.try_recv().unwrap(), Ok(()));
    }

    #[test]
    fn test_unarmed_callback_dropped() {
        let bridge = CallbackBridge::new();
        bridge.on_mtu_changed(Ok(247));

        // Arming afterwards must not observe the stale value
        let mut rx = bridge.arm_mtu();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_disconnect_after_connect_is_fault() {
        let bridge = CallbackBridge::new();
        let mut rx = bridge.arm_connection();
        bridge.on_connection_state_change(LinkState::Connected);
        assert_eq!(rx.try_recv().unwrap(), LinkState::Connected);
        assert_eq!(bridge.fault(), None);

        bridge.on_connection_state_change(LinkState::Disconnected);
        assert_eq!(bridge.fault(), Some(LinkFault::LinkLost));
    }

    #[test]
    fn test_first_fault_sticks() {
        let bridge = CallbackBridge::new();
        bridge.raise(LinkFault::AdapterOff);
        bridge.raise(LinkFault::LinkLost);
        assert_eq!(bridge.fault(), Some(LinkFault::AdapterOff));
    }

    #[test]
    fn test_disarm_all() {
        let bridge = CallbackBridge::new();
        let mut rx = bridge.arm_discovery();
        bridge.disarm_all();
        bridge.on_services_discovered(Ok(Vec::new()));
        assert!(rx.try_recv().is_err());
    }
}
