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

//! One delivery attempt: guard, resolve, connect, discover, MTU, write.
//!
//! Every stage is a single wait on one bridge slot, bounded by the stage's own
//! deadline and interrupted by link faults or cancellation. Teardown runs on
//! every exit, including when the session is dropped mid-flight.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::ble_constants::config::{max_payload_size, DEFAULT_MTU};
use super::bridge::CallbackBridge;
use super::guard;
use super::outcome::{FailureReason, TransferOutcome};
use super::platform::{
    BlePlatform, CharacteristicProperties, CharacteristicRef, GattLink, LinkFault, LinkState,
    PlatformError, RemoteDevice, ScanHandle, ServiceInfo, Transport, WriteMode,
};
use super::request::{parse_address, DeviceTarget, TransferRequest};
use crate::config::BleConfig;
use crate::state::{ClientState, DeliveryState};

/// How a stage wait ended.
enum Wait<T> {
    Ready(T),
    TimedOut,
    /// The host dropped the pending operation without answering.
    Closed,
    Interrupted(FailureReason),
}

/// Find the target characteristic in a discovered service tree.
pub fn locate_characteristic(
    services: &[ServiceInfo],
    target: CharacteristicRef,
) -> Result<CharacteristicProperties, FailureReason> {
    let service = services
        .iter()
        .find(|s| s.uuid == target.service)
        .ok_or(FailureReason::ServiceNotFound)?;
    service
        .characteristics
        .iter()
        .find(|c| c.uuid == target.characteristic)
        .map(|c| c.properties)
        .ok_or(FailureReason::CharacteristicNotFound)
}

/// Acknowledged unless the characteristic only takes commands, or the caller
/// opted out and commands are available.
pub fn select_write_mode(properties: CharacteristicProperties, prefer_acknowledged: bool) -> WriteMode {
    if properties.write_without_response && (!properties.write || !prefer_acknowledged) {
        WriteMode::WithoutResponse
    } else {
        WriteMode::WithResponse
    }
}

/// Ephemeral state of one delivery attempt.
pub struct LinkSession {
    platform: Arc<dyn BlePlatform>,
    config: BleConfig,
    state: Arc<ClientState>,
    bridge: Arc<CallbackBridge>,
    cancel: watch::Receiver<bool>,
    scan: Option<Box<dyn ScanHandle>>,
    link: Option<Box<dyn GattLink>>,
    started: bool,
    finished: bool,
}

impl LinkSession {
    pub fn new(
        platform: Arc<dyn BlePlatform>,
        config: BleConfig,
        state: Arc<ClientState>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            platform,
            config,
            state,
            bridge: Arc::new(CallbackBridge::new()),
            cancel,
            scan: None,
            link: None,
            started: false,
            finished: false,
        }
    }

    /// Run the attempt to a terminal state. Never fails; failures are in the outcome.
    pub async fn run(&mut self, request: &TransferRequest) -> TransferOutcome {
        info!(
            "Delivering token {} to gate {:?} via {} (budget {:?})",
            request.preview(),
            request.gate_id(),
            self.config.target(),
            self.config.attempt_budget()
        );
        let started_at = Instant::now();
        let result = self.execute(request).await;
        let outcome = self.finish(result);
        info!(
            "Delivery finished in {:?}: {}",
            started_at.elapsed(),
            outcome.message()
        );
        outcome
    }

    async fn execute(&mut self, request: &TransferRequest) -> Result<(u16, WriteMode), FailureReason> {
        self.started = true;
        self.enter(DeliveryState::Guarding);
        let deadline = Instant::now() + self.config.guard_timeout();
        let readiness = match self
            .race(guard::ensure_ready(self.platform.as_ref()), deadline)
            .await
        {
            Wait::Ready(readiness) => readiness,
            Wait::TimedOut | Wait::Closed => {
                warn!("Adapter did not answer the readiness query");
                return Err(FailureReason::RadioOff);
            }
            Wait::Interrupted(reason) => return Err(reason),
        };
        if let Some(reason) = readiness.failure() {
            warn!("Bluetooth not ready: {:?}", readiness);
            return Err(reason);
        }
        self.check_interrupted()?;

        self.enter(DeliveryState::Resolving);
        let device = self.resolve().await?;

        self.enter(DeliveryState::Connecting);
        self.connect(&device).await?;

        self.enter(DeliveryState::Discovering);
        let (target, properties) = self.discover().await?;

        self.enter(DeliveryState::NegotiatingMtu);
        let mtu = self.negotiate_mtu(target).await?;

        self.enter(DeliveryState::Writing);
        let mode = self.write(target, properties, request.payload(), mtu).await?;

        Ok((mtu, mode))
    }

    /// Scan for the peripheral or resolve it from a fixed address.
    async fn resolve(&mut self) -> Result<RemoteDevice, FailureReason> {
        match self.config.target() {
            DeviceTarget::FixedAddress(address) => {
                let address = parse_address(&address).map_err(|e| {
                    warn!("{}", e);
                    FailureReason::InvalidAddress
                })?;
                let device = self
                    .platform
                    .remote_device(&address)
                    .map_err(|e| FailureReason::from_platform(&e, FailureReason::InvalidAddress))?;
                info!("Resolved gate at {}", device.address);
                Ok(device)
            }
            DeviceTarget::ServiceFilter(filter) => {
                let deadline = Instant::now() + self.config.scan_timeout();
                let rx = self.bridge.arm_scan(filter.clone());

                let started = self
                    .race(self.platform.start_scan(&filter, self.bridge.clone()), deadline)
                    .await;
                match started {
                    Wait::Ready(Ok(handle)) => self.scan = Some(handle),
                    Wait::Ready(Err(e)) => {
                        warn!("Failed to start scan: {}", e);
                        return Err(FailureReason::from_platform(&e, FailureReason::ScanFailed));
                    }
                    Wait::TimedOut | Wait::Closed => return Err(FailureReason::ScanTimeout),
                    Wait::Interrupted(reason) => return Err(reason),
                }
                debug!("Scanning for {:?}", filter);

                let waited = self.wait(rx, deadline).await;
                // At most one match is consumed; stop the radio right away.
                self.stop_scan();

                match waited {
                    Wait::Ready(device) => {
                        info!("Found gate {} ({:?})", device.address, device.name);
                        Ok(device)
                    }
                    Wait::TimedOut => Err(FailureReason::ScanTimeout),
                    Wait::Closed => Err(FailureReason::ScanFailed),
                    Wait::Interrupted(reason) => Err(reason),
                }
            }
        }
    }

    async fn connect(&mut self, device: &RemoteDevice) -> Result<(), FailureReason> {
        let deadline = Instant::now() + self.config.connect_timeout();
        let rx = self.bridge.arm_connection();

        let opened = self
            .race(
                self.platform
                    .connect(device, Transport::Le, self.bridge.clone()),
                deadline,
            )
            .await;
        match opened {
            Wait::Ready(Ok(link)) => self.link = Some(link),
            Wait::Ready(Err(e)) => {
                warn!("Failed to open link to {}: {}", device.address, e);
                return Err(FailureReason::from_platform(&e, FailureReason::ConnectFailed));
            }
            Wait::TimedOut | Wait::Closed => return Err(FailureReason::ConnectTimeout),
            Wait::Interrupted(reason) => return Err(reason),
        }

        match self.wait(rx, deadline).await {
            Wait::Ready(LinkState::Connected) => {
                info!("Connected to {}", device.address);
                Ok(())
            }
            // Definitive failure; no reconnect at this layer.
            Wait::Ready(LinkState::Disconnected) | Wait::Closed => Err(FailureReason::ConnectFailed),
            Wait::TimedOut => Err(FailureReason::ConnectTimeout),
            Wait::Interrupted(reason) => Err(reason),
        }
    }

    async fn discover(&mut self) -> Result<(CharacteristicRef, CharacteristicProperties), FailureReason> {
        let deadline = Instant::now() + self.config.discover_timeout();
        let rx = self.bridge.arm_discovery();
        self.link()?
            .discover_services()
            .map_err(|e| FailureReason::from_platform(&e, FailureReason::DiscoverFailed))?;

        let services = match self.wait(rx, deadline).await {
            Wait::Ready(Ok(services)) => services,
            Wait::Ready(Err(status)) => {
                warn!("Service discovery failed with status {:#04x}", status.0);
                return Err(FailureReason::DiscoverFailed);
            }
            Wait::Closed => return Err(FailureReason::DiscoverFailed),
            Wait::TimedOut => return Err(FailureReason::DiscoverTimeout),
            Wait::Interrupted(reason) => return Err(reason),
        };
        debug!("Discovered {} services", services.len());

        let target = CharacteristicRef {
            service: self.config.service_uuid,
            characteristic: self.config.characteristic_uuid,
        };
        let properties = locate_characteristic(&services, target).map_err(|reason| {
            warn!("{:?} while looking for {:?}", reason, target);
            reason
        })?;
        Ok((target, properties))
    }

    /// Best effort. Falls back to the default MTU unless the link itself failed.
    async fn negotiate_mtu(&mut self, target: CharacteristicRef) -> Result<u16, FailureReason> {
        let requested = self.config.mtu_request;
        if requested <= DEFAULT_MTU {
            return Ok(DEFAULT_MTU);
        }

        let deadline = Instant::now() + self.config.mtu_timeout();
        let rx = self.bridge.arm_mtu();
        match self.link()?.request_mtu(requested, target) {
            Ok(()) => {}
            Err(PlatformError::Backend(e)) => {
                debug!("MTU request not accepted ({}); using {}", e, DEFAULT_MTU);
                return Ok(DEFAULT_MTU);
            }
            Err(e) => return Err(FailureReason::from_platform(&e, FailureReason::LinkLost)),
        }

        let mtu = match self.wait(rx, deadline).await {
            Wait::Ready(Ok(mtu)) => mtu.max(DEFAULT_MTU),
            Wait::Ready(Err(status)) => {
                debug!("MTU request failed with status {:#04x}", status.0);
                DEFAULT_MTU
            }
            Wait::TimedOut | Wait::Closed => {
                debug!("No MTU answer; using {}", DEFAULT_MTU);
                DEFAULT_MTU
            }
            Wait::Interrupted(reason) => return Err(reason),
        };
        info!("MTU {} (requested {})", mtu, requested);
        Ok(mtu)
    }

    async fn write(
        &mut self,
        target: CharacteristicRef,
        properties: CharacteristicProperties,
        payload: &[u8],
        mtu: u16,
    ) -> Result<WriteMode, FailureReason> {
        let limit = max_payload_size(mtu);
        if payload.len() > limit {
            warn!(
                "Token is {} bytes, MTU {} allows {}",
                payload.len(),
                mtu,
                limit
            );
            return Err(FailureReason::PayloadTooLarge);
        }

        let mode = select_write_mode(properties, self.config.prefer_acknowledged_write);
        let deadline = Instant::now() + self.config.write_timeout();
        let rx = self.bridge.arm_write();
        self.link()?
            .write(target, payload, mode)
            .map_err(|e| FailureReason::from_platform(&e, FailureReason::WriteRejected))?;
        debug!("Write of {} bytes queued ({:?})", payload.len(), mode);

        match self.wait(rx, deadline).await {
            Wait::Ready(Ok(())) => {
                info!("Token written ({:?})", mode);
                Ok(mode)
            }
            Wait::Ready(Err(status)) => {
                warn!("Write failed with status {:#04x}", status.0);
                Err(FailureReason::WriteRejected)
            }
            Wait::Closed => Err(FailureReason::WriteRejected),
            Wait::TimedOut => Err(FailureReason::WriteTimeout),
            Wait::Interrupted(reason) => Err(reason),
        }
    }

    /// Disconnect and release everything this session holds. Safe to call repeatedly.
    pub fn teardown(&mut self) {
        self.bridge.disarm_all();
        self.stop_scan();
        if let Some(link) = self.link.take() {
            if let Err(e) = link.disconnect() {
                debug!("Ignoring disconnect error during teardown: {}", e);
            }
            link.close();
            info!("Link released");
        }
    }

    fn finish(&mut self, result: Result<(u16, WriteMode), FailureReason>) -> TransferOutcome {
        self.enter(DeliveryState::TearingDown);
        self.teardown();

        let outcome = match result {
            Ok((mtu, mode)) => {
                self.enter(DeliveryState::Succeeded);
                TransferOutcome::delivered(mtu, mode)
            }
            Err(reason) => {
                self.enter(DeliveryState::Failed(reason));
                TransferOutcome::failed(reason)
            }
        };
        self.state.set_outcome(outcome.clone());
        self.enter(DeliveryState::Idle);
        self.finished = true;
        outcome
    }

    fn stop_scan(&mut self) {
        if let Some(mut scan) = self.scan.take() {
            scan.stop();
            debug!("Scan stopped");
        }
    }

    fn link(&self) -> Result<&dyn GattLink, FailureReason> {
        self.link.as_deref().ok_or(FailureReason::LinkLost)
    }

    fn enter(&self, next: DeliveryState) {
        if self.state.transition(next) {
            debug!("Delivery state: {}", next.as_str());
        }
    }

    fn check_interrupted(&self) -> Result<(), FailureReason> {
        if *self.cancel.borrow() {
            return Err(FailureReason::Cancelled);
        }
        match self.bridge.fault() {
            Some(fault) => Err(fault.into()),
            None => Ok(()),
        }
    }

    /// Await one bridge slot until `deadline`, a link fault, or cancellation.
    fn wait<T>(&self, rx: oneshot::Receiver<T>, deadline: Instant) -> impl Future<Output = Wait<T>> {
        let raced = self.race(rx, deadline);
        async move {
            match raced.await {
                Wait::Ready(Ok(value)) => Wait::Ready(value),
                Wait::Ready(Err(_)) | Wait::Closed => Wait::Closed,
                Wait::TimedOut => Wait::TimedOut,
                Wait::Interrupted(reason) => Wait::Interrupted(reason),
            }
        }
    }

    /// Run a host call until `deadline`, a link fault, or cancellation.
    fn race<F: Future>(&self, future: F, deadline: Instant) -> impl Future<Output = Wait<F::Output>> {
        race_until(
            future,
            deadline,
            self.cancel.clone(),
            self.bridge.subscribe_faults(),
        )
    }
}

async fn race_until<F: Future>(
    future: F,
    deadline: Instant,
    mut cancel: watch::Receiver<bool>,
    mut faults: watch::Receiver<Option<LinkFault>>,
) -> Wait<F::Output> {
    tokio::select! {
        biased;
        Ok(()) = async { cancel.wait_for(|c| *c).await.map(|_| ()) } => {
            info!("Delivery cancelled");
            Wait::Interrupted(FailureReason::Cancelled)
        }
        Ok(fault) = async { faults.wait_for(Option::is_some).await.map(|f| *f) } => {
            let fault = fault.unwrap_or(LinkFault::LinkLost);
            warn!("Link fault: {:?}", fault);
            Wait::Interrupted(fault.into())
        }
        result = tokio::time::timeout_at(deadline, future) => match result {
            Ok(value) => Wait::Ready(value),
            Err(_) => Wait::TimedOut,
        },
    }
}

impl Drop for LinkSession {
    fn drop(&mut self) {
        if self.started && !self.finished {
            // Owning task was cancelled at a suspension point.
            warn!("Delivery dropped mid-flight; tearing down");
            self.finish(Err(FailureReason::Cancelled));
        } else {
            self.teardown();
        }
    }
}
