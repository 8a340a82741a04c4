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

//! BLE token delivery client.
//!
//! Attempts are serialized: the radio is shared, so a second request waits
//! for the first to reach a terminal state before any of its stages run.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::guard::{self, Readiness};
use super::outcome::TransferOutcome;
use super::platform::BlePlatform;
use super::request::TransferRequest;
use super::session::LinkSession;
use crate::config::BleConfig;
use crate::state::ClientState;

/// Delivers access tokens to a gate controller over BLE.
pub struct BleClient {
    platform: Arc<dyn BlePlatform>,
    config: BleConfig,
    state: Arc<ClientState>,
    /// Held for the whole of one attempt.
    radio: tokio::sync::Mutex<()>,
    /// Cancel switch of the attempt currently holding `radio`.
    cancel_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl BleClient {
    /// Create a client on top of the host's shared Bluetooth stack.
    pub fn new(platform: Arc<dyn BlePlatform>, config: BleConfig) -> Self {
        Self {
            platform,
            config,
            state: ClientState::new(),
            radio: tokio::sync::Mutex::new(()),
            cancel_tx: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &BleConfig {
        &self.config
    }

    /// Observable delivery state.
    pub fn state(&self) -> Arc<ClientState> {
        self.state.clone()
    }

    /// Check adapter and permissions without touching the radio.
    pub async fn ensure_ready(&self) -> Readiness {
        guard::ensure_ready(self.platform.as_ref()).await
    }

    /// Deliver one token. Waits for any attempt already in flight.
    pub async fn deliver(&self, request: TransferRequest) -> TransferOutcome {
        let _radio = self.radio.lock().await;
        debug!("Radio acquired for delivery");

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let _armed = CancelArmed::new(&self.cancel_tx, cancel_tx);

        let mut session = LinkSession::new(
            self.platform.clone(),
            self.config.clone(),
            self.state.clone(),
            cancel_rx,
        );
        session.run(&request).await
    }

    /// Deliver on a background task and hand the outcome to `on_complete`.
    pub fn deliver_with<F>(self: &Arc<Self>, request: TransferRequest, on_complete: F) -> JoinHandle<()>
    where
        F: FnOnce(TransferOutcome) + Send + 'static,
    {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = client.deliver(request).await;
            on_complete(outcome);
        })
    }

    /// Cancel the attempt in flight, if any. It tears down and reports `Cancelled`.
    pub fn cancel(&self) -> bool {
        match self.cancel_tx.lock().as_ref() {
            Some(tx) => {
                info!("Cancelling delivery in flight");
                tx.send_replace(true);
                true
            }
            None => false,
        }
    }
}

/// Publishes an attempt's cancel switch and withdraws it when the attempt
/// ends, even if the delivery future is dropped.
struct CancelArmed<'a> {
    slot: &'a Mutex<Option<watch::Sender<bool>>>,
}

impl<'a> CancelArmed<'a> {
    fn new(slot: &'a Mutex<Option<watch::Sender<bool>>>, tx: watch::Sender<bool>) -> Self {
        *slot.lock() = Some(tx);
        Self { slot }
    }
}

impl Drop for CancelArmed<'_> {
    fn drop(&mut self) {
        self.slot.lock().take();
    }
}
