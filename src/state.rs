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

//! Delivery state management.

use chrono::{DateTime, Local};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::bluetooth::{FailureReason, TransferOutcome};

/// Number of transitions kept for diagnostics.
const HISTORY_LEN: usize = 64;

/// Stage of the delivery state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    Idle,
    Guarding,
    Resolving,
    Connecting,
    Discovering,
    NegotiatingMtu,
    Writing,
    TearingDown,
    Succeeded,
    Failed(FailureReason),
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Idle => "Idle",
            DeliveryState::Guarding => "Checking Bluetooth...",
            DeliveryState::Resolving => "Looking for gate...",
            DeliveryState::Connecting => "Connecting...",
            DeliveryState::Discovering => "Reading services...",
            DeliveryState::NegotiatingMtu => "Negotiating MTU...",
            DeliveryState::Writing => "Sending token...",
            DeliveryState::TearingDown => "Disconnecting...",
            DeliveryState::Succeeded => "Token sent",
            DeliveryState::Failed(_) => "Failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, DeliveryState::Succeeded | DeliveryState::Failed(_))
    }

    /// Legal moves of the state machine.
    pub fn can_transition_to(&self, next: &DeliveryState) -> bool {
        use DeliveryState::*;
        match (self, next) {
            (Idle, Guarding) => true,
            (Guarding, Resolving)
            | (Resolving, Connecting)
            | (Connecting, Discovering)
            | (Discovering, NegotiatingMtu)
            | (NegotiatingMtu, Writing) => true,
            (Guarding | Resolving | Connecting | Discovering | NegotiatingMtu | Writing, TearingDown) => {
                true
            }
            (TearingDown, Succeeded) | (TearingDown, Failed(_)) => true,
            (Succeeded | Failed(_), Idle) => true,
            _ => false,
        }
    }
}

/// Outcome of the most recent attempt.
#[derive(Debug, Clone)]
pub struct OutcomeRecord {
    pub outcome: TransferOutcome,
    pub finished_at: DateTime<Local>,
}

/// Shared, observable delivery state of one client.
#[derive(Debug)]
pub struct ClientState {
    /// Current stage.
    current: RwLock<DeliveryState>,

    /// Recently visited stages, oldest first.
    history: RwLock<VecDeque<DeliveryState>>,

    /// Last finished attempt.
    last_outcome: RwLock<Option<OutcomeRecord>>,
}

impl Default for ClientState {
    fn default() -> Self {
        Self {
            current: RwLock::new(DeliveryState::Idle),
            history: RwLock::new(VecDeque::with_capacity(HISTORY_LEN)),
            last_outcome: RwLock::new(None),
        }
    }
}

impl ClientState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Move to `next`. Illegal moves are refused and logged.
    pub fn transition(&self, next: DeliveryState) -> bool {
        let mut current = self.current.write();
        if !current.can_transition_to(&next) {
            warn!("Refusing state transition {:?} -> {:?}", *current, next);
            return false;
        }
        debug!("State {:?} -> {:?}", *current, next);
        *current = next;

        let mut history = self.history.write();
        if history.len() == HISTORY_LEN {
            history.pop_front();
        }
        history.push_back(next);
        true
    }

    pub fn get_state(&self) -> DeliveryState {
        *self.current.read()
    }

    pub fn history(&self) -> Vec<DeliveryState> {
        self.history.read().iter().copied().collect()
    }

    pub fn set_outcome(&self, outcome: TransferOutcome) {
        *self.last_outcome.write() = Some(OutcomeRecord {
            outcome,
            finished_at: Local::now(),
        });
    }

    pub fn last_outcome(&self) -> Option<OutcomeRecord> {
        self.last_outcome.read().clone()
    }
}
