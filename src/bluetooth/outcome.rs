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

//! Delivery results as seen by callers.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::platform::{LinkFault, PlatformError, WriteMode};

/// Why a delivery attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    /// No Bluetooth hardware.
    Unsupported,
    PermissionDenied,
    RadioOff,
    /// Configured fixed address is malformed.
    InvalidAddress,
    /// Host refused to start scanning.
    ScanFailed,
    ScanTimeout,
    ConnectTimeout,
    /// Link dropped or refused before it came up.
    ConnectFailed,
    DiscoverTimeout,
    /// Host reported a failed service enumeration.
    DiscoverFailed,
    ServiceNotFound,
    CharacteristicNotFound,
    PayloadTooLarge,
    WriteRejected,
    WriteTimeout,
    /// Established link dropped mid-operation.
    LinkLost,
    Cancelled,
}

impl FailureReason {
    /// Stable identifier for logs and JSON output.
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::Unsupported => "UNSUPPORTED",
            FailureReason::PermissionDenied => "PERMISSION_DENIED",
            FailureReason::RadioOff => "RADIO_OFF",
            FailureReason::InvalidAddress => "INVALID_ADDRESS",
            FailureReason::ScanFailed => "SCAN_FAILED",
            FailureReason::ScanTimeout => "SCAN_TIMEOUT",
            FailureReason::ConnectTimeout => "CONNECT_TIMEOUT",
            FailureReason::ConnectFailed => "CONNECT_FAILED",
            FailureReason::DiscoverTimeout => "DISCOVER_TIMEOUT",
            FailureReason::DiscoverFailed => "DISCOVER_FAILED",
            FailureReason::ServiceNotFound => "SERVICE_NOT_FOUND",
            FailureReason::CharacteristicNotFound => "CHARACTERISTIC_NOT_FOUND",
            FailureReason::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            FailureReason::WriteRejected => "WRITE_REJECTED",
            FailureReason::WriteTimeout => "WRITE_TIMEOUT",
            FailureReason::LinkLost => "LINK_LOST",
            FailureReason::Cancelled => "CANCELLED",
        }
    }

    /// Short message for the user.
    pub fn message(&self) -> &'static str {
        match self {
            FailureReason::Unsupported => "This device has no Bluetooth",
            FailureReason::PermissionDenied => "Bluetooth permissions are required",
            FailureReason::RadioOff => "Turn Bluetooth on and try again",
            FailureReason::InvalidAddress => "Configured gate address is invalid",
            FailureReason::ScanFailed => "Could not start scanning",
            FailureReason::ScanTimeout => "Gate not found. Move closer and try again",
            FailureReason::ConnectTimeout => "Gate did not answer in time",
            FailureReason::ConnectFailed => "Could not connect to the gate",
            FailureReason::DiscoverTimeout => "Gate did not list its services in time",
            FailureReason::DiscoverFailed => "Could not read gate services",
            FailureReason::ServiceNotFound => "Gate does not offer the access service",
            FailureReason::CharacteristicNotFound => "Gate does not accept tokens",
            FailureReason::PayloadTooLarge => "Token is too long for this gate",
            FailureReason::WriteRejected => "Gate rejected the token",
            FailureReason::WriteTimeout => "Gate did not confirm the token in time",
            FailureReason::LinkLost => "Connection to the gate was lost",
            FailureReason::Cancelled => "Cancelled",
        }
    }

    /// Retrying the whole delivery may help without changing anything.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            FailureReason::ScanTimeout
                | FailureReason::ScanFailed
                | FailureReason::ConnectTimeout
                | FailureReason::ConnectFailed
                | FailureReason::DiscoverTimeout
                | FailureReason::DiscoverFailed
                | FailureReason::WriteTimeout
                | FailureReason::WriteRejected
                | FailureReason::LinkLost
        )
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

impl From<LinkFault> for FailureReason {
    fn from(fault: LinkFault) -> Self {
        match fault {
            LinkFault::AdapterOff => FailureReason::RadioOff,
            LinkFault::PermissionRevoked => FailureReason::PermissionDenied,
            LinkFault::LinkLost => FailureReason::LinkLost,
        }
    }
}

impl FailureReason {
    /// Classify a host error raised while starting `fallback`'s stage.
    pub fn from_platform(err: &PlatformError, fallback: FailureReason) -> Self {
        match err {
            PlatformError::AdapterOff => FailureReason::RadioOff,
            PlatformError::PermissionRevoked => FailureReason::PermissionDenied,
            PlatformError::InvalidAddress(_) => FailureReason::InvalidAddress,
            PlatformError::NotConnected => FailureReason::LinkLost,
            PlatformError::Backend(_) => fallback,
        }
    }
}

/// Result of one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOutcome {
    pub delivered: bool,
    pub reason: Option<FailureReason>,
    /// MTU in effect for the write, if the attempt got that far.
    pub mtu: Option<u16>,
    pub write_mode: Option<WriteMode>,
}

impl TransferOutcome {
    pub fn delivered(mtu: u16, write_mode: WriteMode) -> Self {
        Self {
            delivered: true,
            reason: None,
            mtu: Some(mtu),
            write_mode: Some(write_mode),
        }
    }

    pub fn failed(reason: FailureReason) -> Self {
        Self {
            delivered: false,
            reason: Some(reason),
            mtu: None,
            write_mode: None,
        }
    }

    pub fn message(&self) -> &'static str {
        match self.reason {
            Some(reason) => reason.message(),
            None => "Token sent",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_messages() {
        let ok = TransferOutcome::delivered(100, WriteMode::WithResponse);
        assert!(ok.delivered);
        assert_eq!(ok.message(), "Token sent");

        let failed = TransferOutcome::failed(FailureReason::ScanTimeout);
        assert!(!failed.delivered);
        assert_eq!(failed.message(), FailureReason::ScanTimeout.message());
    }

    #[test]
    fn test_transient_classes() {
        assert!(FailureReason::ScanTimeout.is_transient());
        assert!(FailureReason::WriteTimeout.is_transient());
        assert!(!FailureReason::Unsupported.is_transient());
        assert!(!FailureReason::ServiceNotFound.is_transient());
        assert!(!FailureReason::PayloadTooLarge.is_transient());
    }

    #[test]
    fn test_platform_mapping() {
        assert_eq!(
            FailureReason::from_platform(&PlatformError::AdapterOff, FailureReason::ConnectFailed),
            FailureReason::RadioOff
        );
        assert_eq!(
            FailureReason::from_platform(
                &PlatformError::Backend("le-connection-abort-by-local".to_string()),
                FailureReason::ConnectFailed
            ),
            FailureReason::ConnectFailed
        );
        assert_eq!(FailureReason::from(LinkFault::LinkLost), FailureReason::LinkLost);
    }

    #[test]
    fn test_outcome_json() {
        let json = serde_json::to_string(&TransferOutcome::failed(FailureReason::PayloadTooLarge)).unwrap();
        assert!(json.contains("\"delivered\":false"));
        assert!(json.contains("PayloadTooLarge"));
    }
}
