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

//! Adapter and permission checks run before any radio operation.

use std::collections::BTreeSet;

use super::outcome::FailureReason;
use super::platform::{AdapterStatus, BlePlatform, Permission};

/// Whether the radio may be used right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Scopes still missing; the caller prompts the user and retries.
    NeedsPermission(BTreeSet<Permission>),
    NeedsRadioEnable,
    Unsupported,
}

impl Readiness {
    /// Classify an adapter snapshot. Checked in order: hardware, power, scopes.
    pub fn from_status(status: &AdapterStatus) -> Self {
        if !status.present {
            return Readiness::Unsupported;
        }
        if !status.powered {
            return Readiness::NeedsRadioEnable;
        }
        let missing: BTreeSet<Permission> = status
            .permission_model
            .required()
            .difference(&status.granted)
            .copied()
            .collect();
        if !missing.is_empty() {
            return Readiness::NeedsPermission(missing);
        }
        Readiness::Ready
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }

    /// Failure to report when delivery cannot start.
    pub fn failure(&self) -> Option<FailureReason> {
        match self {
            Readiness::Ready => None,
            Readiness::NeedsPermission(_) => Some(FailureReason::PermissionDenied),
            Readiness::NeedsRadioEnable => Some(FailureReason::RadioOff),
            Readiness::Unsupported => Some(FailureReason::Unsupported),
        }
    }
}

/// Query the host. Pure: never prompts, never touches the radio.
pub async fn ensure_ready(platform: &dyn BlePlatform) -> Readiness {
    Readiness::from_status(&platform.adapter_status().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::platform::PermissionModel;

    fn status(present: bool, powered: bool, granted: &[Permission]) -> AdapterStatus {
        AdapterStatus {
            present,
            powered,
            permission_model: PermissionModel::Modern,
            granted: granted.iter().copied().collect(),
        }
    }

    #[test]
    fn test_no_hardware() {
        // Hardware check wins even when everything else is also missing
        assert_eq!(
            Readiness::from_status(&status(false, false, &[])),
            Readiness::Unsupported
        );
    }

    #[test]
    fn test_radio_off_before_permissions() {
        assert_eq!(
            Readiness::from_status(&status(true, false, &[])),
            Readiness::NeedsRadioEnable
        );
    }

    #[test]
    fn test_missing_scopes_reported() {
        let readiness = Readiness::from_status(&status(true, true, &[Permission::BluetoothScan]));
        assert_eq!(
            readiness,
            Readiness::NeedsPermission(BTreeSet::from([Permission::BluetoothConnect]))
        );
        assert_eq!(readiness.failure(), Some(FailureReason::PermissionDenied));
    }

    #[test]
    fn test_legacy_model() {
        let mut s = status(true, true, &[Permission::BluetoothScan, Permission::BluetoothConnect]);
        s.permission_model = PermissionModel::Legacy;
        assert_eq!(
            Readiness::from_status(&s),
            Readiness::NeedsPermission(BTreeSet::from([Permission::FineLocation]))
        );

        s.granted.insert(Permission::FineLocation);
        assert!(Readiness::from_status(&s).is_ready());
    }

    #[test]
    fn test_ready() {
        let readiness = Readiness::from_status(&status(
            true,
            true,
            &[Permission::BluetoothScan, Permission::BluetoothConnect],
        ));
        assert!(readiness.is_ready());
        assert_eq!(readiness.failure(), None);
    }
}
