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

//! Delivery inputs: where to send, what to send.

use std::fmt;
use thiserror::Error;

use super::platform::{PlatformError, ScanFilter};

/// Errors building a [`TransferRequest`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("Token is empty")]
    EmptyToken,
}

/// How the peripheral is located for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceTarget {
    /// Scan for an advertisement matching the filter.
    ServiceFilter(ScanFilter),
    /// Resolve a known hardware address, no scan.
    FixedAddress(String),
}

impl fmt::Display for DeviceTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceTarget::ServiceFilter(filter) => match &filter.name_hint {
                Some(name) => write!(f, "scan {} named '{}'", filter.service_uuid, name),
                None => write!(f, "scan {}", filter.service_uuid),
            },
            DeviceTarget::FixedAddress(address) => write!(f, "address {}", address),
        }
    }
}

/// Validate a `XX:XX:XX:XX:XX:XX` hardware address, returning it upper-cased.
pub fn parse_address(address: &str) -> Result<String, PlatformError> {
    let trimmed = address.trim();
    let octets: Vec<&str> = trimmed.split(':').collect();
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(PlatformError::InvalidAddress(trimmed.to_string()));
    }
    Ok(trimmed.to_ascii_uppercase())
}

/// Token payload plus the gate it is meant for.
#[derive(Clone, PartialEq, Eq)]
pub struct TransferRequest {
    token: String,
    gate_id: Option<String>,
}

impl TransferRequest {
    pub fn new(token: impl Into<String>, gate_id: Option<String>) -> Result<Self, RequestError> {
        let token = token.into();
        if token.is_empty() {
            return Err(RequestError::EmptyToken);
        }
        Ok(Self {
            token,
            gate_id: gate_id.filter(|g| !g.trim().is_empty()),
        })
    }

    /// Bytes written to the characteristic.
    pub fn payload(&self) -> &[u8] {
        self.token.as_bytes()
    }

    pub fn gate_id(&self) -> Option<&str> {
        self.gate_id.as_deref()
    }

    /// Masked token for logs.
    pub fn preview(&self) -> String {
        let head: String = self.token.chars().take(4).collect();
        format!("{}… ({} bytes)", head, self.token.len())
    }
}

impl fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferRequest")
            .field("token", &self.preview())
            .field("gate_id", &self.gate_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_token_rejected() {
        assert_eq!(TransferRequest::new("", None), Err(RequestError::EmptyToken));
    }

    #[test]
    fn test_payload_is_utf8() {
        let req = TransferRequest::new("абв", Some("gate-01".to_string())).unwrap();
        assert_eq!(req.payload().len(), 6);
        assert_eq!(req.gate_id(), Some("gate-01"));
    }

    #[test]
    fn test_debug_hides_token() {
        let req = TransferRequest::new("secret-token-value", None).unwrap();
        let shown = format!("{:?}", req);
        assert!(!shown.contains("secret-token-value"));
        assert!(shown.contains("18 bytes"));
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(
            parse_address("24:0a:c4:12:34:56").unwrap(),
            "24:0A:C4:12:34:56"
        );
        assert!(parse_address("24:0A:C4:12:34").is_err());
        assert!(parse_address("24-0A-C4-12-34-56").is_err());
        assert!(parse_address("ZZ:0A:C4:12:34:56").is_err());
        assert!(parse_address("").is_err());
    }
}
