// Copyright 2026 BadCompany
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

//! Protocol version negotiation for the `initialize` handshake.

use crate::engine_core::constants::protocol;
use tracing::info;

pub struct ProtocolNegotiator;

impl ProtocolNegotiator {
    /// Picks the version to answer `initialize` with.
    ///
    /// A version we support is echoed back. Anything else (including no
    /// version at all) gets the server's preferred version, or the latest
    /// one if the preference itself is unsupported.
    pub fn negotiate(client_version: Option<&str>, preferred: &str) -> &'static str {
        if let Some(known) = client_version.and_then(Self::supported) {
            return known;
        }
        let fallback = Self::supported(preferred).unwrap_or(protocol::LATEST);
        info!(
            requested = client_version.unwrap_or("<none>"),
            answered = fallback,
            "Client requested unsupported protocol version"
        );
        fallback
    }

    fn supported(version: &str) -> Option<&'static str> {
        protocol::SUPPORTED.iter().copied().find(|v| *v == version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_version_is_echoed() {
        assert_eq!(
            ProtocolNegotiator::negotiate(Some("2024-11-05"), protocol::LATEST),
            "2024-11-05"
        );
    }

    #[test]
    fn test_unknown_falls_back_to_preferred() {
        assert_eq!(
            ProtocolNegotiator::negotiate(Some("1999-01-01"), "2025-03-26"),
            "2025-03-26"
        );
        assert_eq!(
            ProtocolNegotiator::negotiate(None, "not-a-version"),
            protocol::LATEST
        );
    }
}
