// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dataplane contributors
//
// The configuration surface consumed by connection setup. All fields are
// optional overrides; absent values default to provider-discovered ones.

/// Per-port or per-connection parameters supplied by the configuration
/// layer that owns worker metadata.
#[derive(Debug, Clone, Default)]
pub struct Params {
    /// Override the number of ring buffers on this port.
    pub buffer_count: Option<u32>,
    /// Override the buffer size for the connection.
    pub buffer_size: Option<u32>,
    /// Constrain the connection to a named transport family.
    pub transport: Option<String>,
    /// Mandate a transfer role: `passive|active|flowcontrol|activeonly`.
    pub transfer_role: Option<String>,
    /// Explicit local endpoint string ("protocol:details").
    pub endpoint: Option<String>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer_count(mut self, n: u32) -> Self {
        self.buffer_count = Some(n);
        self
    }

    pub fn with_transport(mut self, t: &str) -> Self {
        self.transport = Some(t.to_string());
        self
    }

    pub fn with_transfer_role(mut self, r: &str) -> Self {
        self.transfer_role = Some(r.to_string());
        self
    }
}

/// Normalize a transport name: a bare protocol (no '-') becomes the
/// canonical `<name>-rdma` family string.
pub fn canonical_transport(t: &str) -> String {
    if t.contains('-') {
        t.to_string()
    } else {
        format!("{t}-rdma")
    }
}
