// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dataplane contributors
//
// Crate-wide error taxonomy.
//
// Negotiation, decode, and resource errors are fatal to the connection
// being established, never to the process. Usage errors indicate a broken
// caller (buffer discipline violations) and are not meant to be caught and
// continued. NotResponding is the one recoverable-by-retry condition.

use crate::role::PortRole;

/// Errors produced by connection establishment and buffer exchange.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Role negotiation failed with a named reason.
    #[error("error choosing transfer roles: {0}")]
    Negotiation(&'static str),

    /// No transport family is supported by both sides of a connection.
    #[error("no compatible transports for connection")]
    NoCompatibleTransport,

    /// Conflicting transport overrides between connection and port params.
    #[error("inconsistent transports: {0}")]
    InconsistentTransports(String),

    /// An endpoint string names a protocol no driver supports.
    #[error("unsupported endpoint \"{0}\"")]
    UnsupportedEndpoint(String),

    /// A wire descriptor or endpoint string could not be decoded.
    #[error("could not decode: {0}")]
    Decode(&'static str),

    /// An endpoint arena has no room for a requested allocation.
    #[error("no buffer available ({0})")]
    NoBuffers(&'static str),

    /// An offset request named a circuit this transport does not know.
    #[error("unknown circuit {0:#x}")]
    UnknownCircuit(u32),

    /// A mailbox write or reply poll timed out.
    #[error("server not responding (mailbox {0})")]
    NotResponding(u16),

    /// The peer reported failure in a mailbox reply.
    #[error("mailbox request failed with peer error code {0}")]
    PeerError(i32),

    /// An invalid transfer-role override string.
    #[error("transferRole must be passive|active|flowcontrol|activeonly, not \"{0}\"")]
    BadRoleName(String),

    /// A role the container does not support was mandated.
    #[error("role {0:?} rejected: not in supported option mask {1:#x}")]
    UnsupportedRole(PortRole, u32),

    /// Invalid scaled-connection configuration (distribution table).
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Buffer-discipline violation by the caller.
    #[error("usage error: {0}")]
    Usage(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Usage-error constructor mirroring the port-name-qualified messages
    /// the connection layer produces.
    pub(crate) fn usage(port: &str, what: &str) -> Error {
        Error::Usage(format!("{what} on port \"{port}\""))
    }
}
