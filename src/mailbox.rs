// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dataplane contributors
//
// Mailbox slots: the fixed-layout out-of-band request/reply records in an
// endpoint's control memory.
//
// An endpoint owns one slot per possible peer (its mailbox table). A peer
// with mailbox id `m` writes its requests into slot `m` of the *server's*
// table, then the server clears the slot locally and copies the cleared
// slot (carrying `error_code` and return fields) back into slot `m` of
// the *requester's* table. The request-type word is written last on that
// reply copy so the requester observes a fully-written slot.

/// Identifies one mailbox within an endpoint's table.
pub type MailboxId = u16;

/// Request codes, one per control-plane operation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Request {
    /// Slot is free.
    #[default]
    NoRequest,
    /// Create a circuit keyed by the sender's circuit id.
    NewConnection {
        /// `true` when the requester wants to send data to the server.
        send: bool,
        buffer_size: u32,
        /// Size of the protocol metadata blob the client wants to push,
        /// zero for none.
        protocol_size: u32,
        /// The requester's (output side's) endpoint name.
        output_endpoint: String,
    },
    /// Update the input-port set of an existing circuit.
    UpdateCircuit {
        output_endpoint: String,
        n_inputs: u32,
    },
    /// Ask the output side for its flow-control offsets; also tells it
    /// where to copy the protocol blob it announced in NewConnection.
    OutputControlOffset {
        port_id: u64,
        shadow_endpoint: String,
        /// Where in the server's arena the protocol blob should land,
        /// zero when none was announced.
        protocol_offset: u64,
    },
    /// Ask the input side for its shadow-state offsets.
    ShadowStateOffset { port_id: u64, url: String },
    /// Ask the input side for its buffer-state offsets.
    InputOffsets { port_id: u64, url: String },
}

impl Request {
    pub fn is_none(&self) -> bool {
        matches!(self, Request::NoRequest)
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::NoRequest => "NoRequest",
            Request::NewConnection { .. } => "NewConnection",
            Request::UpdateCircuit { .. } => "UpdateCircuit",
            Request::OutputControlOffset { .. } => "OutputControlOffset",
            Request::ShadowStateOffset { .. } => "ShadowStateOffset",
            Request::InputOffsets { .. } => "InputOffsets",
        }
    }
}

/// One fixed-layout slot of a mailbox table.
#[derive(Debug, Clone, Default)]
pub struct MailboxSlot {
    pub request: Request,
    /// Circuit the request concerns (the sender's id for NewConnection).
    pub circuit_id: u32,
    /// Nonzero when the server failed to honor the request.
    pub error_code: i32,
    /// Arena offset in the requester's endpoint where returned values
    /// (offset pairs) should be copied; zero when the request returns
    /// nothing.
    pub return_offset: u64,
    /// Byte size of the returned value area.
    pub return_size: u32,
    /// The requester's own mailbox id, for the reply copy.
    pub return_mailbox: MailboxId,
}

impl MailboxSlot {
    /// Reset to the free state, preserving nothing.
    pub fn clear(&mut self) {
        *self = MailboxSlot::default();
    }
}
