// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dataplane contributors
//
// Per-connection handshake state and transport selection.
//
// A Connection pairs one output launcher port with one input launcher
// port, each optionally scaled to a crew. Each side carries the byte
// buffers descriptors travel through (initial, then final once a side
// has already sent one), the `done` flag, and the `started` flag that
// drives the two-phase initial/final split of the remote handshake.

use crate::error::{Error, Result};
use crate::params::{canonical_transport, Params};
use crate::role::{choose_roles, parse_transfer_role, PortRole, OPT_MANDATED_ROLE};

/// One transport family a container offers, with its default roles and
/// supported-role option masks per direction.
#[derive(Debug, Clone)]
pub struct TransportOffer {
    /// Transport family name (e.g. "mem-rdma").
    pub transport: String,
    /// Interconnect instance id; both sides must be on the same instance.
    pub id: String,
    pub role_in: PortRole,
    pub options_in: u32,
    pub role_out: PortRole,
    pub options_out: u32,
}

/// The agreed transport and role/options pair for one connection.
#[derive(Debug, Clone)]
pub struct NegotiatedTransport {
    pub transport: String,
    pub id: String,
    pub role_in: PortRole,
    pub options_in: u32,
    pub role_out: PortRole,
    pub options_out: u32,
}

impl Default for NegotiatedTransport {
    fn default() -> Self {
        NegotiatedTransport {
            transport: String::new(),
            id: String::new(),
            role_in: PortRole::NoRole,
            options_in: 0,
            role_out: PortRole::NoRole,
            options_out: 0,
        }
    }
}

/// One side of a connection as the launcher sees it.
#[derive(Debug, Default)]
pub struct LauncherPort {
    /// Crew size of this side.
    pub scale: usize,
    /// This member's index within the crew.
    pub index: usize,
    /// Descriptor bytes headed to the peer (first exchange).
    pub initial_info: Vec<u8>,
    /// Descriptor bytes headed to the peer (subsequent exchanges).
    pub final_info: Vec<u8>,
    /// This side can operate.
    pub done: bool,
    /// This side has already produced a descriptor for the peer.
    pub started: bool,
    pub params: Params,
}

impl LauncherPort {
    pub fn new() -> LauncherPort {
        LauncherPort {
            scale: 1,
            ..Default::default()
        }
    }
}

/// One application-level wiring request between an output port and an
/// input port.
#[derive(Debug, Default)]
pub struct Connection {
    pub output: LauncherPort,
    pub input: LauncherPort,
    pub transport: NegotiatedTransport,
    pub buffer_size: u32,
    pub params: Params,
}

impl Connection {
    pub fn new(buffer_size: u32) -> Connection {
        Connection {
            output: LauncherPort::new(),
            input: LauncherPort::new(),
            buffer_size,
            ..Default::default()
        }
    }

    /// (mine, other) launcher sides for a port of the given direction.
    pub fn sides_mut(&mut self, provider: bool) -> (&mut LauncherPort, &mut LauncherPort) {
        if provider {
            (&mut self.input, &mut self.output)
        } else {
            (&mut self.output, &mut self.input)
        }
    }

    pub fn ready(&self) -> bool {
        self.input.done && self.output.done
    }
}

/// Pick the transport and roles for a connection.
///
/// Input side gets priority in a tie: the first input offer that
/// survives the constraints is matched against output offers of the
/// same family and instance id, and the roles are negotiated. Explicit
/// `transferRole` parameters become mandates; explicit `transport`
/// parameters constrain the family and must agree across the parameter
/// sets. Candidates whose roles cannot be reconciled are rejected with a
/// log line; if none survive, the last role error (or the no-transport
/// condition) is returned.
pub fn determine_transport(
    in_offers: &[TransportOffer],
    out_offers: &[TransportOffer],
    params_in: &Params,
    params_out: &Params,
    params_conn: &Params,
) -> Result<NegotiatedTransport> {
    let role_in = params_in
        .transfer_role
        .as_deref()
        .map(parse_transfer_role)
        .transpose()?;
    let role_out = params_out
        .transfer_role
        .as_deref()
        .map(parse_transfer_role)
        .transpose()?;

    let s_in = params_in.transport.as_deref().map(canonical_transport);
    let s_out = params_out.transport.as_deref().map(canonical_transport);
    let s_conn = params_conn.transport.as_deref().map(canonical_transport);
    let constraint = match (&s_conn, &s_in, &s_out) {
        (Some(c), i, o) => {
            if i.as_ref().is_some_and(|i| !i.eq_ignore_ascii_case(c))
                || o.as_ref().is_some_and(|o| !o.eq_ignore_ascii_case(c))
            {
                return Err(Error::InconsistentTransports(format!(
                    "connection \"{c}\" in \"{}\" out \"{}\"",
                    s_in.as_deref().unwrap_or("-"),
                    s_out.as_deref().unwrap_or("-")
                )));
            }
            Some(c.clone())
        }
        (None, Some(i), o) => {
            if o.as_ref().is_some_and(|o| !o.eq_ignore_ascii_case(i)) {
                return Err(Error::InconsistentTransports(format!(
                    "in \"{i}\" out \"{}\"",
                    s_out.as_deref().unwrap_or("-")
                )));
            }
            Some(i.clone())
        }
        (None, None, o) => o.clone(),
    };

    let mut role_err: Option<Error> = None;
    for it in in_offers {
        if constraint
            .as_ref()
            .is_some_and(|c| !c.eq_ignore_ascii_case(&it.transport))
        {
            log::info!(
                "rejecting input transport {} since {} was specified for the connection",
                it.transport,
                constraint.as_deref().unwrap()
            );
            continue;
        }
        if let Some(r) = role_in {
            if it.options_in & r.bit() == 0 {
                log::info!(
                    "rejecting input role {} for transport {}: container doesn't support it",
                    r.name(),
                    it.transport
                );
                continue;
            }
        }
        for ot in out_offers {
            if !it.transport.eq_ignore_ascii_case(&ot.transport) {
                continue;
            }
            if it.id != ot.id {
                log::info!(
                    "rejecting output transport {} since input id is {} but output id is {}",
                    ot.transport,
                    it.id,
                    ot.id
                );
                continue;
            }
            if let Some(r) = role_out {
                if ot.options_out & r.bit() == 0 {
                    log::info!(
                        "rejecting output role {} for transport {}: container doesn't support it",
                        r.name(),
                        ot.transport
                    );
                    continue;
                }
            }
            let mut nt = NegotiatedTransport {
                transport: it.transport.clone(),
                id: it.id.clone(),
                role_in: it.role_in,
                options_in: it.options_in,
                role_out: ot.role_out,
                options_out: ot.options_out,
            };
            if let Some(r) = role_in {
                nt.role_in = r;
                nt.options_in |= OPT_MANDATED_ROLE;
            }
            if let Some(r) = role_out {
                nt.role_out = r;
                nt.options_out |= OPT_MANDATED_ROLE;
            }
            match choose_roles(
                &mut nt.role_out,
                &mut nt.options_out,
                &mut nt.role_in,
                &mut nt.options_in,
            ) {
                Err(e) => {
                    log::info!(
                        "rejecting transport {} since role support is incompatible: {e}",
                        it.transport
                    );
                    role_err = Some(e);
                }
                Ok(()) => {
                    // Once agreed, the roles bind both sides.
                    nt.options_in |= OPT_MANDATED_ROLE;
                    nt.options_out |= OPT_MANDATED_ROLE;
                    log::info!(
                        "choosing transport {}/{} for connection with roles {}({:#x})->{}({:#x})",
                        nt.transport,
                        nt.id,
                        nt.role_out.name(),
                        nt.options_out,
                        nt.role_in.name(),
                        nt.options_in
                    );
                    return Ok(nt);
                }
            }
        }
    }
    Err(role_err.unwrap_or(Error::NoCompatibleTransport))
}
