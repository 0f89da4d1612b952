// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dataplane contributors
//
// The user-facing port.
//
// A port is one end of a connection. Its buffer cycle is get-for-write →
// put → get-for-read → release, strictly in ring order; holding a second
// buffer on the same side before committing or releasing the first is a
// usage error. Three modes:
//
//   shim    — both ends in-process; the port holds a shared ring. The
//             peer holds the same ring, which is also how an adapter
//             "forwards" to a shim: both handles name one object and the
//             link tears down symmetrically when either side drops.
//   remote  — buffer calls delegate to a transport-level port.
//   idle    — not yet connected.
//
// Connection establishment comes in three flavors: same-process shim
// wiring (no wire traffic), a strict four-step local ping-pong, and the
// repeatable remote start/finish driven by a launcher until both sides
// report done.

use std::sync::Arc;
use std::time::Duration;

use crate::circuit::{CircuitId, XferPort};
use crate::descriptor::{Descriptor, DescriptorKind};
use crate::error::{Error, Result};
use crate::launcher::{Connection, NegotiatedTransport};
use crate::params::Params;
use crate::ring::{MessageHeader, Ring, RingBuf, ZcRef, DEFAULT_BUFFER_SIZE, DEFAULT_NBUFFERS};
use crate::transport::Transport;

/// How long a connection request may spin on an unresponsive peer.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

enum Mode {
    Idle,
    Shim(Arc<Ring>),
    Remote(Arc<XferPort>),
}

enum HeldEmpty {
    Ring(u32),
    Remote { slot: u32, data: Vec<u8> },
}

enum HeldFull {
    Ring { ring: Arc<Ring>, slot: u32 },
    Remote { hdr: MessageHeader, data: Vec<u8> },
}

/// A full buffer taken from its port, transferable to another port's
/// consumer path without copying payload bytes.
pub struct FullBuffer {
    ring: Arc<Ring>,
    slot: u32,
}

impl FullBuffer {
    pub fn header(&self) -> MessageHeader {
        self.ring.header(self.slot)
    }

    pub fn data(&self) -> &[u8] {
        let len = self.ring.header(self.slot).length as usize;
        unsafe { self.ring.payload(self.slot, len) }
    }

    /// Release back to the home ring without forwarding.
    pub fn release(self) {
        self.ring.release(self.slot);
    }
}

struct RemoteState {
    circuit: CircuitId,
    requested: bool,
}

/// One end of a port-to-port link.
pub struct Port {
    name: String,
    provider: bool,
    desc: Descriptor,
    n_buffers: u32,
    buffer_size: u32,
    mode: Mode,
    last_out: Option<HeldEmpty>,
    last_in: Option<HeldFull>,
    remote: Option<RemoteState>,
    protocol_info: Option<Vec<u8>>,
    request_timeout: Duration,
}

impl Port {
    fn new(name: &str, provider: bool, params: &Params) -> Port {
        let n_buffers = params.buffer_count.unwrap_or(DEFAULT_NBUFFERS);
        let buffer_size = params.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE as u32);
        let kind = if provider {
            DescriptorKind::Consumer
        } else {
            DescriptorKind::Producer
        };
        let mut desc = Descriptor::new(kind);
        desc.n_buffers = n_buffers;
        desc.data_buffer_size = buffer_size;
        Port {
            name: name.to_string(),
            provider,
            desc,
            n_buffers,
            buffer_size,
            mode: Mode::Idle,
            last_out: None,
            last_in: None,
            remote: None,
            protocol_info: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// An input (provider) port.
    pub fn new_input(name: &str, params: &Params) -> Port {
        Port::new(name, true, params)
    }

    /// An output (user) port.
    pub fn new_output(name: &str, params: &Params) -> Port {
        Port::new(name, false, params)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_provider(&self) -> bool {
        self.provider
    }

    pub fn n_buffers(&self) -> u32 {
        self.n_buffers
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    pub fn set_buffer_size(&mut self, size: u32) {
        self.buffer_size = size;
        self.desc.data_buffer_size = size;
    }

    /// Protocol metadata to push to the peer's transport on connect.
    pub fn set_protocol_info(&mut self, blob: Vec<u8>) {
        self.protocol_info = Some(blob);
    }

    pub fn set_request_timeout(&mut self, t: Duration) {
        self.request_timeout = t;
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.desc
    }

    pub fn is_connected(&self) -> bool {
        !matches!(self.mode, Mode::Idle)
    }

    /// Copy the negotiated role and options for this side into the
    /// descriptor and adopt the connection's buffer size.
    pub fn apply_connection(&mut self, t: &NegotiatedTransport, buffer_size: u32) {
        self.desc.role = if self.provider { t.role_in } else { t.role_out };
        self.desc.options = if self.provider {
            t.options_in
        } else {
            t.options_out
        };
        if self.desc.oob.oep.is_empty() {
            self.desc.oob.oep = t.transport.clone();
        }
        self.set_buffer_size(buffer_size);
    }

    // -----------------------------------------------------------------
    // Producer-side buffer cycle
    // -----------------------------------------------------------------

    /// Claim the next empty buffer and expose its payload for writing.
    /// `None` means no slot is free; poll again after the consumer
    /// releases. Claiming twice without `put` is a usage error.
    pub fn get_buffer(&mut self) -> Result<Option<&mut [u8]>> {
        if self.provider {
            return Err(Error::usage(
                &self.name,
                "getBuffer for output port called on input port",
            ));
        }
        if self.last_out.is_some() {
            return Err(Error::usage(
                &self.name,
                "getBuffer called without putting previous buffer",
            ));
        }
        match &self.mode {
            Mode::Idle => Err(Error::usage(&self.name, "getBuffer on unconnected port")),
            Mode::Shim(ring) => match ring.next_empty() {
                None => Ok(None),
                Some(slot) => {
                    self.last_out = Some(HeldEmpty::Ring(slot));
                    Ok(Some(unsafe { ring.payload_mut(slot) }))
                }
            },
            Mode::Remote(x) => match x.next_empty_output() {
                None => Ok(None),
                Some(slot) => {
                    self.last_out = Some(HeldEmpty::Remote {
                        slot,
                        data: vec![0u8; self.buffer_size as usize],
                    });
                    match self.last_out.as_mut() {
                        Some(HeldEmpty::Remote { data, .. }) => Ok(Some(&mut data[..])),
                        _ => unreachable!(),
                    }
                }
            },
        }
    }

    /// Commit the claimed buffer. Once put, the producer may not touch
    /// it again.
    pub fn put(&mut self, length: u32, op_code: u8, end: bool, direct: u8) -> Result<()> {
        if self.provider {
            return Err(Error::usage(
                &self.name,
                "put of output port called on input port",
            ));
        }
        let hdr = MessageHeader {
            length,
            op_code,
            end,
            direct,
        };
        match self.last_out.take() {
            None => Err(Error::usage(&self.name, "put called without a previous buffer")),
            Some(HeldEmpty::Ring(slot)) => {
                let Mode::Shim(ring) = &self.mode else {
                    unreachable!()
                };
                ring.commit(slot, hdr);
                Ok(())
            }
            Some(HeldEmpty::Remote { slot, data }) => {
                let Mode::Remote(x) = &self.mode else {
                    unreachable!()
                };
                x.send_output(slot, hdr, &data)
            }
        }
    }

    /// Emit a standalone end-of-stream message. Like `get_buffer`, this
    /// backs off (returns false) when no slot is free.
    pub fn end_of_data(&mut self) -> Result<bool> {
        if self.provider {
            return Err(Error::usage(
                &self.name,
                "end of data for output port called on input port",
            ));
        }
        if self.last_out.is_some() {
            return Err(Error::usage(
                &self.name,
                "end of data called with a previous buffer",
            ));
        }
        if self.get_buffer()?.is_none() {
            return Ok(false);
        }
        self.put(0, 0, true, 0)?;
        Ok(true)
    }

    /// Whether committed-but-unconsumed data remains on this side.
    pub fn try_flush(&mut self) -> Result<bool> {
        if self.provider {
            return Err(Error::usage(
                &self.name,
                "tryFlush output port called on input port",
            ));
        }
        if self.last_out.is_some() {
            return Err(Error::usage(
                &self.name,
                "tryFlush called with a previous buffer",
            ));
        }
        Ok(match &self.mode {
            Mode::Shim(ring) => ring.in_flight() != 0,
            _ => false,
        })
    }

    // -----------------------------------------------------------------
    // Consumer-side buffer cycle
    // -----------------------------------------------------------------

    /// Take the next full message: header plus payload view. Zero-copy
    /// guests queued on the current slot are drained first. Holding a
    /// second buffer before release is a usage error.
    pub fn get_full(&mut self) -> Result<Option<(MessageHeader, &[u8])>> {
        if !self.provider {
            return Err(Error::usage(
                &self.name,
                "getBuffer for input port called on output port",
            ));
        }
        if self.last_in.is_some() {
            return Err(Error::usage(
                &self.name,
                "getBuffer called without releasing previous buffer",
            ));
        }
        let held = match &self.mode {
            Mode::Idle => {
                return Err(Error::usage(&self.name, "getBuffer on unconnected port"))
            }
            Mode::Shim(ring) => match ring.next_full() {
                None => return Ok(None),
                Some(RingBuf::Host(slot)) => HeldFull::Ring {
                    ring: ring.clone(),
                    slot,
                },
                Some(RingBuf::Guest(z)) => HeldFull::Ring {
                    ring: z.ring,
                    slot: z.slot,
                },
            },
            Mode::Remote(x) => match x.next_full_input() {
                None => return Ok(None),
                Some((hdr, data)) => HeldFull::Remote { hdr, data },
            },
        };
        self.last_in = Some(held);
        match self.last_in.as_ref() {
            Some(HeldFull::Ring { ring, slot }) => {
                let hdr = ring.header(*slot);
                Ok(Some((hdr, unsafe { ring.payload(*slot, hdr.length as usize) })))
            }
            Some(HeldFull::Remote { hdr, data }) => Ok(Some((*hdr, &data[..]))),
            None => unreachable!(),
        }
    }

    /// Peek the opcode of the next message without consuming it.
    pub fn peek_op_code(&mut self) -> Result<Option<u8>> {
        if !self.provider {
            return Err(Error::usage(&self.name, "peek called on output port"));
        }
        Ok(match &self.mode {
            Mode::Idle => None,
            Mode::Shim(ring) => ring.peek_op_code(),
            Mode::Remote(x) => x.peek_op_code(),
        })
    }

    /// Return the held buffer to the empty state.
    pub fn release(&mut self) -> Result<()> {
        if !self.provider {
            return Err(Error::usage(&self.name, "release called on output port"));
        }
        match self.last_in.take() {
            None => Err(Error::usage(
                &self.name,
                "release called without a previous buffer",
            )),
            Some(HeldFull::Ring { ring, slot }) => {
                ring.release(slot);
                Ok(())
            }
            Some(HeldFull::Remote { .. }) => {
                let Mode::Remote(x) = &self.mode else {
                    unreachable!()
                };
                x.release_input()
            }
        }
    }

    /// Detach the held full buffer for forwarding elsewhere; the caller
    /// becomes responsible for releasing it (possibly via another port's
    /// zero-copy path).
    pub fn take_buffer(&mut self) -> Result<FullBuffer> {
        if !self.provider {
            return Err(Error::usage(&self.name, "take called on output port"));
        }
        match self.last_in.take() {
            None => Err(Error::usage(&self.name, "take called with no current buffer")),
            Some(HeldFull::Ring { ring, slot }) => Ok(FullBuffer { ring, slot }),
            Some(h @ HeldFull::Remote { .. }) => {
                self.last_in = Some(h);
                Err(Error::usage(
                    &self.name,
                    "take of a transport-side buffer is not supported",
                ))
            }
        }
    }

    /// Zero-copy put: queue another port's full buffer onto this port's
    /// ring, ahead of this port's own messages.
    pub fn put_buffer(&mut self, buf: FullBuffer) -> Result<()> {
        match &self.mode {
            Mode::Shim(ring) => {
                ring.push_zero_copy(ZcRef {
                    ring: buf.ring,
                    slot: buf.slot,
                });
                Ok(())
            }
            _ => Err(Error::usage(
                &self.name,
                "zero-copy put to a non-shim port is not supported",
            )),
        }
    }

    /// Zero-copy put with a rewritten header.
    pub fn put_buffer_with(
        &mut self,
        buf: FullBuffer,
        length: u32,
        op_code: u8,
        end: bool,
        direct: u8,
    ) -> Result<()> {
        buf.ring.set_header(
            buf.slot,
            MessageHeader {
                length,
                op_code,
                end,
                direct,
            },
        );
        self.put_buffer(buf)
    }

    /// Committed-but-unread messages visible on this port.
    pub fn full_count(&self) -> u32 {
        match &self.mode {
            Mode::Shim(ring) => ring.full_count(),
            _ => 0,
        }
    }

    /// Free producer slots on this port.
    pub fn empty_count(&self) -> u32 {
        match &self.mode {
            Mode::Shim(ring) => ring.empty_count(),
            _ => 0,
        }
    }

    // -----------------------------------------------------------------
    // Connection establishment
    // -----------------------------------------------------------------

    /// Become the ring owner of an in-process connection (also used by
    /// scaled ports, whose worker side runs against this ring).
    pub fn become_shim(&mut self) -> Arc<Ring> {
        let ring = Ring::new(self.n_buffers, self.buffer_size as usize);
        self.mode = Mode::Shim(ring.clone());
        ring
    }

    /// Redirect this port's buffer API onto `target`'s shim ring
    /// (codec/adapter insertion in front of a worker port). Both handles
    /// then name one ring; dropping either side detaches it without
    /// touching the other.
    pub fn forward_to(&mut self, target: &Port) -> Result<()> {
        match &target.mode {
            Mode::Shim(ring) => {
                self.mode = Mode::Shim(ring.clone());
                Ok(())
            }
            _ => Err(Error::usage(&self.name, "forward target is not a shim")),
        }
    }

    /// Wire two same-process ports to one shared ring: no wire traffic,
    /// both sides immediately done.
    pub fn connect_in_process(&mut self, other: &mut Port, c: &mut Connection) {
        assert_ne!(self.provider, other.provider, "need one input and one output");
        other.set_buffer_size(self.buffer_size);
        let ring = self.become_shim();
        other.mode = Mode::Shim(ring);
        c.input.done = true;
        c.output.done = true;
        log::debug!(
            "in-process connection {} <-> {} ({} x {} bytes)",
            self.name,
            other.name,
            self.n_buffers,
            self.buffer_size
        );
    }

    /// Four-step synchronous ping-pong for two ports in the same process
    /// but different containers: output descriptor, input feedback,
    /// output confirmation. No partial completion is valid here.
    pub fn connect_local(
        &mut self,
        other: &mut Port,
        t: &mut Transport,
        c: &mut Connection,
    ) -> Result<()> {
        assert_ne!(self.provider, other.provider, "need one input and one output");
        let (inp, outp): (&mut Port, &mut Port) = if self.provider {
            (self, other)
        } else {
            (other, self)
        };
        let (r1, mut in_done) = inp.start_connect(t, None)?;
        let d_in = r1.expect("input must produce an initial descriptor");
        assert!(!in_done);
        let (r2, mut out_done) = outp.start_connect(t, Some(&d_in))?;
        if let Some(d_out) = r2 {
            let (r3, in_done2) = inp.finish_connect(t, &d_out)?;
            in_done = in_done2;
            assert!((r3.is_some() && !out_done) || (r3.is_none() && out_done));
            if let Some(d_fb) = r3 {
                let (r4, out_done2) = outp.finish_connect(t, &d_fb)?;
                out_done = out_done2;
                assert!(r4.is_none());
            }
        }
        assert!(in_done && out_done, "local connect must complete in one pass");
        c.input.done = true;
        c.output.done = true;
        Ok(())
    }

    /// Start or continue this side of the connection. Returns the
    /// descriptor to hand the peer (when there is one) and whether this
    /// side can operate.
    pub fn start_connect(
        &mut self,
        t: &mut Transport,
        other: Option<&Descriptor>,
    ) -> Result<(Option<Descriptor>, bool)> {
        if self.provider {
            if self.remote.is_none() {
                let (circuit, xfer) = t.create_input_port(
                    self.n_buffers,
                    self.buffer_size,
                    other.map(|d| d.oob.oep.as_str()),
                )?;
                self.remote = Some(RemoteState {
                    circuit,
                    requested: false,
                });
                self.mode = Mode::Remote(xfer);
            }
            if let Some(o) = other {
                return self.finish_connect(t, o);
            }
            Ok((Some(self.resolved_descriptor()), false))
        } else {
            let Some(o) = other else {
                // Nothing to do until the input side is heard from.
                return Ok((None, false));
            };
            if self.remote.is_none() {
                let (circuit, xfer) = t.create_output_port(o)?;
                self.remote = Some(RemoteState {
                    circuit,
                    requested: false,
                });
                self.mode = Mode::Remote(xfer);
            }
            // Cross-address-space peers get the out-of-band NewConnection
            // request; a timed-out request is retried on the next pass
            // with the same circuit id.
            let st = self.remote.as_ref().unwrap();
            if !st.requested && !t.is_local_endpoint(&o.oob.oep) {
                let circuit = st.circuit;
                let protocol = self.protocol_info.clone();
                t.request_new_connection(
                    circuit,
                    &o.oob.oep,
                    true,
                    self.buffer_size,
                    protocol.as_deref(),
                    self.request_timeout,
                )?;
                self.remote.as_mut().unwrap().requested = true;
            }
            self.finish_connect(t, o)
        }
    }

    /// Consume the peer's (initial or final) descriptor and try to
    /// complete this side.
    pub fn finish_connect(
        &mut self,
        t: &mut Transport,
        other: &Descriptor,
    ) -> Result<(Option<Descriptor>, bool)> {
        match &self.mode {
            Mode::Idle => {
                assert!(!self.provider, "input finish before start");
                self.start_connect(t, Some(other))
            }
            Mode::Remote(x) => {
                x.finalize(other);
                if self.provider {
                    // Everything needed arrived with the peer descriptor.
                    Ok((None, true))
                } else {
                    Ok((Some(self.resolved_descriptor()), true))
                }
            }
            Mode::Shim(_) => Err(Error::usage(&self.name, "finishConnect on a shim port")),
        }
    }

    /// Pack this side's best-known descriptor for the peer. Returns true
    /// while more peer information is still needed. On failure (decode,
    /// unresponsive peer) the peer's descriptor is left in place so a
    /// later pass can resume the partial handshake.
    pub fn start_remote(&mut self, c: &mut Connection, t: &mut Transport) -> Result<bool> {
        let provider = self.provider;
        let (p, other) = c.sides_mut(provider);
        assert!(!p.done);
        let other_info = match other.initial_info.is_empty() {
            true => None,
            false => Some(Descriptor::decode(&other.initial_info)?),
        };
        let (result, done) = self.start_connect(t, other_info.as_ref())?;
        let (p, other) = c.sides_mut(provider);
        if other_info.is_some() {
            other.initial_info.clear();
        }
        if let Some(desc) = result {
            p.started = true;
            p.initial_info = desc.encode();
        }
        p.done = done;
        Ok(!done)
    }

    /// Consume the peer's most recent descriptor (final preferred over
    /// initial) and try to complete. Calling with no new peer data is a
    /// no-op, not an error. Returns true while more is needed. Like
    /// `start_remote`, peer data survives a failed attempt.
    pub fn finish_remote(&mut self, c: &mut Connection, t: &mut Transport) -> Result<bool> {
        let provider = self.provider;
        let (p, other) = c.sides_mut(provider);
        if p.done {
            return Ok(false);
        }
        let from_final = !other.final_info.is_empty();
        let peer = if from_final {
            Descriptor::decode(&other.final_info)?
        } else if !other.initial_info.is_empty() {
            Descriptor::decode(&other.initial_info)?
        } else {
            return Ok(true); // nothing new yet
        };
        let (result, done) = self.finish_connect(t, &peer)?;
        let (p, other) = c.sides_mut(provider);
        if from_final {
            other.final_info.clear();
        } else {
            other.initial_info.clear();
        }
        if let Some(desc) = result {
            let packed = desc.encode();
            if p.started {
                p.final_info = packed;
            } else {
                p.initial_info = packed;
            }
            p.started = true;
        }
        p.done = done;
        Ok(!done)
    }

    /// This side's descriptor with transport-level addresses resolved.
    fn resolved_descriptor(&self) -> Descriptor {
        let mut d = match &self.mode {
            Mode::Remote(x) => x.descriptor(),
            _ => self.desc.clone(),
        };
        d.kind = self.desc.kind;
        d.role = self.desc.role;
        d.options = self.desc.options;
        if let Some(st) = &self.remote {
            d.oob.cookie = st.circuit as u64;
        }
        d
    }

    /// The circuit backing this port's remote mode, if any.
    pub fn circuit_id(&self) -> Option<CircuitId> {
        self.remote.as_ref().map(|r| r.circuit)
    }

    /// The transport-level port backing this port's remote mode, if any.
    pub fn remote_port(&self) -> Option<&Arc<XferPort>> {
        match &self.mode {
            Mode::Remote(x) => Some(x),
            _ => None,
        }
    }
}
