// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dataplane contributors
//
// Circuits and transport-level ports.
//
// A circuit bundles the transport-level ports of one established
// connection: one output port and one or more input ports, identified by
// a process-wide unique id (the id travels in mailbox requests, so a
// retried NewConnection for the same id replaces rather than duplicates).
//
// A transport-level port owns regions in its endpoint's arena:
//
//   input side:  data[n] · meta[n] · full flags[n] · feedback source word
//   output side: staging[n] · empty-shadow flags[n] · full source word
//
// The output stages a message locally, then posts one transfer: payload
// and metadata copies first, the peer's full-flag write last. The input
// consumes when its local full flag goes nonzero and releases by posting
// the peer's empty-flag write. Flag words are the only cross-endpoint
// synchronization; they land after the data they cover.

use std::sync::{Arc, Mutex};

use crate::descriptor::{Descriptor, DescriptorKind};
use crate::endpoint::{CopySpec, EndPoint, Fabric, Transfer};
use crate::error::{Error, Result};
use crate::ring::MessageHeader;

/// Process-wide circuit identifier (carried in mailbox requests).
pub type CircuitId = u32;

/// Bytes of encoded per-message metadata.
pub const META_BYTES: u32 = 8;
/// Bytes of one flag word.
pub const FLAG_BYTES: u32 = 8;

fn encode_meta(h: &MessageHeader) -> [u8; META_BYTES as usize] {
    let mut b = [0u8; META_BYTES as usize];
    b[0..4].copy_from_slice(&h.length.to_ne_bytes());
    b[4] = h.op_code;
    b[5] = h.end as u8;
    b[6] = h.direct;
    b
}

fn decode_meta(b: &[u8]) -> MessageHeader {
    MessageHeader {
        length: u32::from_ne_bytes(b[0..4].try_into().unwrap()),
        op_code: b[4],
        end: b[5] != 0,
        direct: b[6],
    }
}

struct XferState {
    desc: Descriptor,
    peer: Option<Descriptor>,
    /// Consumer cursor (input) / producer cursor (output).
    next_get: u32,
    /// Input release cursor.
    next_release: u32,
    /// Output slots claimed but not yet sent.
    claimed: u32,
}

/// A transport-level port: one side of a circuit, backed by arena regions
/// in its endpoint.
pub struct XferPort {
    pub provider: bool,
    pub endpoint: Arc<EndPoint>,
    fabric: Arc<Fabric>,
    n: u32,
    buffer_size: u32,
    data_base: u64,
    meta_base: u64,
    /// Input: local full flags. Output: local empty-shadow flags.
    flag_base: u64,
    /// One word holding the value this side writes into the peer's flags.
    flag_src: u64,
    state: Mutex<XferState>,
}

impl XferPort {
    /// Create the input (provider) side: allocate receive regions and
    /// resolve the descriptor other sides will be given.
    pub fn new_input(
        fabric: &Arc<Fabric>,
        endpoint: &Arc<EndPoint>,
        n: u32,
        buffer_size: u32,
        port_id: u64,
    ) -> Result<Arc<XferPort>> {
        let mem = &endpoint.mem;
        let data_base = mem.alloc(n * buffer_size, "input data region")?;
        let meta_base = mem.alloc(n * META_BYTES, "input metadata region")?;
        let flag_base = mem.alloc(n * FLAG_BYTES, "input full flags")?;
        let flag_src = mem.alloc(FLAG_BYTES, "flag source")?;

        let mut desc = Descriptor::new(DescriptorKind::Consumer);
        desc.n_buffers = n;
        desc.data_buffer_base = data_base;
        desc.data_buffer_pitch = buffer_size;
        desc.data_buffer_size = buffer_size;
        desc.metadata_base = meta_base;
        desc.metadata_pitch = META_BYTES;
        desc.full_flag_base = flag_base;
        desc.full_flag_size = FLAG_BYTES;
        desc.full_flag_pitch = FLAG_BYTES;
        desc.full_flag_value = 1;
        desc.oob.port_id = port_id;
        desc.oob.oep = endpoint.name.clone();
        desc.oob.address = endpoint.address;

        Ok(Arc::new(XferPort {
            provider: true,
            endpoint: endpoint.clone(),
            fabric: fabric.clone(),
            n,
            buffer_size,
            data_base,
            meta_base,
            flag_base,
            flag_src,
            state: Mutex::new(XferState {
                desc,
                peer: None,
                next_get: 0,
                next_release: 0,
                claimed: 0,
            }),
        }))
    }

    /// Create the output (user) side against a known input descriptor:
    /// allocate staging and shadow regions, resolve the feedback
    /// descriptor the input will be given.
    pub fn new_output(
        fabric: &Arc<Fabric>,
        endpoint: &Arc<EndPoint>,
        peer: &Descriptor,
        port_id: u64,
    ) -> Result<Arc<XferPort>> {
        let n = peer.n_buffers;
        let buffer_size = peer.data_buffer_size;
        let mem = &endpoint.mem;
        let data_base = mem.alloc(n * buffer_size, "output staging region")?;
        let meta_base = mem.alloc(n * META_BYTES, "output staging metadata")?;
        let flag_base = mem.alloc(n * FLAG_BYTES, "output empty-shadow flags")?;
        let flag_src = mem.alloc(FLAG_BYTES, "flag source")?;

        let mut desc = Descriptor::new(DescriptorKind::Producer);
        desc.n_buffers = n;
        desc.data_buffer_base = data_base;
        desc.data_buffer_pitch = buffer_size;
        desc.data_buffer_size = buffer_size;
        desc.metadata_base = meta_base;
        desc.metadata_pitch = META_BYTES;
        desc.empty_flag_base = flag_base;
        desc.empty_flag_size = FLAG_BYTES;
        desc.empty_flag_pitch = FLAG_BYTES;
        desc.empty_flag_value = 1;
        desc.oob.port_id = port_id;
        desc.oob.oep = endpoint.name.clone();
        desc.oob.address = endpoint.address;

        // Writing the peer's full flag publishes a message; stage the
        // value once.
        mem.write_flag(flag_src, peer.full_flag_value.max(1));
        // All slots start empty.
        for i in 0..n {
            mem.write_flag(flag_base + (i * FLAG_BYTES) as u64, desc.empty_flag_value);
        }

        Ok(Arc::new(XferPort {
            provider: false,
            endpoint: endpoint.clone(),
            fabric: fabric.clone(),
            n,
            buffer_size,
            data_base,
            meta_base,
            flag_base,
            flag_src,
            state: Mutex::new(XferState {
                desc,
                peer: Some(peer.clone()),
                next_get: 0,
                next_release: 0,
                claimed: 0,
            }),
        }))
    }

    pub fn n_buffers(&self) -> u32 {
        self.n
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// This side's resolved descriptor.
    pub fn descriptor(&self) -> Descriptor {
        self.state.lock().unwrap().desc.clone()
    }

    /// Whether the peer descriptor has been consumed.
    pub fn finalized(&self) -> bool {
        self.state.lock().unwrap().peer.is_some()
    }

    /// The peer's descriptor, once consumed.
    pub fn peer_descriptor(&self) -> Option<Descriptor> {
        self.state.lock().unwrap().peer.clone()
    }

    /// Consume the peer's descriptor. Idempotent for a repeated identical
    /// descriptor; the last one wins otherwise (a retried handshake may
    /// resend with more fields resolved).
    pub fn finalize(&self, peer: &Descriptor) {
        let mut st = self.state.lock().unwrap();
        if self.provider {
            // Input release feedback goes to the output's shadow flags.
            let mem = &self.endpoint.mem;
            mem.write_flag(self.flag_src, peer.empty_flag_value.max(1));
        }
        st.peer = Some(peer.clone());
    }

    // --- output data path ---

    /// Claim the next staging slot, or `None` when the input has not yet
    /// freed it. Never blocks.
    pub fn next_empty_output(&self) -> Option<u32> {
        let mut st = self.state.lock().unwrap();
        if st.claimed != 0 {
            return None; // one claim at a time, committed in ring order
        }
        let idx = st.next_get % self.n;
        let mem = &self.endpoint.mem;
        let empty = st.desc.empty_flag_value;
        if mem.read_flag(self.flag_base + (idx * FLAG_BYTES) as u64) != empty {
            return None;
        }
        // Claimed: not empty, not yet sent.
        mem.write_flag(self.flag_base + (idx * FLAG_BYTES) as u64, 0);
        st.claimed = 1;
        Some(idx)
    }

    /// Stage and post the claimed slot: payload + metadata copies, then
    /// the peer's full-flag write.
    pub fn send_output(&self, slot: u32, hdr: MessageHeader, data: &[u8]) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        assert_eq!(slot, st.next_get % self.n, "send out of ring order");
        assert_eq!(st.claimed, 1);
        let peer = st
            .peer
            .as_ref()
            .ok_or(Error::Usage("send before connection is finalized".into()))?
            .clone();
        let mem = &self.endpoint.mem;
        let stage = self.data_base + (slot * self.buffer_size) as u64;
        mem.write(stage, &data[..(hdr.length as usize).min(data.len())]);
        let meta = self.meta_base + (slot * META_BYTES) as u64;
        mem.write(meta, &encode_meta(&hdr));

        let mut t = Transfer::new();
        t.copies.push(CopySpec {
            from_ep: self.endpoint.name.clone(),
            from: stage,
            to_ep: peer.oob.oep.clone(),
            to: peer.data_buffer_base + (slot * peer.data_buffer_pitch) as u64,
            len: hdr.length.min(self.buffer_size),
        });
        t.copies.push(CopySpec {
            from_ep: self.endpoint.name.clone(),
            from: meta,
            to_ep: peer.oob.oep.clone(),
            to: peer.metadata_base + (slot * peer.metadata_pitch) as u64,
            len: META_BYTES,
        });
        t.flag = Some(CopySpec {
            from_ep: self.endpoint.name.clone(),
            from: self.flag_src,
            to_ep: peer.oob.oep.clone(),
            to: peer.full_flag_base + (slot * peer.full_flag_pitch) as u64,
            len: FLAG_BYTES,
        });
        self.fabric.post(t);
        log::trace!(
            "posted output buffer {} len {} op {} to {}",
            slot,
            hdr.length,
            hdr.op_code,
            peer.oob.oep
        );
        st.claimed = 0;
        st.next_get = st.next_get.wrapping_add(1);
        Ok(())
    }

    // --- input data path ---

    /// Read the next delivered message, or `None`. The slot stays full
    /// until `release_input`.
    pub fn next_full_input(&self) -> Option<(MessageHeader, Vec<u8>)> {
        let st = self.state.lock().unwrap();
        let idx = st.next_get % self.n;
        let mem = &self.endpoint.mem;
        if mem.read_flag(self.flag_base + (idx * FLAG_BYTES) as u64) == 0 {
            return None;
        }
        let meta = mem.read(self.meta_base + (idx * META_BYTES) as u64, META_BYTES);
        let hdr = decode_meta(&meta);
        let data = mem.read(
            self.data_base + (idx * self.buffer_size) as u64,
            hdr.length.min(self.buffer_size),
        );
        drop(st);
        let mut st = self.state.lock().unwrap();
        st.next_get = st.next_get.wrapping_add(1);
        Some((hdr, data))
    }

    /// Opcode of the next delivered message, without consuming it.
    pub fn peek_op_code(&self) -> Option<u8> {
        let st = self.state.lock().unwrap();
        let idx = st.next_get % self.n;
        let mem = &self.endpoint.mem;
        if mem.read_flag(self.flag_base + (idx * FLAG_BYTES) as u64) == 0 {
            return None;
        }
        let meta = mem.read(self.meta_base + (idx * META_BYTES) as u64, META_BYTES);
        Some(decode_meta(&meta).op_code)
    }

    /// Return the oldest read slot to the empty state and post the
    /// flow-control feedback to the output's shadow flags.
    pub fn release_input(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let idx = st.next_release % self.n;
        let peer = st
            .peer
            .as_ref()
            .ok_or(Error::Usage("release before connection is finalized".into()))?
            .clone();
        let mem = &self.endpoint.mem;
        mem.write_flag(self.flag_base + (idx * FLAG_BYTES) as u64, 0);
        let mut t = Transfer::new();
        t.flag = Some(CopySpec {
            from_ep: self.endpoint.name.clone(),
            from: self.flag_src,
            to_ep: peer.oob.oep.clone(),
            to: peer.empty_flag_base + (idx * peer.empty_flag_pitch) as u64,
            len: FLAG_BYTES,
        });
        self.fabric.post(t);
        st.next_release = st.next_release.wrapping_add(1);
        Ok(())
    }

    /// (from, to) pairs shipping this port's current flag words into the
    /// requester's arena at `return_offset`. Used by the mailbox offset
    /// requests to sync control state not carried in descriptors.
    pub fn get_offsets(&self, requester_ep: &str, return_offset: u64) -> Vec<CopySpec> {
        (0..self.n)
            .map(|i| CopySpec {
                from_ep: self.endpoint.name.clone(),
                from: self.flag_base + (i * FLAG_BYTES) as u64,
                to_ep: requester_ep.to_string(),
                to: return_offset + (i * FLAG_BYTES) as u64,
                len: FLAG_BYTES,
            })
            .collect()
    }
}

impl Drop for XferPort {
    fn drop(&mut self) {
        let mem = &self.endpoint.mem;
        mem.free(self.data_base, self.n * self.buffer_size);
        mem.free(self.meta_base, self.n * META_BYTES);
        mem.free(self.flag_base, self.n * FLAG_BYTES);
        mem.free(self.flag_src, FLAG_BYTES);
    }
}

/// The runtime bundle of one established connection's port-sets.
pub struct Circuit {
    pub id: CircuitId,
    pub output: Option<Arc<XferPort>>,
    pub inputs: Vec<Arc<XferPort>>,
    /// Protocol-metadata blob staged (client) or awaited (server):
    /// (size, arena offset).
    pub protocol: Option<(u32, u64)>,
    /// No data may flow yet.
    pub open: bool,
}

impl Circuit {
    pub fn new(id: CircuitId) -> Circuit {
        Circuit {
            id,
            output: None,
            inputs: Vec::new(),
            protocol: None,
            open: true,
        }
    }

    /// Find the output port by its out-of-band port id.
    pub fn output_port(&self, port_id: u64) -> Result<&Arc<XferPort>> {
        match &self.output {
            Some(p) if p.descriptor().oob.port_id == port_id => Ok(p),
            _ => Err(Error::UnknownCircuit(self.id)),
        }
    }

    /// Find an input port by its out-of-band port id.
    pub fn input_port(&self, port_id: u64) -> Result<&Arc<XferPort>> {
        self.inputs
            .iter()
            .find(|p| p.descriptor().oob.port_id == port_id)
            .ok_or(Error::UnknownCircuit(self.id))
    }
}
