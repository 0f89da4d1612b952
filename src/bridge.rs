// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dataplane contributors
//
// Scaled-port bridging: one logical worker port connected to a crew of M
// peer members through M bridge sub-ports.
//
// The worker side runs against a local shim ring; a bridge pump moves
// messages between that ring and the sub-ports according to the
// distribution policy selected once, at first peer attach, from the
// (output distribution × input distribution) table. Unsupported
// combinations are a configuration error at setup, never a runtime
// crash.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::launcher::Connection;
use crate::params::Params;
use crate::port::Port;
use crate::ring::{Ring, RingBuf};

/// Distribution declared in port metadata, per message operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Distribution {
    All,
    Cyclic,
    First,
    Balanced,
    Directed,
    Random,
    Hashed,
}

/// Runtime distribution mode of one bridge op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeMode {
    All,
    Cyclic,
    CyclicSparse,
    CyclicModulo,
    Balanced,
    Directed,
    Hashed,
    AsAvailable,
    Discard,
}

/// One message operation's scaling metadata.
#[derive(Debug, Clone)]
pub struct OpDef {
    pub distribution: Distribution,
    /// (offset, length) of the payload field hashed for `Hashed`.
    pub hash_field: Option<(usize, usize)>,
}

impl OpDef {
    pub fn new(distribution: Distribution) -> OpDef {
        OpDef {
            distribution,
            hash_field: None,
        }
    }
}

/// The scaling-relevant slice of a port's metadata.
#[derive(Debug, Clone)]
pub struct PortMeta {
    pub name: String,
    pub ops: Vec<OpDef>,
}

impl PortMeta {
    /// Metadata with one (or zero) declared operations, all using `d`.
    pub fn single(name: &str, d: Distribution) -> PortMeta {
        PortMeta {
            name: name.to_string(),
            ops: vec![OpDef::new(d)],
        }
    }

    fn op(&self, op: usize) -> OpDef {
        self.ops
            .get(op)
            .cloned()
            .unwrap_or_else(|| OpDef::new(Distribution::Cyclic))
    }

    fn n_ops(&self) -> usize {
        self.ops.len()
    }
}

/// Crew geometry of one connection.
#[derive(Debug, Clone, Copy)]
pub struct ConnScale {
    pub out_scale: usize,
    pub out_index: usize,
    pub in_scale: usize,
    pub in_index: usize,
}

impl ConnScale {
    pub fn from_connection(c: &Connection) -> ConnScale {
        ConnScale {
            out_scale: c.output.scale,
            out_index: c.output.index,
            in_scale: c.input.scale,
            in_index: c.input.index,
        }
    }
}

/// Per-(port, op) distribution state.
#[derive(Debug, Clone)]
pub struct BridgeOp {
    pub mode: BridgeMode,
    pub first: usize,
    pub last: usize,
    pub next: usize,
    pub hash_field: Option<(usize, usize)>,
}

/// The range of input members an output member sends to, spreading the
/// remainder over the leading members. Returns true when empty.
fn partial_range(
    out_scale: usize,
    out_index: usize,
    in_scale: usize,
    first: &mut usize,
    last: &mut usize,
) -> bool {
    let minper = in_scale / out_scale;
    let nbumped = in_scale % out_scale;
    *first = out_index * minper + nbumped.min(out_index);
    *last = *first + minper + if out_index < nbumped { 1 } else { 0 };
    *last = last.saturating_sub(1);
    log::debug!("partial_range({out_scale}, {out_index}, {in_scale} -> {first} to {last})");
    *first >= in_scale
}

/// The single sending member that feeds one input member.
fn partial_sender(out_scale: usize, in_scale: usize, in_index: usize) -> usize {
    in_index * out_scale / in_scale
}

type Setup = fn(&ConnScale, &OpDef, &mut BridgeOp);

// Output-side setups.

fn o_all_partial(s: &ConnScale, _op: &OpDef, bo: &mut BridgeOp) {
    bo.mode = if partial_range(s.out_scale, s.out_index, s.in_scale, &mut bo.first, &mut bo.last)
    {
        BridgeMode::Discard
    } else {
        BridgeMode::All
    };
    bo.next = bo.first;
}

fn o_cyclic_partial(s: &ConnScale, _op: &OpDef, bo: &mut BridgeOp) {
    bo.mode = if partial_range(s.out_scale, s.out_index, s.in_scale, &mut bo.first, &mut bo.last)
    {
        BridgeMode::Discard
    } else {
        BridgeMode::CyclicSparse
    };
}

fn o_balanced_partial(s: &ConnScale, _op: &OpDef, bo: &mut BridgeOp) {
    bo.mode = if partial_range(s.out_scale, s.out_index, s.in_scale, &mut bo.first, &mut bo.last)
    {
        BridgeMode::Discard
    } else {
        BridgeMode::Balanced
    };
}

fn o_balanced(_s: &ConnScale, _op: &OpDef, bo: &mut BridgeOp) {
    bo.mode = BridgeMode::Balanced;
}

fn o_hashed_partial(s: &ConnScale, op: &OpDef, bo: &mut BridgeOp) {
    bo.mode = if partial_range(s.out_scale, s.out_index, s.in_scale, &mut bo.first, &mut bo.last)
    {
        BridgeMode::Discard
    } else {
        BridgeMode::Hashed
    };
    bo.hash_field = op.hash_field;
}

fn o_hashed(_s: &ConnScale, op: &OpDef, bo: &mut BridgeOp) {
    bo.mode = BridgeMode::Hashed;
    bo.hash_field = op.hash_field;
}

fn o_first_to_first(s: &ConnScale, _op: &OpDef, bo: &mut BridgeOp) {
    if s.out_index == 0 {
        bo.first = 0;
        bo.last = 0;
        bo.mode = BridgeMode::All;
    } else {
        bo.mode = BridgeMode::Discard;
    }
}

fn o_first(_s: &ConnScale, _op: &OpDef, bo: &mut BridgeOp) {
    bo.first = 0;
    bo.last = 0;
    bo.mode = BridgeMode::All;
}

fn o_all(_s: &ConnScale, _op: &OpDef, bo: &mut BridgeOp) {
    bo.mode = BridgeMode::All;
    bo.next = bo.first;
}

fn o_directed(_s: &ConnScale, _op: &OpDef, bo: &mut BridgeOp) {
    bo.mode = BridgeMode::Directed;
}

fn io_cyclic(_s: &ConnScale, _op: &OpDef, bo: &mut BridgeOp) {
    bo.mode = BridgeMode::Cyclic;
}

fn o_cyclic_modulo(s: &ConnScale, _op: &OpDef, bo: &mut BridgeOp) {
    bo.mode = BridgeMode::CyclicModulo;
    bo.next = s.out_index % s.in_scale;
}

// Input-side setups.

fn i_cyclic_modulo(s: &ConnScale, _op: &OpDef, bo: &mut BridgeOp) {
    bo.mode = BridgeMode::CyclicModulo;
    bo.next = s.in_index % s.out_scale;
}

fn i_first_to_first(s: &ConnScale, _op: &OpDef, bo: &mut BridgeOp) {
    if s.in_index == 0 {
        bo.first = 0;
        bo.last = 0;
        bo.mode = BridgeMode::AsAvailable;
    } else {
        bo.mode = BridgeMode::Discard;
    }
}

fn i_first_cyclic(s: &ConnScale, _op: &OpDef, bo: &mut BridgeOp) {
    bo.mode = if s.in_index == 0 {
        BridgeMode::Cyclic
    } else {
        BridgeMode::Discard
    };
}

fn i_first(_s: &ConnScale, _op: &OpDef, bo: &mut BridgeOp) {
    bo.first = 0;
    bo.last = 0;
    bo.mode = BridgeMode::AsAvailable;
}

fn i_any(_s: &ConnScale, _op: &OpDef, bo: &mut BridgeOp) {
    bo.mode = BridgeMode::AsAvailable;
}

fn i_one_partial(s: &ConnScale, _op: &OpDef, bo: &mut BridgeOp) {
    bo.first = partial_sender(s.out_scale, s.in_scale, s.in_index);
    bo.last = bo.first;
    bo.mode = BridgeMode::AsAvailable;
}

/// The (output distribution × input distribution) table. Each pair is
/// (output-side setup, input-side setup); unsupported combinations are a
/// checked configuration error.
fn setup_fns(out_d: Distribution, in_d: Distribution) -> Result<(Setup, Setup)> {
    use Distribution::*;
    Ok(match (out_d, in_d) {
        (All, All) => (o_all_partial, i_one_partial),
        (All, Cyclic) => (o_cyclic_partial, i_one_partial),
        (All, First) => (o_first_to_first, i_first_to_first),
        (All, Balanced) => (o_balanced_partial, i_any),
        (All, Random) => (o_cyclic_partial, i_one_partial),
        (All, Hashed) => (o_hashed_partial, i_any),

        (Cyclic, All) => (o_all, io_cyclic),
        (Cyclic, Cyclic) => (o_cyclic_modulo, i_cyclic_modulo),
        (Cyclic, First) => (o_first, i_first_cyclic),
        (Cyclic, Balanced) => (o_balanced, i_any),
        (Cyclic, Random) => (o_cyclic_partial, i_one_partial),
        (Cyclic, Hashed) => (o_hashed, i_any),

        (First, All) => (o_all, i_first),
        (First, Cyclic) => (io_cyclic, i_first),
        (First, First) => (o_first, i_first),
        (First, Balanced) => (o_balanced, i_any),
        (First, Random) => (io_cyclic, i_first),
        (First, Hashed) => (o_hashed, i_any),

        (Directed, All) => (o_all, i_any),
        (Directed, Cyclic) => (o_directed, i_any),
        (Directed, First) => (o_first, i_first),
        (Directed, Balanced) => (o_directed, i_any),
        (Directed, Random) => (o_directed, i_any),
        (Directed, Hashed) => (o_hashed, i_any),

        (Random, All) => (o_all, i_any),
        (Random, Cyclic) => (o_cyclic_partial, i_any),
        (Random, First) => (o_first, i_any),
        (Random, Balanced) => (o_cyclic_partial, i_one_partial),
        (Random, Random) => (o_cyclic_partial, i_one_partial),
        (Random, Hashed) => (o_hashed, i_any),

        (Balanced, _) | (Hashed, _) | (_, Directed) => {
            return Err(Error::Config(format!(
                "incompatible distributions between output ({out_d:?}) and input ({in_d:?})"
            )))
        }
    })
}

fn hash_bytes(data: &[u8]) -> u64 {
    let mut h = DefaultHasher::new();
    h.write(data);
    h.finish()
}

enum LocalBuf {
    /// A full worker message being distributed (output side).
    Full { ring: Arc<Ring>, slot: u32 },
    /// An empty worker slot awaiting a collected message (input side).
    Empty { slot: u32 },
}

/// A worker port scaled against a crew of M peers: the worker-facing
/// port plus M bridge sub-ports and the pump between them.
pub struct ScaledPort {
    name: String,
    provider: bool,
    /// This side's own crew scale.
    scale: usize,
    worker: Port,
    ring: Option<Arc<Ring>>,
    bridges: Vec<Port>,
    ops: Vec<BridgeOp>,
    connected: usize,
    next_bridge: usize,
    local: Option<LocalBuf>,
    current_op: Option<usize>,
}

impl ScaledPort {
    fn new(name: &str, provider: bool, crew: usize, params: &Params) -> ScaledPort {
        assert!(crew > 0);
        let worker = if provider {
            Port::new_input(name, params)
        } else {
            Port::new_output(name, params)
        };
        let bridges = (0..crew)
            .map(|i| {
                let bname = format!("{name}.bridge{i}");
                if provider {
                    Port::new_input(&bname, params)
                } else {
                    Port::new_output(&bname, params)
                }
            })
            .collect();
        ScaledPort {
            name: name.to_string(),
            provider,
            scale: 1,
            worker,
            ring: None,
            bridges,
            ops: Vec::new(),
            connected: 0,
            next_bridge: 0,
            local: None,
            current_op: None,
        }
    }

    /// An output port fanning out to a crew of `crew` input members.
    pub fn new_output(name: &str, crew: usize, params: &Params) -> ScaledPort {
        ScaledPort::new(name, false, crew, params)
    }

    /// An input port collecting from a crew of `crew` output members.
    pub fn new_input(name: &str, crew: usize, params: &Params) -> ScaledPort {
        ScaledPort::new(name, true, crew, params)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The worker-facing port (normal buffer API).
    pub fn worker(&mut self) -> &mut Port {
        &mut self.worker
    }

    pub fn bridge(&mut self, i: usize) -> &mut Port {
        &mut self.bridges[i]
    }

    pub fn crew_size(&self) -> usize {
        self.bridges.len()
    }

    pub fn fully_connected(&self) -> bool {
        self.connected == self.bridges.len()
    }

    /// One-time setup at first peer attach: shim the worker side and
    /// pick distribution functions for every operation.
    fn setup(&mut self, s: &ConnScale, out_meta: &PortMeta, in_meta: &PortMeta) -> Result<()> {
        self.scale = if self.provider { s.in_scale } else { s.out_scale };
        self.ring = Some(self.worker.become_shim());
        let n_ops = out_meta.n_ops().max(in_meta.n_ops()).max(1);
        let mut ops = Vec::with_capacity(n_ops);
        for op in 0..n_ops {
            let mut bo = BridgeOp {
                mode: BridgeMode::Cyclic,
                first: 0,
                last: self.bridges.len() - 1,
                next: 0,
                hash_field: None,
            };
            let (o_setup, i_setup) = setup_fns(
                out_meta.op(op).distribution,
                in_meta.op(op).distribution,
            )?;
            let setup = if self.provider { i_setup } else { o_setup };
            setup(s, &in_meta.op(op), &mut bo);
            log::debug!(
                "bridge op {op} on {}: {:?} [{}..{}] next {}",
                self.name,
                bo.mode,
                bo.first,
                bo.last,
                bo.next
            );
            ops.push(bo);
        }
        self.ops = ops;
        Ok(())
    }

    /// Attach crew member `index` by wiring `member` in-process to the
    /// matching bridge sub-port. The first attach performs setup.
    pub fn attach_in_process(
        &mut self,
        index: usize,
        member: &mut Port,
        c: &mut Connection,
        out_meta: &PortMeta,
        in_meta: &PortMeta,
    ) -> Result<()> {
        if self.connected == 0 {
            let s = ConnScale::from_connection(c);
            self.setup(&s, out_meta, in_meta)?;
        }
        self.bridges[index].connect_in_process(member, c);
        self.connected += 1;
        Ok(())
    }

    /// The bridge pump: move as many messages as possible between the
    /// worker ring and the bridge sub-ports. Backs off without releasing
    /// when a sub-port lacks a free slot and resumes on the next pass.
    pub fn run_bridge(&mut self) -> Result<()> {
        if !self.fully_connected() {
            return Ok(());
        }
        if self.provider {
            self.run_input()
        } else {
            self.run_output()
        }
    }

    fn run_output(&mut self) -> Result<()> {
        loop {
            // A full worker message to distribute, kept across back-offs.
            if self.local.is_none() {
                let ring = self.ring.as_ref().unwrap();
                let (lring, slot) = match ring.next_full() {
                    None => return Ok(()),
                    Some(RingBuf::Host(slot)) => (ring.clone(), slot),
                    Some(RingBuf::Guest(z)) => (z.ring, z.slot),
                };
                let op = lring.header(slot).op_code as usize;
                assert!(op < self.ops.len(), "opcode beyond declared operations");
                self.local = Some(LocalBuf::Full { ring: lring, slot });
                self.current_op = Some(op);
            }
            let (lring, lslot) = match self.local.as_ref() {
                Some(LocalBuf::Full { ring, slot }) => (ring.clone(), *slot),
                _ => unreachable!(),
            };
            let op = self.current_op.unwrap();
            let hdr = lring.header(lslot);
            let n_bridges = self.bridges.len();
            let bo = &mut self.ops[op];

            // Phase 1: pick the destination, or discard.
            let mut next = bo.next;
            let mut discard = false;
            match bo.mode {
                BridgeMode::CyclicSparse => {
                    if next < bo.first || next > bo.last {
                        discard = true;
                    }
                }
                BridgeMode::Directed => {
                    next = hdr.direct as usize;
                    assert!(next < n_bridges, "direct index beyond crew");
                }
                BridgeMode::Hashed => {
                    let (off, len) = bo
                        .hash_field
                        .expect("hashed distribution without a hash field");
                    let data = unsafe { lring.payload(lslot, hdr.length as usize) };
                    let end = (off + len).min(data.len());
                    next = (hash_bytes(&data[off.min(data.len())..end]) % n_bridges as u64)
                        as usize;
                    if next < bo.first || next > bo.last {
                        discard = true;
                    }
                }
                BridgeMode::Discard => discard = true,
                _ => {}
            }
            if discard {
                // The global round-robin position covers discarded
                // messages too; members outside the range skip them.
                if bo.mode == BridgeMode::CyclicSparse {
                    bo.next = (next + 1) % n_bridges;
                }
                lring.release(lslot);
                self.local = None;
                self.current_op = None;
                continue;
            }

            if bo.mode == BridgeMode::All {
                // Replicate to the whole range before releasing; back off
                // mid-range with `next` marking the first unsent member.
                while bo.next <= bo.last {
                    let bp = &mut self.bridges[bo.next];
                    let Some(dst) = bp.get_buffer()? else {
                        return Ok(());
                    };
                    let data = unsafe { lring.payload(lslot, hdr.length as usize) };
                    assert!(dst.len() >= data.len());
                    dst[..data.len()].copy_from_slice(data);
                    bp.put(hdr.length, hdr.op_code, hdr.end, hdr.direct)?;
                    bo.next += 1;
                }
                bo.next = bo.first;
            } else {
                let bp = &mut self.bridges[next];
                let Some(dst) = bp.get_buffer()? else {
                    return Ok(());
                };
                let data = unsafe { lring.payload(lslot, hdr.length as usize) };
                assert!(dst.len() >= data.len());
                dst[..data.len()].copy_from_slice(data);
                bp.put(hdr.length, hdr.op_code, hdr.end, hdr.direct)?;
                match bo.mode {
                    BridgeMode::Cyclic | BridgeMode::Balanced => {
                        bo.next = if next == bo.last { bo.first } else { next + 1 };
                    }
                    BridgeMode::CyclicSparse => {
                        bo.next = next + 1;
                        if bo.next >= n_bridges {
                            bo.next = 0;
                        }
                    }
                    BridgeMode::CyclicModulo => {
                        bo.next = (bo.next + self.scale) % n_bridges;
                    }
                    _ => {}
                }
            }
            lring.release(lslot);
            self.local = None;
            self.current_op = None;
        }
    }

    fn run_input(&mut self) -> Result<()> {
        let ring = self.ring.as_ref().unwrap().clone();
        loop {
            // An empty worker slot to fill, kept across back-offs.
            if self.local.is_none() {
                let Some(slot) = ring.next_empty() else {
                    return Ok(());
                };
                self.local = Some(LocalBuf::Empty { slot });
            }
            let lslot = match self.local.as_ref() {
                Some(LocalBuf::Empty { slot }) => *slot,
                _ => unreachable!(),
            };

            // Find a bridge whose pending message we may accept now.
            let n_bridges = self.bridges.len();
            let mut found = None;
            let mut bpn = self.next_bridge;
            loop {
                if let Some(op) = self.bridges[bpn].peek_op_code()? {
                    let op = op as usize;
                    assert!(op < self.ops.len(), "opcode beyond declared operations");
                    let bo = &mut self.ops[op];
                    if bo.mode == BridgeMode::AsAvailable || bpn == bo.next {
                        if bo.mode == BridgeMode::AsAvailable {
                            assert!(bpn >= bo.first && bpn <= bo.last);
                            bo.next = bpn;
                        }
                        found = Some((bpn, op));
                        break;
                    }
                }
                bpn = (bpn + 1) % n_bridges;
                if bpn == self.next_bridge {
                    break;
                }
            }
            let Some((bpn, op)) = found else {
                return Ok(());
            };

            let bp = &mut self.bridges[bpn];
            let Some((hdr, data)) = bp.get_full()? else {
                unreachable!("peek promised a message");
            };
            let dst = unsafe { ring.payload_mut(lslot) };
            assert!(dst.len() >= data.len());
            dst[..data.len()].copy_from_slice(data);
            ring.commit(lslot, hdr);
            bp.release()?;
            self.local = None;

            // Rotate the global scan start and this op's cursor.
            self.next_bridge = (self.next_bridge + 1) % n_bridges;
            let bo = &mut self.ops[op];
            match bo.mode {
                BridgeMode::CyclicModulo => {
                    bo.next = (bo.next + self.scale) % n_bridges;
                }
                _ => {
                    bo.next = if bo.next == bo.last { bo.first } else { bo.next + 1 };
                }
            }
        }
    }
}
