// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dataplane contributors
//
// Endpoints, endpoint control memory, and the Fabric copy engine.
//
// An endpoint is one addressable memory region reachable by a transport
// family, named "<protocol>:<detail>;<size>.<mailbox>.<maxcount>". Its
// control memory holds the mailbox table and an offset-addressed arena
// for buffer regions, flag words, and protocol blobs.
//
// The Fabric is the explicit registry of endpoint memories plus the copy
// engine that moves bytes between them. Transfers are posted, not
// executed inline; a dispatch pass drains the queue. This keeps remote
// completion observable only after dispatch, the way a DMA engine's
// completions are.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};
use crate::mailbox::{MailboxId, MailboxSlot};

/// Transport family of the built-in in-process fabric driver.
pub const FABRIC_PROTOCOL: &str = "mem";

/// Default arena bytes for a locally allocated endpoint.
pub const DEFAULT_ENDPOINT_SIZE: u32 = 1 << 20;

// ---------------------------------------------------------------------------
// Endpoint naming
// ---------------------------------------------------------------------------

/// One addressable memory region. Local endpoints own their memory;
/// remote ones are reference-counted proxies resolved through the Fabric.
pub struct EndPoint {
    /// Full endpoint string, unique fabric-wide.
    pub name: String,
    /// Transport-family tag ("mem" for the in-process fabric).
    pub protocol: String,
    /// This endpoint's slot index in every peer's mailbox table.
    pub mailbox: MailboxId,
    /// Size of the mailbox table (maximum peer count).
    pub max_count: MailboxId,
    /// Byte address base of the region.
    pub address: u64,
    /// Region size in bytes.
    pub size: u32,
    /// Whether this process owns the memory.
    pub local: bool,
    pub(crate) mem: Arc<EndpointMem>,
}

impl EndPoint {
    /// Compose the canonical endpoint string.
    pub fn format_name(
        protocol: &str,
        detail: &str,
        size: u32,
        mailbox: MailboxId,
        max_count: MailboxId,
    ) -> String {
        format!("{protocol}:{detail};{size}.{mailbox}.{max_count}")
    }

    /// Parse "<protocol>:<detail>;<size>.<mailbox>.<maxcount>".
    pub fn parse(s: &str) -> Result<ParsedEndPoint> {
        let (protocol, rest) = s
            .split_once(':')
            .ok_or(Error::Decode("endpoint string has no protocol"))?;
        let (detail, res) = rest
            .split_once(';')
            .ok_or(Error::Decode("endpoint string has no resources"))?;
        let mut it = res.split('.');
        let size = it.next().and_then(|v| v.parse().ok());
        let mailbox = it.next().and_then(|v| v.parse().ok());
        let max_count = it.next().and_then(|v| v.parse().ok());
        match (size, mailbox, max_count, it.next()) {
            (Some(size), Some(mailbox), Some(max_count), None) => Ok(ParsedEndPoint {
                protocol: protocol.to_string(),
                detail: detail.to_string(),
                size,
                mailbox,
                max_count,
            }),
            _ => Err(Error::Decode("malformed endpoint resource values")),
        }
    }
}

/// The pieces of a parsed endpoint string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedEndPoint {
    pub protocol: String,
    pub detail: String,
    pub size: u32,
    pub mailbox: MailboxId,
    pub max_count: MailboxId,
}

/// Process id used in generated endpoint detail strings.
pub(crate) fn process_id() -> u32 {
    #[cfg(unix)]
    {
        unsafe { libc::getpid() as u32 }
    }
    #[cfg(windows)]
    {
        unsafe { windows_sys::Win32::System::Threading::GetCurrentProcessId() }
    }
    #[cfg(not(any(unix, windows)))]
    {
        1
    }
}

// ---------------------------------------------------------------------------
// Endpoint control memory
// ---------------------------------------------------------------------------

/// The memory an endpoint exposes to the fabric: a mailbox table plus an
/// offset-addressed byte arena.
pub struct EndpointMem {
    mailboxes: Box<[Mutex<MailboxSlot>]>,
    arena: Mutex<Arena>,
}

impl EndpointMem {
    pub fn new(max_count: MailboxId, arena_size: u32) -> Arc<EndpointMem> {
        let mailboxes = (0..max_count)
            .map(|_| Mutex::new(MailboxSlot::default()))
            .collect();
        Arc::new(EndpointMem {
            mailboxes,
            arena: Mutex::new(Arena::new(arena_size)),
        })
    }

    pub fn mailbox_count(&self) -> MailboxId {
        self.mailboxes.len() as MailboxId
    }

    /// Run `f` on mailbox slot `m`.
    pub fn with_mailbox<R>(&self, m: MailboxId, f: impl FnOnce(&mut MailboxSlot) -> R) -> R {
        f(&mut self.mailboxes[m as usize].lock().unwrap())
    }

    /// Whether slot `m` is free for a new request.
    pub fn mailbox_available(&self, m: MailboxId) -> bool {
        self.mailboxes[m as usize].lock().unwrap().request.is_none()
    }

    /// Allocate `len` bytes in the arena, 8-aligned.
    pub fn alloc(&self, len: u32, what: &'static str) -> Result<u64> {
        self.arena.lock().unwrap().alloc(len).ok_or(Error::NoBuffers(what))
    }

    /// Return an allocation to the arena.
    pub fn free(&self, offset: u64, len: u32) {
        self.arena.lock().unwrap().free(offset, len);
    }

    pub fn read(&self, offset: u64, len: u32) -> Vec<u8> {
        self.arena.lock().unwrap().read(offset, len)
    }

    pub fn write(&self, offset: u64, bytes: &[u8]) {
        self.arena.lock().unwrap().write(offset, bytes);
    }

    /// Read one 64-bit flag word.
    pub fn read_flag(&self, offset: u64) -> u64 {
        let b = self.read(offset, 8);
        u64::from_ne_bytes(b.try_into().unwrap())
    }

    /// Write one 64-bit flag word.
    pub fn write_flag(&self, offset: u64, value: u64) {
        self.write(offset, &value.to_ne_bytes());
    }
}

/// First-fit offset allocator over the arena bytes.
struct Arena {
    bytes: Vec<u8>,
    /// (offset, len) free extents, address-ordered.
    free: Vec<(u32, u32)>,
}

impl Arena {
    fn new(size: u32) -> Self {
        Self {
            bytes: vec![0u8; size as usize],
            free: vec![(0, size)],
        }
    }

    fn alloc(&mut self, len: u32) -> Option<u64> {
        let len = (len + 7) & !7;
        for i in 0..self.free.len() {
            let (off, flen) = self.free[i];
            if flen >= len {
                if flen == len {
                    self.free.remove(i);
                } else {
                    self.free[i] = (off + len, flen - len);
                }
                return Some(off as u64);
            }
        }
        None
    }

    fn free(&mut self, offset: u64, len: u32) {
        let len = (len + 7) & !7;
        let pos = self
            .free
            .iter()
            .position(|&(o, _)| o as u64 > offset)
            .unwrap_or(self.free.len());
        self.free.insert(pos, (offset as u32, len));
        // Coalesce neighbors.
        let mut i = pos.saturating_sub(1);
        while i + 1 < self.free.len() {
            let (o0, l0) = self.free[i];
            let (o1, l1) = self.free[i + 1];
            if o0 + l0 == o1 {
                self.free[i] = (o0, l0 + l1);
                self.free.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }

    /// Out-of-range reads yield zeroes for the missing tail; a peer that
    /// sent a bad offset corrupts only its own view, never this process.
    fn read(&self, offset: u64, len: u32) -> Vec<u8> {
        let mut out = vec![0u8; len as usize];
        let o = (offset as usize).min(self.bytes.len());
        let n = (len as usize).min(self.bytes.len() - o);
        out[..n].copy_from_slice(&self.bytes[o..o + n]);
        if n < len as usize {
            log::warn!("arena read of {len}@{offset} beyond region");
        }
        out
    }

    fn write(&mut self, offset: u64, bytes: &[u8]) {
        let o = (offset as usize).min(self.bytes.len());
        let n = bytes.len().min(self.bytes.len() - o);
        self.bytes[o..o + n].copy_from_slice(&bytes[..n]);
        if n < bytes.len() {
            log::warn!("arena write of {}@{offset} beyond region", bytes.len());
        }
    }
}

// ---------------------------------------------------------------------------
// Fabric — endpoint registry + copy engine
// ---------------------------------------------------------------------------

/// One byte-range copy between endpoint arenas.
#[derive(Debug, Clone)]
pub struct CopySpec {
    pub from_ep: String,
    pub from: u64,
    pub to_ep: String,
    pub to: u64,
    pub len: u32,
}

/// A posted transfer: data copies first, then the optional flag copy,
/// then the optional mailbox-slot copy (request-type word last).
pub struct Transfer {
    pub copies: Vec<CopySpec>,
    pub flag: Option<CopySpec>,
    pub mailbox: Option<MailboxCopy>,
}

/// Copy mailbox slot `index` from one endpoint's table into another's.
/// Used both to deliver a request and to reflect the cleared slot (the
/// reply) back to the requester.
pub struct MailboxCopy {
    pub from_ep: String,
    pub to_ep: String,
    pub index: MailboxId,
}

impl Transfer {
    pub fn new() -> Transfer {
        Transfer {
            copies: Vec::new(),
            flag: None,
            mailbox: None,
        }
    }
}

impl Default for Transfer {
    fn default() -> Self {
        Self::new()
    }
}

/// The explicit registry of endpoint memories plus the deferred copy
/// engine. Created once per session and shared by every Transport that
/// should be able to reach the same peers.
pub struct Fabric {
    endpoints: Mutex<HashMap<String, Arc<EndpointMem>>>,
    pending: Mutex<slab::Slab<Transfer>>,
    next_mailbox: std::sync::atomic::AtomicU16,
}

/// Mailbox-table size shared by every endpoint on one fabric.
pub const MAX_SYSTEM_NODES: MailboxId = 16;

impl Fabric {
    pub fn new() -> Arc<Fabric> {
        Arc::new(Fabric {
            endpoints: Mutex::new(HashMap::new()),
            pending: Mutex::new(slab::Slab::new()),
            next_mailbox: std::sync::atomic::AtomicU16::new(1),
        })
    }

    /// Hand out the next unused mailbox index on this fabric.
    pub fn alloc_mailbox(&self) -> MailboxId {
        let m = self
            .next_mailbox
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        assert!(m < MAX_SYSTEM_NODES, "mailbox table exhausted");
        m
    }

    /// Register a local endpoint's memory under its name.
    pub fn register(&self, name: &str, mem: Arc<EndpointMem>) {
        self.endpoints
            .lock()
            .unwrap()
            .insert(name.to_string(), mem);
    }

    /// Drop a local endpoint's registration.
    pub fn unregister(&self, name: &str) {
        self.endpoints.lock().unwrap().remove(name);
    }

    /// Resolve an endpoint name to its memory.
    pub fn lookup(&self, name: &str) -> Result<Arc<EndpointMem>> {
        self.endpoints
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnsupportedEndpoint(name.to_string()))
    }

    /// Post a transfer for a later dispatch pass. Returns its queue key.
    pub fn post(&self, t: Transfer) -> usize {
        self.pending.lock().unwrap().insert(t)
    }

    /// Execute and drain every pending transfer. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        // Take the batch out first: executing a transfer may post more.
        let batch: Vec<Transfer> = {
            let mut q = self.pending.lock().unwrap();
            let keys: Vec<usize> = q.iter().map(|(k, _)| k).collect();
            keys.into_iter().map(|k| q.remove(k)).collect()
        };
        let n = batch.len();
        for t in batch {
            self.execute(&t);
        }
        n
    }

    /// Execute one transfer immediately (used by the request write path,
    /// which must be synchronous under the destination mailbox lock).
    pub fn execute(&self, t: &Transfer) {
        for c in &t.copies {
            self.copy(c);
        }
        if let Some(c) = &t.flag {
            self.copy(c);
        }
        if let Some(mc) = &t.mailbox {
            self.copy_mailbox(mc);
        }
    }

    fn copy(&self, c: &CopySpec) {
        let (from, to) = match (self.lookup(&c.from_ep), self.lookup(&c.to_ep)) {
            (Ok(f), Ok(t)) => (f, t),
            _ => {
                log::warn!(
                    "dropping copy {} -> {}: endpoint gone",
                    c.from_ep,
                    c.to_ep
                );
                return;
            }
        };
        let bytes = from.read(c.from, c.len);
        to.write(c.to, &bytes);
    }

    fn copy_mailbox(&self, mc: &MailboxCopy) {
        let (from, to) = match (self.lookup(&mc.from_ep), self.lookup(&mc.to_ep)) {
            (Ok(f), Ok(t)) => (f, t),
            _ => return,
        };
        let slot = from.with_mailbox(mc.index, |s| s.clone());
        to.with_mailbox(mc.index, |dst| {
            // Body first, request-type word last.
            dst.circuit_id = slot.circuit_id;
            dst.error_code = slot.error_code;
            dst.return_offset = slot.return_offset;
            dst.return_size = slot.return_size;
            dst.return_mailbox = slot.return_mailbox;
            dst.request = slot.request.clone();
        });
    }
}
