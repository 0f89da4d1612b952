// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dataplane contributors
//
// The Transport instance: endpoint registries, circuit map, and the
// mailbox control protocol.
//
// One Transport per address space participating on a fabric. Registries
// are keyed maps owned by the instance; nothing here is process-global.
// `dispatch()` is the cooperative-polling entry point: it drains posted
// transfers and scans this endpoint's mailbox table for peer requests.
//
// Requests are written into the *server's* mailbox table at the slot
// indexed by the requester's own mailbox id, after spinning (with the
// caller's timeout) until the slot is free, under a per-destination lock.
// The server handles the request, clears its copy of the slot, and posts
// a reply copy back into the requester's table; the requester observes
// completion when its own slot returns to NoRequest.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::circuit::{Circuit, CircuitId, XferPort};
use crate::descriptor::Descriptor;
use crate::endpoint::{
    CopySpec, EndPoint, EndpointMem, Fabric, MailboxCopy, Transfer, DEFAULT_ENDPOINT_SIZE,
    FABRIC_PROTOCOL, MAX_SYSTEM_NODES,
};
use crate::error::{Error, Result};
use crate::mailbox::{MailboxSlot, Request};
use crate::ring::DEFAULT_NBUFFERS;
use crate::spin_lock::adaptive_yield;

/// The per-address-space transport engine.
pub struct Transport {
    fabric: Arc<Fabric>,
    main: Arc<EndPoint>,
    local_endpoints: HashMap<String, Arc<EndPoint>>,
    remote_endpoints: HashMap<String, Arc<EndPoint>>,
    circuits: HashMap<CircuitId, Circuit>,
    mailbox_locks: HashMap<String, Arc<Mutex<()>>>,
    next_circuit_id: CircuitId,
    next_port_id: u64,
    uses_mailboxes: bool,
    endpoint_seq: u32,
}

impl Transport {
    /// Create a transport with its main local endpoint. `endpoint` is an
    /// explicit "protocol:details;size.mailbox.maxcount" override; absent,
    /// one is generated on the fabric's built-in protocol.
    pub fn new(fabric: &Arc<Fabric>, endpoint: Option<&str>) -> Result<Transport> {
        let main = match endpoint {
            Some(s) => {
                let p = EndPoint::parse(s)?;
                if p.protocol != FABRIC_PROTOCOL {
                    return Err(Error::UnsupportedEndpoint(s.to_string()));
                }
                let mem = EndpointMem::new(p.max_count, p.size);
                fabric.register(s, mem.clone());
                Arc::new(EndPoint {
                    name: s.to_string(),
                    protocol: p.protocol,
                    mailbox: p.mailbox,
                    max_count: p.max_count,
                    address: 0,
                    size: p.size,
                    local: true,
                    mem,
                })
            }
            None => {
                let mailbox = fabric.alloc_mailbox();
                let size = DEFAULT_ENDPOINT_SIZE;
                let detail = format!("p{}.0", crate::endpoint::process_id());
                let name =
                    EndPoint::format_name(FABRIC_PROTOCOL, &detail, size, mailbox, MAX_SYSTEM_NODES);
                let mem = EndpointMem::new(MAX_SYSTEM_NODES, size);
                fabric.register(&name, mem.clone());
                Arc::new(EndPoint {
                    name,
                    protocol: FABRIC_PROTOCOL.to_string(),
                    mailbox,
                    max_count: MAX_SYSTEM_NODES,
                    address: 0,
                    size,
                    local: true,
                    mem,
                })
            }
        };
        let mut local_endpoints = HashMap::new();
        local_endpoints.insert(main.name.clone(), main.clone());
        Ok(Transport {
            fabric: fabric.clone(),
            main,
            local_endpoints,
            remote_endpoints: HashMap::new(),
            circuits: HashMap::new(),
            mailbox_locks: HashMap::new(),
            next_circuit_id: 1,
            next_port_id: 1,
            uses_mailboxes: true,
            endpoint_seq: 0,
        })
    }

    /// The main local endpoint other sides address this transport by.
    pub fn endpoint(&self) -> &Arc<EndPoint> {
        &self.main
    }

    pub fn fabric(&self) -> &Arc<Fabric> {
        &self.fabric
    }

    /// Allocate a fresh process-unique port id for descriptors.
    pub fn new_port_id(&mut self) -> u64 {
        let id = self.next_port_id;
        self.next_port_id += 1;
        id
    }

    // -----------------------------------------------------------------
    // Endpoint registries
    // -----------------------------------------------------------------

    fn new_local_endpoint(&mut self, protocol: &str) -> Result<Arc<EndPoint>> {
        if protocol != FABRIC_PROTOCOL {
            return Err(Error::UnsupportedEndpoint(protocol.to_string()));
        }
        let mailbox = self.fabric.alloc_mailbox();
        // One local endpoint per (protocol, mailbox) pair.
        assert!(!self
            .local_endpoints
            .values()
            .any(|e| e.protocol == protocol && e.mailbox == mailbox));
        self.endpoint_seq += 1;
        let detail = format!("p{}.{}", crate::endpoint::process_id(), self.endpoint_seq);
        let size = DEFAULT_ENDPOINT_SIZE;
        let name = EndPoint::format_name(protocol, &detail, size, mailbox, MAX_SYSTEM_NODES);
        let mem = EndpointMem::new(MAX_SYSTEM_NODES, size);
        self.fabric.register(&name, mem.clone());
        let ep = Arc::new(EndPoint {
            name: name.clone(),
            protocol: protocol.to_string(),
            mailbox,
            max_count: MAX_SYSTEM_NODES,
            address: 0,
            size,
            local: true,
            mem,
        });
        self.local_endpoints.insert(name, ep.clone());
        log::debug!("created local endpoint {}", ep.name);
        Ok(ep)
    }

    /// Whether `name` is one of our local endpoints.
    pub fn is_local_endpoint(&self, name: &str) -> bool {
        self.local_endpoints.contains_key(name)
    }

    /// Register (or fetch) a reference-counted proxy for a remote
    /// endpoint named by a peer.
    pub fn add_remote_endpoint(&mut self, name: &str) -> Result<Arc<EndPoint>> {
        if let Some(ep) = self.remote_endpoints.get(name) {
            return Ok(ep.clone());
        }
        let p = EndPoint::parse(name)?;
        if p.protocol != FABRIC_PROTOCOL {
            return Err(Error::UnsupportedEndpoint(name.to_string()));
        }
        let mem = self.fabric.lookup(name)?;
        let ep = Arc::new(EndPoint {
            name: name.to_string(),
            protocol: p.protocol,
            mailbox: p.mailbox,
            max_count: p.max_count,
            address: 0,
            size: p.size,
            local: false,
            mem,
        });
        self.remote_endpoints.insert(name.to_string(), ep.clone());
        log::debug!("added remote endpoint {}", name);
        Ok(ep)
    }

    /// Find or make a local endpoint able to reach `remote` (same
    /// protocol family, distinct mailbox, same table size).
    pub fn local_compatible_endpoint(&mut self, remote: &str) -> Result<Arc<EndPoint>> {
        let p = EndPoint::parse(remote)?;
        if p.protocol != FABRIC_PROTOCOL {
            return Err(Error::UnsupportedEndpoint(remote.to_string()));
        }
        if self.main.protocol == p.protocol
            && self.main.max_count == p.max_count
            && self.main.mailbox != p.mailbox
        {
            return Ok(self.main.clone());
        }
        for ep in self.local_endpoints.values() {
            if ep.protocol == p.protocol && ep.max_count == p.max_count && ep.mailbox != p.mailbox
            {
                return Ok(ep.clone());
            }
        }
        self.new_local_endpoint(&p.protocol)
    }

    /// Drop remote-endpoint proxies no circuit references anymore.
    pub fn gc_remote_endpoints(&mut self) {
        self.remote_endpoints
            .retain(|_, ep| Arc::strong_count(ep) > 1);
    }

    // -----------------------------------------------------------------
    // Circuits
    // -----------------------------------------------------------------

    /// Create a circuit. `id` 0 allocates a fresh id; a nonzero id that
    /// already exists replaces the old circuit (retried NewConnection).
    pub fn create_circuit(&mut self, id: CircuitId) -> CircuitId {
        let id = if id == 0 {
            let id = self.next_circuit_id;
            self.next_circuit_id += 1;
            id
        } else {
            if self.circuits.remove(&id).is_some() {
                log::debug!("replacing circuit {id:#x}");
            }
            id
        };
        self.circuits.insert(id, Circuit::new(id));
        log::debug!("new circuit created and registered: id {id:#x}");
        id
    }

    pub fn circuit(&self, id: CircuitId) -> Option<&Circuit> {
        self.circuits.get(&id)
    }

    pub fn circuit_mut(&mut self, id: CircuitId) -> Option<&mut Circuit> {
        self.circuits.get_mut(&id)
    }

    pub fn circuit_count(&self) -> usize {
        self.circuits.len()
    }

    pub fn delete_circuit(&mut self, id: CircuitId) {
        self.circuits.remove(&id);
        self.gc_remote_endpoints();
    }

    /// Create the input side of a connection: a circuit owning one input
    /// transport port on a local endpoint compatible with `remote_hint`
    /// (the output's endpoint, when known).
    pub fn create_input_port(
        &mut self,
        n_buffers: u32,
        buffer_size: u32,
        remote_hint: Option<&str>,
    ) -> Result<(CircuitId, Arc<XferPort>)> {
        let ep = match remote_hint {
            Some(r) if !r.is_empty() => self.local_compatible_endpoint(r)?,
            _ => self.main.clone(),
        };
        let n = if n_buffers == 0 { DEFAULT_NBUFFERS } else { n_buffers };
        let port_id = self.new_port_id();
        let port = XferPort::new_input(&self.fabric, &ep, n, buffer_size, port_id)?;
        let id = self.create_circuit(0);
        self.circuits.get_mut(&id).unwrap().inputs.push(port.clone());
        Ok((id, port))
    }

    /// Create the output side of a connection against a decoded input
    /// descriptor. Registers the input's endpoint as remote and binds the
    /// new port to a compatible local endpoint. The NewConnection request
    /// is issued separately so a timed-out request can be retried without
    /// duplicating the circuit.
    pub fn create_output_port(
        &mut self,
        input_desc: &Descriptor,
    ) -> Result<(CircuitId, Arc<XferPort>)> {
        let ep = self.local_compatible_endpoint(&input_desc.oob.oep)?;
        self.add_remote_endpoint(&input_desc.oob.oep)?;
        let port_id = self.new_port_id();
        let port = XferPort::new_output(&self.fabric, &ep, input_desc, port_id)?;
        let id = self.create_circuit(0);
        self.circuits.get_mut(&id).unwrap().output = Some(port.clone());
        Ok((id, port))
    }

    // -----------------------------------------------------------------
    // Requesting side of the mailbox protocol
    // -----------------------------------------------------------------

    fn mailbox_lock(&mut self, server: &str) -> Arc<Mutex<()>> {
        self.mailbox_locks
            .entry(server.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Spin until our own request slot is free again (request written and
    /// not yet replied means busy), dispatching while we wait.
    fn wait_mailbox_available(&mut self, timeout: Duration) -> Result<()> {
        let own = self.main.mailbox;
        let deadline = Instant::now() + timeout;
        let mut k = 0u32;
        while !self.main.mem.mailbox_available(own) {
            self.dispatch();
            if Instant::now() >= deadline {
                return Err(Error::NotResponding(own));
            }
            adaptive_yield(&mut k);
        }
        Ok(())
    }

    /// Write a request to `server` and wait for its reply, under the
    /// per-destination lock. The slot travels to the server's table at
    /// our own mailbox index; the reply is the cleared slot copied back.
    fn mailbox_request(
        &mut self,
        server: &str,
        mut slot: MailboxSlot,
        timeout: Duration,
    ) -> Result<()> {
        let server_ep = self.add_remote_endpoint(server)?;
        let lock = self.mailbox_lock(server);
        let _guard = lock.lock().unwrap();
        let own = self.main.mailbox;

        // Do not overwrite an unconsumed prior request.
        self.wait_mailbox_available(timeout)?;

        slot.return_mailbox = own;
        log::debug!(
            "mailbox request {} to {} (circuit {:#x})",
            slot.request.name(),
            server,
            slot.circuit_id
        );
        self.main.mem.with_mailbox(own, |s| *s = slot.clone());
        // Deliver synchronously; the reply comes back asynchronously.
        let mut t = Transfer::new();
        t.mailbox = Some(MailboxCopy {
            from_ep: self.main.name.clone(),
            to_ep: server_ep.name.clone(),
            index: own,
        });
        self.fabric.execute(&t);

        // The slot returning to NoRequest is the reply signal.
        self.wait_mailbox_available(timeout)?;
        let code = self.main.mem.with_mailbox(own, |s| s.error_code);
        if code != 0 {
            return Err(Error::PeerError(code));
        }
        Ok(())
    }

    /// Ask `server` (the input side's transport) to create its half of
    /// circuit `circuit_id`. `send` means we will be sending data to the
    /// server. An optional protocol blob is staged locally and announced;
    /// the server tells us later (OutputControlOffset) where to copy it.
    pub fn request_new_connection(
        &mut self,
        circuit_id: CircuitId,
        server: &str,
        send: bool,
        buffer_size: u32,
        protocol: Option<&[u8]>,
        timeout: Duration,
    ) -> Result<()> {
        let circuit = self
            .circuits
            .get(&circuit_id)
            .ok_or(Error::UnknownCircuit(circuit_id))?;
        let protocol_size = protocol.map(|p| p.len() as u32).unwrap_or(0);
        if let Some(blob) = protocol {
            if circuit.protocol.is_none() {
                let off = self.main.mem.alloc(protocol_size, "protocol info exchange")?;
                self.main.mem.write(off, blob);
                self.circuits.get_mut(&circuit_id).unwrap().protocol =
                    Some((protocol_size, off));
            }
        }
        let slot = MailboxSlot {
            request: Request::NewConnection {
                send,
                buffer_size,
                protocol_size,
                output_endpoint: self.main.name.clone(),
            },
            circuit_id,
            ..Default::default()
        };
        self.mailbox_request(server, slot, timeout)
    }

    /// Tell the input side's transport that circuit `circuit_id`'s input
    /// set changed and the circuit may go live.
    pub fn request_update_circuit(
        &mut self,
        circuit_id: CircuitId,
        server: &str,
        n_inputs: u32,
        timeout: Duration,
    ) -> Result<()> {
        let slot = MailboxSlot {
            request: Request::UpdateCircuit {
                output_endpoint: self.main.name.clone(),
                n_inputs,
            },
            circuit_id,
            ..Default::default()
        };
        self.mailbox_request(server, slot, timeout)
    }

    /// Ask the output side for its flow-control state; `protocol_offset`
    /// nonzero also tells it where to land the announced protocol blob.
    pub fn request_output_offsets(
        &mut self,
        server: &str,
        circuit_id: CircuitId,
        port_id: u64,
        return_offset: u64,
        return_size: u32,
        protocol_offset: u64,
        timeout: Duration,
    ) -> Result<()> {
        let slot = MailboxSlot {
            request: Request::OutputControlOffset {
                port_id,
                shadow_endpoint: self.main.name.clone(),
                protocol_offset,
            },
            circuit_id,
            return_offset,
            return_size,
            ..Default::default()
        };
        self.mailbox_request(server, slot, timeout)
    }

    /// Ask the input side for an input port's buffer-state offsets.
    pub fn request_input_offsets(
        &mut self,
        server: &str,
        circuit_id: CircuitId,
        port_id: u64,
        return_offset: u64,
        return_size: u32,
        timeout: Duration,
    ) -> Result<()> {
        let slot = MailboxSlot {
            request: Request::InputOffsets {
                port_id,
                url: self.main.name.clone(),
            },
            circuit_id,
            return_offset,
            return_size,
            ..Default::default()
        };
        self.mailbox_request(server, slot, timeout)
    }

    /// Ask the input side for an input port's shadow-state offsets.
    pub fn request_shadow_offsets(
        &mut self,
        server: &str,
        circuit_id: CircuitId,
        port_id: u64,
        return_offset: u64,
        return_size: u32,
        timeout: Duration,
    ) -> Result<()> {
        let slot = MailboxSlot {
            request: Request::ShadowStateOffset {
                port_id,
                url: self.main.name.clone(),
            },
            circuit_id,
            return_offset,
            return_size,
            ..Default::default()
        };
        self.mailbox_request(server, slot, timeout)
    }

    // -----------------------------------------------------------------
    // Dispatch + serving side
    // -----------------------------------------------------------------

    /// One cooperative polling pass: run posted transfers, then serve
    /// pending mailbox requests.
    pub fn dispatch(&mut self) {
        self.fabric.run_pending();
        if self.uses_mailboxes {
            self.check_mailboxes();
        }
    }

    /// Post the reply for slot `index`: our cleared slot copied back into
    /// the requester's table.
    fn post_reply(&self, requester: &Arc<EndPoint>, index: u16) {
        let mut t = Transfer::new();
        t.mailbox = Some(MailboxCopy {
            from_ep: self.main.name.clone(),
            to_ep: requester.name.clone(),
            index,
        });
        self.fabric.post(t);
    }

    /// Scan our mailbox table for peer requests and serve them.
    fn check_mailboxes(&mut self) {
        let mem = self.main.mem.clone();
        let own = self.main.mailbox;
        for n in 0..mem.mailbox_count() {
            if n == own {
                continue;
            }
            let slot = mem.with_mailbox(n, |s| s.clone());
            if slot.request.is_none() {
                continue;
            }
            log::debug!(
                "got a mailbox request from {n}: {} (circuit {:#x})",
                slot.request.name(),
                slot.circuit_id
            );
            let outcome = self.handle_request(&slot);
            // Clear our copy; the reply carries error_code back.
            let (requester, code) = match outcome {
                Ok(requester) => (Some(requester), 0),
                Err((requester, e)) => {
                    log::warn!("mailbox request failed: {e}");
                    (requester, -1)
                }
            };
            mem.with_mailbox(n, |s| {
                s.clear();
                s.error_code = code;
            });
            if let Some(requester) = requester {
                self.post_reply(&requester, n);
            }
        }
    }

    /// Serve one request. Returns the endpoint to reply to.
    #[allow(clippy::type_complexity)]
    fn handle_request(
        &mut self,
        slot: &MailboxSlot,
    ) -> std::result::Result<Arc<EndPoint>, (Option<Arc<EndPoint>>, Error)> {
        match &slot.request {
            Request::NewConnection {
                send,
                buffer_size,
                protocol_size,
                output_endpoint,
            } => {
                let requester = self
                    .add_remote_endpoint(output_endpoint)
                    .map_err(|e| (None, e))?;
                let fail = |e| (Some(requester.clone()), e);
                // The sender asked for a circuit keyed by its id; an
                // existing one (lost reply, retried request) is replaced.
                let id = self.create_circuit(slot.circuit_id);
                if *protocol_size != 0 {
                    let off = self
                        .main
                        .mem
                        .alloc(*protocol_size, "protocol info exchange")
                        .map_err(fail)?;
                    self.circuits.get_mut(&id).unwrap().protocol = Some((*protocol_size, off));
                }
                if *send {
                    // Client sends to us: make our input side now.
                    let port_id = self.new_port_id();
                    let ep = self.main.clone();
                    let port =
                        XferPort::new_input(&self.fabric, &ep, DEFAULT_NBUFFERS, *buffer_size, port_id)
                            .map_err(fail)?;
                    self.circuits.get_mut(&id).unwrap().inputs.push(port);
                }
                Ok(requester)
            }

            Request::UpdateCircuit {
                output_endpoint, ..
            } => {
                let requester = self
                    .add_remote_endpoint(output_endpoint)
                    .map_err(|e| (None, e))?;
                let c = self
                    .circuits
                    .get_mut(&slot.circuit_id)
                    .ok_or_else(|| (Some(requester.clone()), Error::UnknownCircuit(slot.circuit_id)))?;
                c.open = false;
                Ok(requester)
            }

            Request::OutputControlOffset {
                port_id,
                shadow_endpoint,
                protocol_offset,
            } => {
                let requester = self
                    .add_remote_endpoint(shadow_endpoint)
                    .map_err(|e| (None, e))?;
                let fail = |e| (Some(requester.clone()), e);
                let c = self
                    .circuits
                    .get(&slot.circuit_id)
                    .ok_or_else(|| fail(Error::UnknownCircuit(slot.circuit_id)))?;
                let port = c.output_port(*port_id).map_err(fail)?;
                let mut t = Transfer::new();
                // The protocol blob rides ahead of the offsets so it is
                // present when the other side sees them land.
                let mut freed = None;
                if *protocol_offset != 0 {
                    let (size, off) = c
                        .protocol
                        .ok_or_else(|| fail(Error::NoBuffers("protocol info exchange")))?;
                    t.copies.push(CopySpec {
                        from_ep: self.main.name.clone(),
                        from: off,
                        to_ep: requester.name.clone(),
                        to: *protocol_offset,
                        len: size,
                    });
                    freed = Some((size, off));
                }
                t.copies
                    .extend(port.get_offsets(&requester.name, slot.return_offset));
                self.fabric.post(t);
                if let Some((size, off)) = freed {
                    self.main.mem.free(off, size);
                    self.circuits.get_mut(&slot.circuit_id).unwrap().protocol = None;
                }
                Ok(requester)
            }

            Request::ShadowStateOffset { port_id, url }
            | Request::InputOffsets { port_id, url } => {
                let requester = self.add_remote_endpoint(url).map_err(|e| (None, e))?;
                let fail = |e| (Some(requester.clone()), e);
                let c = self
                    .circuits
                    .get(&slot.circuit_id)
                    .ok_or_else(|| fail(Error::UnknownCircuit(slot.circuit_id)))?;
                let port = c.input_port(*port_id).map_err(fail)?;
                let mut t = Transfer::new();
                t.copies
                    .extend(port.get_offsets(&requester.name, slot.return_offset));
                self.fabric.post(t);
                Ok(requester)
            }

            Request::NoRequest => unreachable!("NoRequest slots are skipped"),
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.circuits.clear();
        for name in self.local_endpoints.keys() {
            self.fabric.unregister(name);
        }
        self.fabric.unregister(&self.main.name);
    }
}
