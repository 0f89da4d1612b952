// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dataplane contributors
//
// The port descriptor and its wire codec.
//
// A descriptor is the wire-transmissible summary of one port's buffer-ring
// parameters, exchanged during connection handshake. The encoding is a
// length-prefixed, aligned binary record whose first field is a one-byte
// byte-order tag: multi-byte scalars are written in the sender's native
// order and the receiver swaps on decode when its order differs.
//
// Layout (offsets relative to record start, fields aligned to their size):
//   u32  total record length
//   u8   byte-order tag (1 = little-endian)
//   u32  descriptor kind
//   i32  role
//   u32  options
//   u32  buffer count
//   u64  data buffer base address
//   u32  data buffer pitch
//   u32  data buffer size
//   u64  metadata base address
//   u32  metadata pitch
//   u64  full-flag base address
//   u32  full-flag size
//   u32  full-flag pitch
//   u64  full-flag value
//   u64  empty-flag base address
//   u32  empty-flag size
//   u32  empty-flag pitch
//   u64  empty-flag value
//   u64  oob port id
//   str  oob endpoint name (u32 byte count incl. NUL, bytes, NUL)
//   u64  oob cookie
//   u64  oob address

use crate::error::{Error, Result};
use crate::role::PortRole;

/// Addressable offset within an endpoint's memory.
pub type Offset = u64;
/// A full/empty flag word.
pub type Flag = u64;

/// Upper bound on the endpoint-name string carried out-of-band.
pub const MAX_ENDPOINT_NAME: usize = 256;

/// Which side of a connection a descriptor describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum DescriptorKind {
    /// An input port (consumer of messages).
    Consumer = 1,
    /// An input port's flow-control feedback view.
    ConsumerFlowControl = 2,
    /// An output port (producer of messages).
    Producer = 3,
}

impl DescriptorKind {
    fn from_wire(v: u32) -> Result<Self> {
        Ok(match v {
            1 => DescriptorKind::Consumer,
            2 => DescriptorKind::ConsumerFlowControl,
            3 => DescriptorKind::Producer,
            _ => return Err(Error::Decode("invalid descriptor kind")),
        })
    }
}

/// Out-of-band block: how to reach the port's endpoint at all.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OutOfBand {
    /// Process-wide unique id of the port within its circuit.
    pub port_id: u64,
    /// Endpoint name/URI string ("protocol:details;size.mailbox.maxcount").
    pub oep: String,
    /// Opaque value returned verbatim by the peer.
    pub cookie: u64,
    /// Byte address base of the endpoint region.
    pub address: u64,
}

/// One port's buffer-ring parameters in wire-exchangeable form.
#[derive(Debug, Clone, PartialEq)]
pub struct Descriptor {
    pub kind: DescriptorKind,
    pub role: PortRole,
    pub options: u32,
    pub n_buffers: u32,
    pub data_buffer_base: Offset,
    pub data_buffer_pitch: u32,
    pub data_buffer_size: u32,
    pub metadata_base: Offset,
    pub metadata_pitch: u32,
    pub full_flag_base: Offset,
    pub full_flag_size: u32,
    pub full_flag_pitch: u32,
    pub full_flag_value: Flag,
    pub empty_flag_base: Offset,
    pub empty_flag_size: u32,
    pub empty_flag_pitch: u32,
    pub empty_flag_value: Flag,
    pub oob: OutOfBand,
}

impl Descriptor {
    /// A blank descriptor of the given kind, role unresolved.
    pub fn new(kind: DescriptorKind) -> Self {
        Self {
            kind,
            role: PortRole::NoRole,
            options: 0,
            n_buffers: 0,
            data_buffer_base: 0,
            data_buffer_pitch: 0,
            data_buffer_size: 0,
            metadata_base: 0,
            metadata_pitch: 0,
            full_flag_base: 0,
            full_flag_size: 0,
            full_flag_pitch: 0,
            full_flag_value: 0,
            empty_flag_base: 0,
            empty_flag_size: 0,
            empty_flag_pitch: 0,
            empty_flag_value: 0,
            oob: OutOfBand::default(),
        }
    }

    /// Encode in the native byte order.
    pub fn encode(&self) -> Vec<u8> {
        self.encode_in(WireOrder::native())
    }

    /// Encode in an explicit byte order (the tag records the choice).
    pub fn encode_in(&self, order: WireOrder) -> Vec<u8> {
        let mut e = Encoder::new(order);
        e.put_u32(0); // length backpatched below
        e.put_u8(if order == WireOrder::Little { 1 } else { 0 });
        e.put_u32(self.kind as u32);
        e.put_i32(self.role as i32);
        e.put_u32(self.options);
        e.put_u32(self.n_buffers);
        e.put_u64(self.data_buffer_base);
        e.put_u32(self.data_buffer_pitch);
        e.put_u32(self.data_buffer_size);
        e.put_u64(self.metadata_base);
        e.put_u32(self.metadata_pitch);
        e.put_u64(self.full_flag_base);
        e.put_u32(self.full_flag_size);
        e.put_u32(self.full_flag_pitch);
        e.put_u64(self.full_flag_value);
        e.put_u64(self.empty_flag_base);
        e.put_u32(self.empty_flag_size);
        e.put_u32(self.empty_flag_pitch);
        e.put_u64(self.empty_flag_value);
        e.put_u64(self.oob.port_id);
        e.put_string(&self.oob.oep);
        e.put_u64(self.oob.cookie);
        e.put_u64(self.oob.address);
        e.finish()
    }

    /// Decode a record produced by `encode`, swapping byte order if the
    /// sender's differs. Any truncation, length mismatch, or over-long
    /// string is a hard decode failure with no partial object.
    pub fn decode(data: &[u8]) -> Result<Descriptor> {
        if data.len() < 8 {
            return Err(Error::Decode("descriptor record truncated"));
        }
        let sender_little = match data[4] {
            0 => false,
            1 => true,
            _ => return Err(Error::Decode("invalid byte-order tag")),
        };
        let mut d = Decoder::new(data, sender_little);
        let length = d.get_u32()?;
        if length as usize != data.len() {
            return Err(Error::Decode("wrong encoded length"));
        }
        d.get_u8()?; // order tag, already consumed above
        let kind = DescriptorKind::from_wire(d.get_u32()?)?;
        let role = PortRole::from_wire(d.get_i32()?)?;
        let options = d.get_u32()?;
        let n_buffers = d.get_u32()?;
        let data_buffer_base = d.get_u64()?;
        let data_buffer_pitch = d.get_u32()?;
        let data_buffer_size = d.get_u32()?;
        let metadata_base = d.get_u64()?;
        let metadata_pitch = d.get_u32()?;
        let full_flag_base = d.get_u64()?;
        let full_flag_size = d.get_u32()?;
        let full_flag_pitch = d.get_u32()?;
        let full_flag_value = d.get_u64()?;
        let empty_flag_base = d.get_u64()?;
        let empty_flag_size = d.get_u32()?;
        let empty_flag_pitch = d.get_u32()?;
        let empty_flag_value = d.get_u64()?;
        let port_id = d.get_u64()?;
        let oep = d.get_string()?;
        if oep.len() + 1 > MAX_ENDPOINT_NAME {
            return Err(Error::Decode("endpoint name too long"));
        }
        let cookie = d.get_u64()?;
        let address = d.get_u64()?;
        Ok(Descriptor {
            kind,
            role,
            options,
            n_buffers,
            data_buffer_base,
            data_buffer_pitch,
            data_buffer_size,
            metadata_base,
            metadata_pitch,
            full_flag_base,
            full_flag_size,
            full_flag_pitch,
            full_flag_value,
            empty_flag_base,
            empty_flag_size,
            empty_flag_pitch,
            empty_flag_value,
            oob: OutOfBand {
                port_id,
                oep,
                cookie,
                address,
            },
        })
    }
}

/// Byte order of an encoded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireOrder {
    Little,
    Big,
}

impl WireOrder {
    pub fn native() -> WireOrder {
        if cfg!(target_endian = "little") {
            WireOrder::Little
        } else {
            WireOrder::Big
        }
    }
}

// ---------------------------------------------------------------------------
// Aligned scalar packing
// ---------------------------------------------------------------------------

struct Encoder {
    buf: Vec<u8>,
    little: bool,
}

impl Encoder {
    fn new(order: WireOrder) -> Self {
        Self {
            buf: Vec::with_capacity(192),
            little: order == WireOrder::Little,
        }
    }

    fn align(&mut self, n: usize) {
        while self.buf.len() % n != 0 {
            self.buf.push(0);
        }
    }

    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn put_u32(&mut self, v: u32) {
        self.align(4);
        let b = if self.little {
            v.to_le_bytes()
        } else {
            v.to_be_bytes()
        };
        self.buf.extend_from_slice(&b);
    }

    fn put_i32(&mut self, v: i32) {
        self.put_u32(v as u32);
    }

    fn put_u64(&mut self, v: u64) {
        self.align(8);
        let b = if self.little {
            v.to_le_bytes()
        } else {
            v.to_be_bytes()
        };
        self.buf.extend_from_slice(&b);
    }

    /// Strings go out as a u32 byte count (including the terminating NUL),
    /// the bytes, and the NUL.
    fn put_string(&mut self, s: &str) {
        self.put_u32(s.len() as u32 + 1);
        self.buf.extend_from_slice(s.as_bytes());
        self.buf.push(0);
    }

    fn finish(mut self) -> Vec<u8> {
        let len = self.buf.len() as u32;
        let b = if self.little {
            len.to_le_bytes()
        } else {
            len.to_be_bytes()
        };
        self.buf[0..4].copy_from_slice(&b);
        self.buf
    }
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    little: bool,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8], little: bool) -> Self {
        Self {
            data,
            pos: 0,
            little,
        }
    }

    fn align(&mut self, n: usize) {
        while self.pos % n != 0 {
            self.pos += 1;
        }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Error::Decode("descriptor record truncated"));
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn get_u32(&mut self) -> Result<u32> {
        self.align(4);
        let b: [u8; 4] = self.take(4)?.try_into().unwrap();
        Ok(if self.little {
            u32::from_le_bytes(b)
        } else {
            u32::from_be_bytes(b)
        })
    }

    fn get_i32(&mut self) -> Result<i32> {
        Ok(self.get_u32()? as i32)
    }

    fn get_u64(&mut self) -> Result<u64> {
        self.align(8);
        let b: [u8; 8] = self.take(8)?.try_into().unwrap();
        Ok(if self.little {
            u64::from_le_bytes(b)
        } else {
            u64::from_be_bytes(b)
        })
    }

    fn get_string(&mut self) -> Result<String> {
        let n = self.get_u32()? as usize;
        if n == 0 {
            return Err(Error::Decode("string field has zero length"));
        }
        let bytes = self.take(n)?;
        if bytes[n - 1] != 0 {
            return Err(Error::Decode("string field not terminated"));
        }
        std::str::from_utf8(&bytes[..n - 1])
            .map(|s| s.to_string())
            .map_err(|_| Error::Decode("string field not valid utf-8"))
    }
}
