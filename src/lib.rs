// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dataplane contributors
//
// Data-plane transport for distributed dataflow workers: zero-copy
// buffer rings, role negotiation, the connection handshake, and the
// mailbox-based out-of-band control protocol. Peers may share a process,
// a host, or nothing but a fabric; the application never knows which.

pub mod bridge;
pub mod circuit;
pub mod descriptor;
pub mod endpoint;
pub mod launcher;
pub mod mailbox;
pub mod params;
pub mod port;
pub mod ring;
pub mod role;
pub mod transport;

mod error;
pub use error::{Error, Result};

mod spin_lock;
pub use spin_lock::SpinLock;

pub use bridge::{Distribution, PortMeta, ScaledPort};
pub use circuit::{Circuit, CircuitId, XferPort};
pub use descriptor::{Descriptor, DescriptorKind, WireOrder};
pub use endpoint::{EndPoint, Fabric};
pub use launcher::{determine_transport, Connection, NegotiatedTransport, TransportOffer};
pub use params::Params;
pub use port::{FullBuffer, Port};
pub use ring::{MessageHeader, Ring};
pub use role::{choose_roles, PortRole};
pub use transport::Transport;
