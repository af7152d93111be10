//! Client-manager communication protocol.
//!
//! This module defines how packets are exchanged with the LabRAD manager:
//! packet and record types, the wire codec, and the [`ProtocolEngine`] that
//! owns the socket and multiplexes many concurrent requests over it.
//!
//! # Overview
//!
//! Every unit of traffic is a [`Packet`] addressed to a target server, tagged
//! with a [`Context`] and a request number, and carrying a list of records.
//! The sign of the request number gives the packet's role:
//!
//! - positive: a new request that expects a reply;
//! - negative: the reply to the pending request with the same absolute value;
//! - zero: a one-way message.
//!
//! Request numbers are allocated by the engine from a pool of released ids so
//! they stay small under sustained traffic.
//!
//! # Binary Format
//!
//! - A fixed 20 byte header: context (two `u32`), request (`i32`), target
//!   (`u32`) and body length (`u32`), all big-endian.
//! - The body: the packet's records, encoded with bincode using big-endian
//!   fixed-width integers.
//!
//! # Key Components
//!
//! - [`WireCodec`] / [`PacketStream`]: packet encoding and incremental decoding.
//! - [`ProtocolEngine`]: the dedicated I/O thread and its request table.
//! - [`Promise`] / [`Reply`]: the hand-off between the I/O thread and callers.
//!
//! # See Also
//!
//! - [`connection`](crate::connection): the public connection facade.
mod engine;
mod packet;
pub mod reply;
mod requests;
mod transport;

use crate::ConnectionError;

pub use engine::{EngineStats, POLL_INTERVAL, ProtocolEngine};
pub use packet::{Context, Packet, Record, Setting, Target, WireRecord};
pub use reply::{Promise, Reply, ReplyResult};
pub use transport::{HEADER_SIZE, MAX_PACKET_SIZE, PacketStream, TransportError, WireCodec};

/// Server id of the manager; login, identification and lookups go here.
pub const MANAGER_ID: u32 = 1;

/// Manager setting that translates server and setting names into ids.
pub const LOOKUP_SETTING: u32 = 3;

/// Protocol version sent with the identification record.
pub const PROTOCOL_VERSION: u32 = 1;

/// Something that can perform a resolved request and wait for its reply.
pub(crate) trait Requester {
    fn request(
        &self,
        target: u32,
        records: Vec<WireRecord>,
    ) -> Result<Vec<WireRecord>, ConnectionError>;
}
