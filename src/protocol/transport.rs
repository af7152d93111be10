use std::{fmt, io};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint, Limit},
    decode_from_slice, encode_to_vec,
};
use log::trace;
use thiserror::Error;

use super::{Context, Packet, WireRecord};

/// Size of the fixed packet header on the wire.
pub const HEADER_SIZE: usize = 20;

/// Largest record body accepted in either direction.
pub const MAX_PACKET_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode packet: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode packet: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed by peer")]
    Closed,
    #[error("packet body of {0} bytes exceeds the {MAX_PACKET_SIZE} byte limit")]
    Oversized(usize),
    #[error("packet body declared {declared} bytes but records used {used}")]
    TrailingBytes { declared: usize, used: usize },
}

#[derive(Debug, Encode, Decode, PartialEq, Eq)]
struct Header {
    context_high: u32,
    context_low: u32,
    request: i32,
    target: u32,
    length: u32,
}

/// Packet encoder/decoder.
///
/// Decoding is bounded by [`MAX_PACKET_SIZE`], so a length prefix inside a
/// body can never claim more memory than a whole packet may carry.
#[derive(Clone, Copy)]
pub struct WireCodec {
    config: Configuration<BigEndian, Fixint, Limit<MAX_PACKET_SIZE>>,
}

impl fmt::Debug for WireCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WireCodec(big-endian, fixint)")
    }
}

impl Default for WireCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl WireCodec {
    pub fn new() -> Self {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding()
            .with_limit::<MAX_PACKET_SIZE>();
        Self { config }
    }

    /// Appends the encoded packet to `out`. Nothing is appended on failure.
    pub fn encode(&self, packet: &Packet, out: &mut Vec<u8>) -> Result<(), TransportError> {
        let body = encode_to_vec(&packet.records, self.config)?;
        if body.len() > MAX_PACKET_SIZE {
            return Err(TransportError::Oversized(body.len()));
        }

        let header = Header {
            context_high: packet.context.high,
            context_low: packet.context.low,
            request: packet.request,
            target: packet.target,
            length: body.len() as u32,
        };
        let header = encode_to_vec(header, self.config)?;
        debug_assert_eq!(header.len(), HEADER_SIZE);

        out.reserve(header.len() + body.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&body);
        Ok(())
    }

    /// Decodes one packet from the front of `bytes`.
    ///
    /// Returns the packet and the number of bytes it occupied, or `None` when
    /// `bytes` does not yet hold a complete packet.
    pub fn decode(&self, bytes: &[u8]) -> Result<Option<(Packet, usize)>, TransportError> {
        if bytes.len() < HEADER_SIZE {
            return Ok(None);
        }

        let (header, _): (Header, usize) = decode_from_slice(&bytes[..HEADER_SIZE], self.config)?;
        let length = header.length as usize;
        if length > MAX_PACKET_SIZE {
            return Err(TransportError::Oversized(length));
        }
        let end = HEADER_SIZE + length;
        if bytes.len() < end {
            return Ok(None);
        }

        let (records, used): (Vec<WireRecord>, usize) =
            decode_from_slice(&bytes[HEADER_SIZE..end], self.config)?;
        if used != length {
            return Err(TransportError::TrailingBytes {
                declared: length,
                used,
            });
        }

        let packet = Packet {
            target: header.target,
            context: Context::new(header.context_high, header.context_low),
            request: header.request,
            records,
        };
        Ok(Some((packet, end)))
    }
}

/// Incremental decoder for a byte stream carrying back-to-back packets.
#[derive(Debug, Default)]
pub struct PacketStream {
    codec: WireCodec,
    buffer: Vec<u8>,
}

impl PacketStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers `data` and invokes `on_packet` for every packet completed by it.
    pub fn feed<F>(&mut self, data: &[u8], mut on_packet: F) -> Result<(), TransportError>
    where
        F: FnMut(Packet),
    {
        self.buffer.extend_from_slice(data);

        let mut consumed = 0;
        while let Some((packet, used)) = self.codec.decode(&self.buffer[consumed..])? {
            consumed += used;
            trace!(
                "decoded packet for target {} request {}",
                packet.target, packet.request
            );
            on_packet(packet);
        }
        self.buffer.drain(..consumed);
        Ok(())
    }

    /// Bytes held back waiting for the rest of a packet.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Data, RemoteError};

    fn sample(request: i32) -> Packet {
        Packet {
            target: 10,
            context: Context::new(0, 7),
            request,
            records: vec![
                WireRecord::new(5, Data::from("K"), None),
                WireRecord::new(6, Data::List(vec![Data::Value(4.2)]), None),
            ],
        }
    }

    #[test]
    fn read_write_packet() {
        let codec = WireCodec::new();
        let mut bytes = Vec::new();
        codec.encode(&sample(3), &mut bytes).unwrap();

        let (packet, used) = codec.decode(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(packet, sample(3));
    }

    #[test]
    fn header_is_big_endian() {
        let codec = WireCodec::new();
        let mut bytes = Vec::new();
        codec.encode(&sample(-2), &mut bytes).unwrap();

        assert_eq!(&bytes[..4], &[0, 0, 0, 0]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 7]);
        assert_eq!(&bytes[8..12], &(-2i32).to_be_bytes());
        assert_eq!(&bytes[12..16], &[0, 0, 0, 10]);
        let length = u32::from_be_bytes(bytes[16..20].try_into().unwrap());
        assert_eq!(length as usize, bytes.len() - HEADER_SIZE);
    }

    #[test]
    fn partial_packet_waits_for_more() {
        let codec = WireCodec::new();
        let mut bytes = Vec::new();
        codec.encode(&sample(1), &mut bytes).unwrap();

        assert!(codec.decode(&bytes[..HEADER_SIZE - 1]).unwrap().is_none());
        assert!(codec.decode(&bytes[..bytes.len() - 1]).unwrap().is_none());
    }

    #[test]
    fn stream_splits_and_joins_packets() {
        let codec = WireCodec::new();
        let mut bytes = Vec::new();
        codec.encode(&sample(1), &mut bytes).unwrap();
        codec.encode(&sample(-1), &mut bytes).unwrap();
        let error = Packet {
            records: vec![WireRecord::new(0, RemoteError::new(3, "bad"), None)],
            ..sample(0)
        };
        codec.encode(&error, &mut bytes).unwrap();

        let mut stream = PacketStream::new();
        let mut seen = Vec::new();
        for chunk in bytes.chunks(7) {
            stream.feed(chunk, |p| seen.push(p)).unwrap();
        }

        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].request, 1);
        assert_eq!(seen[1].request, -1);
        assert_eq!(seen[2], error);
        assert_eq!(stream.buffered(), 0);
    }

    #[test]
    fn oversized_header_is_rejected() {
        let codec = WireCodec::new();
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[16..20].copy_from_slice(&(MAX_PACKET_SIZE as u32 + 1).to_be_bytes());

        assert!(matches!(
            codec.decode(&bytes),
            Err(TransportError::Oversized(_))
        ));
    }

    #[test]
    fn huge_element_count_is_rejected() {
        let codec = WireCodec::new();
        let mut bytes = vec![0u8; HEADER_SIZE];
        bytes[16..20].copy_from_slice(&8u32.to_be_bytes());
        bytes.extend_from_slice(&(1u64 << 40).to_be_bytes());

        assert!(matches!(
            codec.decode(&bytes),
            Err(TransportError::Deserialize(_))
        ));
    }

    #[test]
    fn codec_debug_is_stable() {
        let stream = PacketStream::new();
        assert!(format!("{stream:?}").contains("WireCodec"));
    }
}
