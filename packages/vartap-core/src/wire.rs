//! Binary wire framing shared by both directions of the data channel.
//!
//! Every binary message starts with a fixed 16-byte little-endian header so
//! the two ends can demultiplex by buffer id and validate the element type
//! before touching the payload. Outbound, the transport prepends it to
//! stream frames and monitor packets; inbound, [`InboundRegistry`] parses it
//! and hands the typed payload to the registered consumer on the transport
//! thread.

use dashmap::DashMap;

use crate::error::{WatchError, WatchResult};
use crate::value::{ValueKind, WatchKind};

/// Size of the binary channel header.
pub const WIRE_HEADER_LEN: usize = 16;

/// Fixed header of every binary channel message.
///
/// `buffer_type` carries the element's wire code in its first byte, the
/// rest zero. `buffer_len` counts values, not bytes. `reserved` is zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub buffer_id: u32,
    pub buffer_type: [u8; 4],
    pub buffer_len: u32,
    pub reserved: u32,
}

impl FrameHeader {
    /// Builds a header for `buffer_len` values of `kind`.
    #[must_use]
    pub fn for_kind(buffer_id: u32, kind: ValueKind, buffer_len: u32) -> Self {
        let mut buffer_type = [0u8; 4];
        buffer_type[0] = kind.code().as_bytes()[0];
        Self {
            buffer_id,
            buffer_type,
            buffer_len,
            reserved: 0,
        }
    }

    /// The element kind named by `buffer_type`, if recognised.
    #[must_use]
    pub fn kind(&self) -> Option<ValueKind> {
        ValueKind::from_code(self.buffer_type[0])
    }

    /// Encodes the header in wire order.
    #[must_use]
    pub fn encode(&self) -> [u8; WIRE_HEADER_LEN] {
        let mut out = [0u8; WIRE_HEADER_LEN];
        out[0..4].copy_from_slice(&self.buffer_id.to_le_bytes());
        out[4..8].copy_from_slice(&self.buffer_type);
        out[8..12].copy_from_slice(&self.buffer_len.to_le_bytes());
        out[12..16].copy_from_slice(&self.reserved.to_le_bytes());
        out
    }

    /// Parses a header from the front of a message.
    #[must_use]
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < WIRE_HEADER_LEN {
            return None;
        }
        Some(Self {
            buffer_id: u32::from_le_bytes(bytes[0..4].try_into().ok()?),
            buffer_type: bytes[4..8].try_into().ok()?,
            buffer_len: u32::from_le_bytes(bytes[8..12].try_into().ok()?),
            reserved: u32::from_le_bytes(bytes[12..16].try_into().ok()?),
        })
    }
}

/// Builds one monitor emission: 8-byte timestamp plus a single value,
/// padded to a whole number of values so alignment survives on the host.
///
/// Returns the packet storage and the number of valid bytes.
#[must_use]
pub fn monitor_packet(kind: ValueKind, timestamp: u64, bits: u64) -> ([u8; 16], usize) {
    let size = kind.size();
    let len = (8 + size).div_ceil(size) * size;
    debug_assert!(len <= 16);
    let mut packet = [0u8; 16];
    packet[..8].copy_from_slice(&timestamp.to_le_bytes());
    kind.write_bits_le(bits, &mut packet[8..8 + size]);
    (packet, len)
}

/// One validated host-to-runtime frame.
pub struct InboundFrame<'a> {
    pub buffer_id: u32,
    pub kind: ValueKind,
    /// Number of values in the payload.
    pub len: u32,
    pub payload: &'a [u8],
}

impl InboundFrame<'_> {
    /// Decodes the payload as the concrete type `T`.
    #[must_use]
    pub fn values_as<T: WatchKind>(&self) -> Vec<T> {
        let size = T::KIND.size();
        self.payload
            .chunks_exact(size)
            .map(|c| T::from_bits64(T::KIND.read_bits_le(c)))
            .collect()
    }
}

type InboundHandler = Box<dyn Fn(&InboundFrame<'_>) + Send + Sync>;

struct InboundEntry {
    kind: ValueKind,
    handler: InboundHandler,
}

/// Table of host-to-runtime streams, keyed by buffer id.
///
/// Inbound ids form their own namespace chosen by the application at
/// registration; they are unrelated to the ids the manager reserves for
/// outbound variable streams.
#[derive(Default)]
pub struct InboundRegistry {
    entries: DashMap<u32, InboundEntry>,
}

impl InboundRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a consumer for one inbound stream.
    ///
    /// The handler runs on the transport thread; forward into a lock-free
    /// ring if the data must reach the RT thread.
    pub fn register(
        &self,
        buffer_id: u32,
        kind: ValueKind,
        handler: impl Fn(&InboundFrame<'_>) + Send + Sync + 'static,
    ) {
        self.entries.insert(
            buffer_id,
            InboundEntry {
                kind,
                handler: Box::new(handler),
            },
        );
    }

    /// Removes a consumer.
    pub fn unregister(&self, buffer_id: u32) {
        self.entries.remove(&buffer_id);
    }

    /// Validates and delivers one binary message.
    pub fn dispatch(&self, bytes: &[u8]) -> WatchResult<()> {
        let header = FrameHeader::parse(bytes).ok_or_else(|| WatchError::ProtocolViolation {
            cmd: "inbound".into(),
            detail: format!("message of {} bytes is shorter than the header", bytes.len()),
        })?;

        let entry = self
            .entries
            .get(&header.buffer_id)
            .ok_or_else(|| WatchError::UnknownVariable(format!("inbound buffer {}", header.buffer_id)))?;

        let kind = match header.kind() {
            Some(kind) if kind == entry.kind => kind,
            other => {
                return Err(WatchError::TypeMismatch {
                    name: format!("inbound buffer {}", header.buffer_id),
                    expected: entry.kind.code(),
                    got: other.map_or_else(
                        || format!("{:?}", header.buffer_type),
                        |k| k.code().to_string(),
                    ),
                })
            }
        };

        let expected = header.buffer_len as usize * kind.size();
        let payload = &bytes[WIRE_HEADER_LEN..];
        if payload.len() < expected {
            return Err(WatchError::ProtocolViolation {
                cmd: "inbound".into(),
                detail: format!(
                    "payload of {} bytes, header promises {}",
                    payload.len(),
                    expected
                ),
            });
        }

        (entry.handler)(&InboundFrame {
            buffer_id: header.buffer_id,
            kind,
            len: header.buffer_len,
            payload: &payload[..expected],
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn header_round_trip() {
        let header = FrameHeader::for_kind(7, ValueKind::F32, 256);
        let parsed = FrameHeader::parse(&header.encode()).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.kind(), Some(ValueKind::F32));
        assert_eq!(parsed.buffer_type, *b"f\0\0\0");
    }

    #[test]
    fn monitor_packet_lengths_per_kind() {
        // header + one value, rounded up to a whole number of values
        assert_eq!(monitor_packet(ValueKind::Char, 0, 0).1, 9);
        assert_eq!(monitor_packet(ValueKind::F32, 0, 0).1, 12);
        assert_eq!(monitor_packet(ValueKind::F64, 0, 0).1, 16);
    }

    #[test]
    fn monitor_packet_carries_timestamp_and_value() {
        let (packet, len) = monitor_packet(ValueKind::U32, 99, 0x1234);
        assert_eq!(len, 12);
        assert_eq!(u64::from_le_bytes(packet[..8].try_into().unwrap()), 99);
        assert_eq!(u32::from_le_bytes(packet[8..12].try_into().unwrap()), 0x1234);
    }

    fn message(buffer_id: u32, kind: ValueKind, values: &[u8]) -> Vec<u8> {
        let header = FrameHeader::for_kind(
            buffer_id,
            kind,
            (values.len() / kind.size()) as u32,
        );
        let mut out = header.encode().to_vec();
        out.extend_from_slice(values);
        out
    }

    #[test]
    fn dispatch_delivers_typed_values() {
        let registry = InboundRegistry::new();
        let seen: Arc<Mutex<Vec<f32>>> = Arc::default();
        let sink = Arc::clone(&seen);
        registry.register(0, ValueKind::F32, move |frame| {
            sink.lock().extend(frame.values_as::<f32>());
        });

        let mut payload = Vec::new();
        for v in [1.0f32, 2.5, -3.0] {
            payload.extend_from_slice(&v.to_le_bytes());
        }
        registry.dispatch(&message(0, ValueKind::F32, &payload)).unwrap();
        assert_eq!(*seen.lock(), vec![1.0, 2.5, -3.0]);
    }

    #[test]
    fn dispatch_rejects_unknown_buffer() {
        let registry = InboundRegistry::new();
        let err = registry
            .dispatch(&message(9, ValueKind::F32, &[0; 4]))
            .unwrap_err();
        assert_eq!(err.code(), "unknown_variable");
    }

    #[test]
    fn dispatch_rejects_type_mismatch() {
        let registry = InboundRegistry::new();
        registry.register(0, ValueKind::I32, |_| {});
        let err = registry
            .dispatch(&message(0, ValueKind::F32, &[0; 4]))
            .unwrap_err();
        assert_eq!(err.code(), "type_mismatch");
    }

    #[test]
    fn dispatch_rejects_short_payload() {
        let registry = InboundRegistry::new();
        registry.register(0, ValueKind::F64, |_| {});
        let header = FrameHeader::for_kind(0, ValueKind::F64, 4);
        let mut msg = header.encode().to_vec();
        msg.extend_from_slice(&[0u8; 8]); // promises 4 values, carries 1
        let err = registry.dispatch(&msg).unwrap_err();
        assert_eq!(err.code(), "protocol_violation");
    }
}
