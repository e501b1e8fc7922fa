//! The closed set of watchable value types.
//!
//! Every watched variable carries one of five scalar kinds, fixed at
//! registration. Dispatch in the hot path is monomorphic: the typed cell
//! knows its Rust type, the byte-level paths switch on [`ValueKind`] once
//! per frame at most.
//!
//! The single-character wire codes (`c`, `j`, `i`, `f`, `d`) appear in the
//! list response, the log-file header and the inbound `bufferType` field,
//! and match what remote hosts already parse.

use serde::Serialize;

/// Scalar kind of a watched variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    Char,
    U32,
    I32,
    F32,
    F64,
}

impl ValueKind {
    /// Size of one value in bytes. Also its natural alignment.
    #[must_use]
    pub const fn size(&self) -> usize {
        match self {
            Self::Char => 1,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    /// Single-character wire code used on the control and log channels.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Char => "c",
            Self::U32 => "j",
            Self::I32 => "i",
            Self::F32 => "f",
            Self::F64 => "d",
        }
    }

    /// Parses a wire code back into a kind.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            b'c' => Some(Self::Char),
            b'j' => Some(Self::U32),
            b'i' => Some(Self::I32),
            b'f' => Some(Self::F32),
            b'd' => Some(Self::F64),
            _ => None,
        }
    }

    /// Whether `setMask` applies to this kind.
    #[must_use]
    pub const fn is_integer(&self) -> bool {
        matches!(self, Self::Char | Self::U32 | Self::I32)
    }

    /// Converts a control-plane number into this kind's bit pattern.
    ///
    /// The control channel carries all values as JSON numbers; they are
    /// narrowed to the variable's declared kind on apply.
    #[must_use]
    pub fn bits_from_f64(&self, value: f64) -> u64 {
        match self {
            Self::Char => value as u8 as u64,
            Self::U32 => value as u32 as u64,
            Self::I32 => (value as i32) as u32 as u64,
            Self::F32 => (value as f32).to_bits() as u64,
            Self::F64 => value.to_bits(),
        }
    }

    /// Converts a stored bit pattern back into a control-plane number.
    #[must_use]
    pub fn bits_to_f64(&self, bits: u64) -> f64 {
        match self {
            Self::Char => (bits as u8) as f64,
            Self::U32 => (bits as u32) as f64,
            Self::I32 => (bits as u32 as i32) as f64,
            Self::F32 => f32::from_bits(bits as u32) as f64,
            Self::F64 => f64::from_bits(bits),
        }
    }

    /// Writes the value encoded by `bits` to `out` in little-endian order.
    ///
    /// `out` must be exactly `self.size()` bytes.
    pub fn write_bits_le(&self, bits: u64, out: &mut [u8]) {
        debug_assert_eq!(out.len(), self.size());
        match self {
            Self::Char => out[0] = bits as u8,
            Self::U32 | Self::I32 | Self::F32 => {
                out.copy_from_slice(&(bits as u32).to_le_bytes())
            }
            Self::F64 => out.copy_from_slice(&bits.to_le_bytes()),
        }
    }

    /// Reads a little-endian value of this kind and widens it to a bit
    /// pattern as stored by [`Self::bits_from_f64`].
    #[must_use]
    pub fn read_bits_le(&self, bytes: &[u8]) -> u64 {
        debug_assert!(bytes.len() >= self.size());
        match self {
            Self::Char => bytes[0] as u64,
            Self::U32 | Self::I32 | Self::F32 => {
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64
            }
            Self::F64 => u64::from_le_bytes([
                bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
            ]),
        }
    }
}

/// Per-variable framing mode, fixed at registration.
///
/// Block mode stamps one absolute timestamp per frame; sample mode adds a
/// 32-bit relative timestamp per value so sparse assignments stay datable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampMode {
    Block,
    Sample,
}

impl TimestampMode {
    /// Numeric form used on the control channel.
    #[must_use]
    pub const fn as_u8(&self) -> u8 {
        match self {
            Self::Block => 0,
            Self::Sample => 1,
        }
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for u8 {}
    impl Sealed for u32 {}
    impl Sealed for i32 {}
    impl Sealed for f32 {}
    impl Sealed for f64 {}
}

/// Rust-side trait for the five watchable scalar types.
///
/// Implemented only for the closed set; the bit-pattern round trip must
/// agree with [`ValueKind::write_bits_le`] for the matching kind.
pub trait WatchKind: Copy + Default + Send + 'static + sealed::Sealed {
    /// The tagged kind matching `Self`.
    const KIND: ValueKind;

    /// Widens the value into the shared 64-bit cell representation.
    fn to_bits64(self) -> u64;

    /// Inverse of [`Self::to_bits64`].
    fn from_bits64(bits: u64) -> Self;
}

impl WatchKind for u8 {
    const KIND: ValueKind = ValueKind::Char;

    fn to_bits64(self) -> u64 {
        self as u64
    }

    fn from_bits64(bits: u64) -> Self {
        bits as u8
    }
}

impl WatchKind for u32 {
    const KIND: ValueKind = ValueKind::U32;

    fn to_bits64(self) -> u64 {
        self as u64
    }

    fn from_bits64(bits: u64) -> Self {
        bits as u32
    }
}

impl WatchKind for i32 {
    const KIND: ValueKind = ValueKind::I32;

    fn to_bits64(self) -> u64 {
        self as u32 as u64
    }

    fn from_bits64(bits: u64) -> Self {
        bits as u32 as i32
    }
}

impl WatchKind for f32 {
    const KIND: ValueKind = ValueKind::F32;

    fn to_bits64(self) -> u64 {
        self.to_bits() as u64
    }

    fn from_bits64(bits: u64) -> Self {
        f32::from_bits(bits as u32)
    }
}

impl WatchKind for f64 {
    const KIND: ValueKind = ValueKind::F64;

    fn to_bits64(self) -> u64 {
        self.to_bits()
    }

    fn from_bits64(bits: u64) -> Self {
        f64::from_bits(bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_match_wire_layout() {
        assert_eq!(ValueKind::Char.size(), 1);
        assert_eq!(ValueKind::U32.size(), 4);
        assert_eq!(ValueKind::I32.size(), 4);
        assert_eq!(ValueKind::F32.size(), 4);
        assert_eq!(ValueKind::F64.size(), 8);
    }

    #[test]
    fn codes_round_trip() {
        for kind in [
            ValueKind::Char,
            ValueKind::U32,
            ValueKind::I32,
            ValueKind::F32,
            ValueKind::F64,
        ] {
            let code = kind.code().as_bytes()[0];
            assert_eq!(ValueKind::from_code(code), Some(kind));
        }
        assert_eq!(ValueKind::from_code(b'x'), None);
    }

    #[test]
    fn negative_i32_survives_the_bit_cell() {
        let bits = (-42i32).to_bits64();
        assert_eq!(i32::from_bits64(bits), -42);
        assert_eq!(ValueKind::I32.bits_to_f64(bits), -42.0);
    }

    #[test]
    fn f64_conversion_narrows_to_declared_kind() {
        let bits = ValueKind::Char.bits_from_f64(300.0);
        // 300 wraps as u8
        assert_eq!(bits, 44);

        let bits = ValueKind::F32.bits_from_f64(1.5);
        assert_eq!(f32::from_bits(bits as u32), 1.5);
    }

    #[test]
    fn le_write_matches_native_encoding() {
        let mut out = [0u8; 4];
        ValueKind::F32.write_bits_le(0.25f32.to_bits() as u64, &mut out);
        assert_eq!(out, 0.25f32.to_le_bytes());
        assert_eq!(
            ValueKind::F32.read_bits_le(&out),
            0.25f32.to_bits() as u64
        );
    }

    #[test]
    fn trait_and_tag_agree() {
        fn check<T: WatchKind>(v: T) {
            let mut out = vec![0u8; T::KIND.size()];
            T::KIND.write_bits_le(v.to_bits64(), &mut out);
            assert_eq!(T::KIND.read_bits_le(&out), v.to_bits64());
        }
        check(7u8);
        check(0xdead_beefu32);
        check(-1i32);
        check(3.25f32);
        check(-0.5f64);
    }
}
