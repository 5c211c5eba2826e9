//! Payload Codecs
//!
//! Bidirectional conversion between typed resource values and the fixed-width
//! payloads carried by GATT characteristics.
//!
//! Every codec is a zero-sized type implementing [`Codec`]. `encode` is total
//! and always produces exactly [`Codec::WIDTH`] bytes; `decode` rejects any
//! other length and any code point outside the codec's domain.

use std::fmt;
use std::marker::PhantomData;
use thiserror::Error;

/// Fixed-point divisor of the scaled-fraction wire format.
pub const SCALED_FRACTION_DIVISOR: f64 = 100.0;

/// Largest value the scaled-fraction format can carry.
pub const SCALED_FRACTION_MAX: f64 = u16::MAX as f64 / SCALED_FRACTION_DIVISOR;

/// Immutable characteristic payload
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RawPayload(Box<[u8]>);

impl RawPayload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for RawPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawPayload({:02X?})", &self.0)
    }
}

impl From<Vec<u8>> for RawPayload {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes.into_boxed_slice())
    }
}

impl From<&[u8]> for RawPayload {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.into())
    }
}

impl<const N: usize> From<[u8; N]> for RawPayload {
    fn from(bytes: [u8; N]) -> Self {
        Self(Box::new(bytes))
    }
}

/// A payload failed codec validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InvalidData {
    #[error("expected {expected} byte(s), got {actual}")]
    WrongLength { expected: usize, actual: usize },
    #[error("code point {0:#04x} is outside the codec domain")]
    OutOfDomain(u8),
}

/// Encode/decode pair for one value type
pub trait Codec: Send + Sync + 'static {
    type Value: Clone + fmt::Debug + Send + 'static;

    /// Payload width in bytes
    const WIDTH: usize;

    fn encode(value: &Self::Value) -> RawPayload;

    fn decode(payload: &RawPayload) -> Result<Self::Value, InvalidData>;
}

fn expect_width(payload: &RawPayload, expected: usize) -> Result<&[u8], InvalidData> {
    if payload.len() != expected {
        return Err(InvalidData::WrongLength {
            expected,
            actual: payload.len(),
        });
    }
    Ok(payload.as_bytes())
}

/// Two-state value such as an LED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryState {
    Off,
    On,
}

impl BinaryState {
    pub fn flipped(self) -> Self {
        match self {
            Self::Off => Self::On,
            Self::On => Self::Off,
        }
    }
}

impl From<bool> for BinaryState {
    fn from(on: bool) -> Self {
        if on {
            Self::On
        } else {
            Self::Off
        }
    }
}

impl fmt::Display for BinaryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => f.write_str("off"),
            Self::On => f.write_str("on"),
        }
    }
}

/// Single byte, domain {0x00, 0x01}
pub struct BinaryStateCodec;

impl Codec for BinaryStateCodec {
    type Value = BinaryState;
    const WIDTH: usize = 1;

    fn encode(value: &BinaryState) -> RawPayload {
        match value {
            BinaryState::Off => RawPayload::from([0x00]),
            BinaryState::On => RawPayload::from([0x01]),
        }
    }

    fn decode(payload: &RawPayload) -> Result<BinaryState, InvalidData> {
        let bytes = expect_width(payload, Self::WIDTH)?;
        match bytes[0] {
            0x00 => Ok(BinaryState::Off),
            0x01 => Ok(BinaryState::On),
            other => Err(InvalidData::OutOfDomain(other)),
        }
    }
}

/// Little-endian u16 carrying hundredths
///
/// `[0x64, 0x00]` is 1.00. Encoding rounds to the nearest hundredth and
/// saturates to `0.0..=655.35`; NaN encodes as zero.
pub struct ScaledFractionCodec;

impl Codec for ScaledFractionCodec {
    type Value = f64;
    const WIDTH: usize = 2;

    fn encode(value: &f64) -> RawPayload {
        // `as` saturates and maps NaN to 0
        let raw = (value * SCALED_FRACTION_DIVISOR).round() as u16;
        RawPayload::from(raw.to_le_bytes())
    }

    fn decode(payload: &RawPayload) -> Result<f64, InvalidData> {
        let bytes = expect_width(payload, Self::WIDTH)?;
        let raw = u16::from_le_bytes([bytes[0], bytes[1]]);
        Ok(f64::from(raw) / SCALED_FRACTION_DIVISOR)
    }
}

/// One-byte enumerated command with an open domain
///
/// Codes without a known meaning must map to an explicit unknown variant
/// rather than fail, so `from_code(c).code() == c` for every byte.
pub trait CommandCode: Clone + fmt::Debug + Send + 'static {
    fn from_code(code: u8) -> Self;
    fn code(&self) -> u8;
}

/// Codec for any [`CommandCode`]
pub struct CommandCodec<T>(PhantomData<fn() -> T>);

impl<T: CommandCode> Codec for CommandCodec<T> {
    type Value = T;
    const WIDTH: usize = 1;

    fn encode(value: &T) -> RawPayload {
        RawPayload::from([value.code()])
    }

    fn decode(payload: &RawPayload) -> Result<T, InvalidData> {
        let bytes = expect_width(payload, Self::WIDTH)?;
        Ok(T::from_code(bytes[0]))
    }
}
