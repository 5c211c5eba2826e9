//! Boost peripheral resources
//!
//! Service/characteristic identifiers and value types for every endpoint the
//! Boost firmware exposes. The identifiers are fixed by the firmware.

use crate::domain::codec::{BinaryStateCodec, Codec, CommandCode, CommandCodec, ScaledFractionCodec};
use crate::domain::models::{CharacteristicId, ServiceId};
use std::fmt;
use uuid::{uuid, Uuid};

/// Boost vehicle service: steering wheel buttons and battery level
pub const BOOST_SERVICE_UUID: Uuid = uuid!("9a7e8b1d-ea49-40d6-b575-406ad07f8816");

/// Indicator LED service
pub const LED_SERVICE_UUID: Uuid = uuid!("70da7ab7-4fe2-4614-b092-2e8ec60290bb");

pub const LED_CHAR_UUID: Uuid = uuid!("6962cdc6-dcb1-465b-8aa4-23491caf4840");
pub const STEERING_WHEEL_CHAR_UUID: Uuid = uuid!("bbbef1d2-e1e6-4189-be0b-c00d6d3cc6bb");
pub const BATTERY_LEVEL_CHAR_UUID: Uuid = uuid!("63f13ce9-63b0-4ed3-8eba-27441ddfc18e");

/// Static description of one resource kind
pub trait ResourceKind {
    type Codec: Codec;

    const SERVICE_ID: ServiceId;
    const CHARACTERISTIC_ID: CharacteristicId;
    const WANTS_NOTIFICATIONS: bool;
}

/// Indicator LED, written by the app
pub struct Led;

impl ResourceKind for Led {
    type Codec = BinaryStateCodec;
    const SERVICE_ID: ServiceId = LED_SERVICE_UUID;
    const CHARACTERISTIC_ID: CharacteristicId = LED_CHAR_UUID;
    const WANTS_NOTIFICATIONS: bool = false;
}

/// Steering wheel button presses
pub struct SteeringWheel;

impl ResourceKind for SteeringWheel {
    type Codec = CommandCodec<SteeringWheelButton>;
    const SERVICE_ID: ServiceId = BOOST_SERVICE_UUID;
    const CHARACTERISTIC_ID: CharacteristicId = STEERING_WHEEL_CHAR_UUID;
    const WANTS_NOTIFICATIONS: bool = true;
}

/// Battery level in volts
pub struct BatteryLevel;

impl ResourceKind for BatteryLevel {
    type Codec = ScaledFractionCodec;
    const SERVICE_ID: ServiceId = BOOST_SERVICE_UUID;
    const CHARACTERISTIC_ID: CharacteristicId = BATTERY_LEVEL_CHAR_UUID;
    const WANTS_NOTIFICATIONS: bool = true;
}

/// Button reported by the steering wheel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SteeringWheelButton {
    None,
    VolumeUp,
    VolumeDown,
    RightUp,
    RightDown,
    LeftUp,
    LeftDown,
    Voice,
    Clear,
    Set,
    /// Code the firmware sent that this build does not know
    Unknown(u8),
}

impl CommandCode for SteeringWheelButton {
    fn from_code(code: u8) -> Self {
        match code {
            0x00 => Self::None,
            0x01 => Self::VolumeUp,
            0x02 => Self::VolumeDown,
            0x03 => Self::RightUp,
            0x04 => Self::RightDown,
            0x05 => Self::LeftUp,
            0x06 => Self::LeftDown,
            0x11 => Self::Voice,
            0x12 => Self::Clear,
            0x13 => Self::Set,
            other => Self::Unknown(other),
        }
    }

    fn code(&self) -> u8 {
        match self {
            Self::None => 0x00,
            Self::VolumeUp => 0x01,
            Self::VolumeDown => 0x02,
            Self::RightUp => 0x03,
            Self::RightDown => 0x04,
            Self::LeftUp => 0x05,
            Self::LeftDown => 0x06,
            Self::Voice => 0x11,
            Self::Clear => 0x12,
            Self::Set => 0x13,
            Self::Unknown(code) => *code,
        }
    }
}

impl fmt::Display for SteeringWheelButton {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("none"),
            Self::VolumeUp => f.write_str("volume up"),
            Self::VolumeDown => f.write_str("volume down"),
            Self::RightUp => f.write_str("right up"),
            Self::RightDown => f.write_str("right down"),
            Self::LeftUp => f.write_str("left up"),
            Self::LeftDown => f.write_str("left down"),
            Self::Voice => f.write_str("voice"),
            Self::Clear => f.write_str("clear"),
            Self::Set => f.write_str("set"),
            Self::Unknown(code) => write!(f, "unknown ({code:#04x})"),
        }
    }
}
