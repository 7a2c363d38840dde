mod control;
mod frame;

pub use control::{ControlMessage, OutboundControl, WireTurn, WireWord};
pub use frame::{AUDIO_TAG, CONTROL_TAG, DecodeError, Frame, RawMessage, decode, encode_audio};
