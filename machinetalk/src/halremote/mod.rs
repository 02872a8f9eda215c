//! Remote HAL components: named pins transparently mirrored with a
//! server.

pub(crate) mod component;
mod pin;

pub use component::RemoteComponent;
pub use pin::{Pin, PinValue};
