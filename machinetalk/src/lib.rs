//! Client-side Machinetalk endpoint.
//!
//! Machinetalk is the middleware of the Machinekit CNC stack: machines
//! announce their services over DNS-SD and speak length-delimited
//! Protocol-Buffer containers over ZeroMQ. This crate implements the
//! client half:
//!
//! - [`discovery`] resolves services from DNS-SD records and drives
//!   endpoint lifecycles through aggregate readiness,
//! - [`application`] provides the command (request/reply with tickets),
//!   status (subscribe with a typed state mirror), error and log
//!   endpoints,
//! - [`halremote`] mirrors the named pins of a remote HAL component.
//!
//! Each channel owns a worker thread that is the only code touching its
//! transport socket; every callback registered on an endpoint therefore
//! fires on a worker or timer thread. Blocking `wait_*` methods are
//! provided for synchronous use.
//!
//! ```no_run
//! use machinetalk::discovery::ServiceDiscovery;
//! use machinetalk::halremote::RemoteComponent;
//! use machinetalk_proto::{PinDirection, ValueType};
//!
//! # fn main() -> machinetalk::Result<()> {
//! let component = RemoteComponent::new("anddemo")?;
//! let button = component.create_pin("button0", ValueType::HalBit, PinDirection::HalOut);
//! component.create_pin("led", ValueType::HalBit, PinDirection::HalIn);
//!
//! let discovery = ServiceDiscovery::new();
//! discovery.register_container(component.services())?;
//! discovery.start()?;
//!
//! component.wait_connected(None);
//! button.set(true);
//! # Ok(())
//! # }
//! ```

pub mod application;
mod base;
mod channel;
mod codec;
pub mod discovery;
mod error;
pub mod halremote;
mod sync;

pub use base::{EndpointState, RemoteComponentState, StatusState};
pub use channel::ChannelState;
pub use error::{Error, Result};

pub use machinetalk_proto as proto;
