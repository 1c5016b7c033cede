//! Transport layer module.

pub mod link;
pub mod mock;
pub mod serial;
pub mod traits;

pub use link::{CancelToken, Link, LinkError};
pub use mock::{MockDevice, MockDeviceConfig, MockTransport};
pub use serial::{SerialPortTransport, available_ports, select_port};
pub use traits::{PortDescriptor, PortKind, RxEvent, SerialTransport, TransportError};
