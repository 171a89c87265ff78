//! Transport lifecycle: restart controls and the connectors that keep one
//! local transport bound to its server-side counterpart.

pub mod connector;
pub mod ice_restart;
pub mod multi;
pub mod restart;
pub mod send;

pub use connector::{TransportConnector, TransportEvent};
pub use ice_restart::IceRestartControl;
pub use multi::MultiTransportConnector;
pub use restart::{RestartState, TransportRestartControl};
pub use send::SendTransportConnector;
