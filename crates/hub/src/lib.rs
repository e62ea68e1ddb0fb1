//! Controller for remote agents speaking a typed, length-framed protocol
//! over TCP. Agents connect in, identify themselves, and the operator
//! drives one of them at a time.

pub mod channel;
pub mod config;
pub mod connection;
pub mod console;
pub mod controller;
pub mod error;
pub mod focus;
pub mod handshake;
pub mod keepalive;
pub mod ops;
pub mod protocol;
pub mod registry;
pub mod server;

pub use config::{Args, Config};
pub use connection::{Connection, ConnectionId};
pub use controller::run_controller;
pub use error::{ChannelError, HubError, RegistryError};
pub use focus::{Failover, Focus};
pub use protocol::{Frame, FrameFormat, MessageKind};
pub use registry::{BroadcastReport, Registry};
pub use server::Acceptor;
