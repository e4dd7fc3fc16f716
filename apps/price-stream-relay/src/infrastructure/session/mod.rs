//! Downstream client sessions and the listener that creates them.

pub mod command;
pub mod server;
#[allow(clippy::module_inception)]
pub mod session;

pub use command::ClientCommand;
pub use server::{RelayServer, RelayServerConfig, RelayServerError};
pub use session::{ClientSession, Outbound, SessionState, queue_deliver, run_session};
