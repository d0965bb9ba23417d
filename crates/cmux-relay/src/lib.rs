//! WebSocket terminal relay.
//!
//! Bridges a browser terminal to a command running in a container (or, for
//! development, on the local host): JSON frames in, JSON frames out, with
//! keepalive, resize propagation and shell discovery for minimal images.

mod attempt;
pub mod bridge;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod executor;
pub mod liveness;
pub mod protocol;
pub mod resize;
pub mod server;
pub mod session;
pub mod shell;

#[cfg(test)]
pub(crate) mod testing;

pub use bridge::{BridgeController, BridgeOutcome, BridgeReport, BridgeState, SessionRequest};
pub use config::{BridgeConfig, KeepaliveConfig, ResolverConfig};
pub use error::{ErrorKind, ExecError, RelayError, SessionError};
pub use executor::{BackendKind, ExecTarget, ProbeOutcome, ProbeRunner, RemoteExecutor};
pub use server::{build_router, run_server, AppState};
pub use session::{ReadOutcome, TerminalIo, TerminalSession};
