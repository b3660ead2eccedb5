// terminal: Attendance terminal resilience layer.
// Exposes modules for integration testing.

pub mod api;
pub mod broker;
pub mod config;
pub mod context;
pub mod hooks;
pub mod router;
pub mod session;
pub mod storage;
pub mod terminal;

pub use context::{DeviceContext, DeviceIdentity};
pub use session::TransportSession;
pub use terminal::{Delivery, Terminal, TerminalParts, TerminalStatus};
