//! Local coordination core for MCP servers sharing one well-known port.
//!
//! Multiple independently launched processes of the same server elect a
//! primary through an exclusive-create lock file. The primary binds the
//! shared port and answers the loopback control endpoints (`/__version`,
//! `/__shutdown`, `/__transition`); every other instance either reverse-
//! proxies HTTP traffic to it or bridges a stdio client onto its HTTP
//! endpoint. Crashed primaries are evicted via PID liveness checks on the
//! lock, and newer versions take the port over through the transition
//! protocol.

mod bridge;
mod control;
mod coordinator;
mod error;
mod instance;
mod lock;
mod ports;
mod proxy;
mod signals;

pub use bridge::{UpstreamToolHandler, run_stdio_bridge, run_stdio_server};
pub use control::{CONTROL_TIMEOUT, ControlClient};
pub use coordinator::{Coordinator, PrimaryReason, RoleOutcome};
pub use error::CoordError;
pub use instance::{DEFAULT_WAIT_FOR_PORT, InstanceManager, Role};
pub use lock::{LockRecord, LockStore, default_lock_path, now_ms};
pub use ports::{DEFAULT_FIND_RETRIES, PortManager};
pub use proxy::{ProxyHandle, ProxyMetadata, ProxyOptions, start as start_proxy};
pub use signals::shutdown_signal;

/// Path of the MCP endpoint every instance serves and forwards.
pub const MCP_ENDPOINT_PATH: &str = "/mcp";
