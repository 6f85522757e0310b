//! The tunnel dataplane: session state machines for both sides of the
//! control link, virtual connection registry, bidirectional piping with
//! backpressure, port allocation, and the ambient configuration/credential
//! layers the binaries wire together.

pub mod allocator;
pub mod auth;
pub mod client_session;
pub mod config;
pub mod error;
pub mod link;
pub mod observer;
pub mod pipe;
pub mod queue;
pub mod registry;
pub mod server_session;
mod sockopt;
pub mod timeouts;

pub use allocator::PortAllocator;
pub use auth::{AuthAttempt, Credentials, CredentialVerifier, parse_auth_line};
pub use client_session::{ClientConfig, TunnelClient};
pub use config::{Account, Config, ConfigError, PortRange};
pub use error::TunnelError;
pub use link::ControlLink;
pub use observer::{ClientObserver, LoggingObserver, PingBand, SessionState};
pub use pipe::Pipe;
pub use registry::VcRegistry;
pub use server_session::{ServerShared, handle_session, serve};
pub use timeouts::Timeouts;
