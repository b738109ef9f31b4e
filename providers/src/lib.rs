//! Tool-provider client and registry.
//!
//! ## Modules
//!
//! - [`spec`]: provider descriptors (local child process, remote streaming)
//! - [`client`]: the wire client (connect, list tools, invoke, close)
//! - [`session`]: live sessions with declared tool lists and generations
//! - [`registry`]: name → spec/session bookkeeping with lazy startup
//! - [`validate`]: argument validation against tool input schemas

pub mod client;
pub mod error;
pub mod registry;
pub mod session;
pub mod spec;
pub mod validate;

pub use client::{ConnectOptions, Tool};
pub use error::{ProviderError, ProviderResult};
pub use registry::ProviderRegistry;
pub use session::ProviderSession;
pub use spec::{ProviderSpec, RemoteTransport};
pub use validate::validate_args;
