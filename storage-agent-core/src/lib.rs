//! Driver core for a storage-array control gateway.
//!
//! Translates structured host-management requests into a vendor CLI
//! protocol delivered over pooled, authenticated SSH sessions:
//!
//! - [`specparse`] reads the self-describing XML command specification an
//!   array publishes and materializes the [`clispec::CliSpec`] registry.
//! - [`clispec`] marshals typed, validated command invocations and owns
//!   the metadata-busy retry policy.
//! - [`response`] reparses free-form CLI output (CSV-like tables,
//!   colon-separated blocks, multi-section reports) into [`record::Record`]s.
//! - [`transport`] and [`pool`] multiplex callers over pooled SSH
//!   sessions while tolerating dead connections.
//! - [`agent`] caches per-(endpoint, user) agents and exposes the host
//!   façade the service layer calls.

pub mod agent;
pub mod client;
pub mod clispec;
pub mod codes;
pub mod error;
pub mod pool;
pub mod record;
pub mod response;
pub mod specparse;
pub mod transport;

pub use agent::{AgentRegistry, StorageAgent};
pub use client::{connect, UnifiedClient};
pub use clispec::{Args, CliSpec, Command, CommandOutput, MetaOptions};
pub use error::{AgentError, Result};
pub use pool::{ClientConnector, PooledClient, SshConnector, SshPool};
pub use record::{FieldValue, Record};
pub use response::{CliResponse, RawOutput, ResponseKind};
pub use transport::{ConnectOptions, SshTransport, Transport};
