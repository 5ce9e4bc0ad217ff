//! sshnope server library
//!
//! An SSH tarpit: admits a bounded number of connections, holds every
//! password attempt for a fixed delay, always rejects, and drains the
//! captured credentials to an append-only CSV file.

pub mod capture;
pub mod config;
pub mod constants;
pub mod drain;
pub mod gate;
pub mod server;
pub mod session;
pub mod sink;
pub mod ssh;

pub use capture::{CredentialBuffer, CredentialRecord};
pub use config::{ConfigError, TarpitConfig};
pub use drain::DrainLoop;
pub use gate::{Admission, ConnectionGate};
pub use server::{StartupError, TarpitServer};
pub use session::{
    AuthMethods, ConnectionObserver, PasswordAuthenticator, Rejected, SessionState, TarpitSession,
};
pub use sink::{BatchError, CredentialSink, CsvSink, SinkError, read_records};
pub use ssh::{HostKeyError, KeySource, TarpitHandler};
