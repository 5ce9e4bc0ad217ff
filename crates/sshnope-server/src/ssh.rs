//! russh glue.
//!
//! Maps russh server callbacks onto [`TarpitSession`]. Nothing in here makes
//! a policy decision; it only translates.

use std::path::PathBuf;
use std::time::Duration;

use russh::keys::{PrivateKey, ssh_key};
use russh::server::{self, Auth};
use russh::{Disconnect, MethodKind, MethodSet, SshId};

use crate::config::TarpitConfig;
use crate::session::{AuthMethods, PasswordAuthenticator, Rejected, TarpitSession};

/// Where the server host key comes from.
#[derive(Debug, Clone)]
pub enum KeySource {
    /// OpenSSH private key on disk.
    File(PathBuf),
    /// Fresh Ed25519 key, gone when the process exits.
    Ephemeral,
}

#[derive(Debug, thiserror::Error)]
#[error("failed to load host key {location}: {reason}")]
pub struct HostKeyError {
    pub location: String,
    pub reason: String,
}

impl KeySource {
    pub fn load(&self) -> Result<PrivateKey, HostKeyError> {
        match self {
            KeySource::File(path) => {
                russh::keys::load_secret_key(path, None).map_err(|e| HostKeyError {
                    location: path.display().to_string(),
                    reason: e.to_string(),
                })
            }
            KeySource::Ephemeral => {
                PrivateKey::random(&mut rand::thread_rng(), russh::keys::Algorithm::Ed25519)
                    .map_err(|e| HostKeyError {
                        location: "(ephemeral)".into(),
                        reason: e.to_string(),
                    })
            }
        }
    }
}

pub fn method_set(methods: AuthMethods) -> MethodSet {
    let mut kinds = Vec::new();
    if methods.password {
        kinds.push(MethodKind::Password);
    }
    if methods.public_key {
        kinds.push(MethodKind::PublicKey);
    }
    if methods.keyboard_interactive {
        kinds.push(MethodKind::KeyboardInteractive);
    }
    MethodSet::from(kinds.as_slice())
}

/// SSH_MSG_DISCONNECT framed as a clear-text binary packet, for use before
/// key exchange. Padding is zeroed and brings the packet to an 8-byte
/// boundary with at least 4 bytes of padding.
pub fn disconnect_packet(reason: Disconnect, description: &str) -> Vec<u8> {
    const SSH_MSG_DISCONNECT: u8 = 1;
    const BLOCK: usize = 8;

    let mut payload = Vec::with_capacity(13 + description.len());
    payload.push(SSH_MSG_DISCONNECT);
    payload.extend_from_slice(&(reason as u32).to_be_bytes());
    payload.extend_from_slice(&(description.len() as u32).to_be_bytes());
    payload.extend_from_slice(description.as_bytes());
    // Empty language tag.
    payload.extend_from_slice(&0u32.to_be_bytes());

    let mut padding = BLOCK - (5 + payload.len()) % BLOCK;
    if padding < 4 {
        padding += BLOCK;
    }

    let packet_length = 1 + payload.len() + padding;
    let mut packet = Vec::with_capacity(4 + packet_length);
    packet.extend_from_slice(&(packet_length as u32).to_be_bytes());
    packet.push(padding as u8);
    packet.extend_from_slice(&payload);
    packet.resize(4 + packet_length, 0);
    packet
}

/// Build the russh server config.
///
/// russh's own rejection delay is zeroed: the stall happens inside the
/// handler, so the timing is ours.
pub fn russh_config(
    config: &TarpitConfig,
    host_key: PrivateKey,
    methods: AuthMethods,
) -> server::Config {
    server::Config {
        server_id: SshId::Standard(config.server_id.clone()),
        methods: method_set(methods),
        auth_rejection_time: Duration::ZERO,
        auth_rejection_time_initial: Some(Duration::ZERO),
        keepalive_interval: Some(config.keepalive_interval()),
        keys: vec![host_key],
        ..Default::default()
    }
}

/// Handler for a single SSH connection.
///
/// Dropping it (russh does so when the transport closes) ends the session and
/// releases its admission.
pub struct TarpitHandler {
    session: TarpitSession,
}

impl TarpitHandler {
    pub fn new(session: TarpitSession) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &TarpitSession {
        &self.session
    }

    fn reject(&self) -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(method_set(self.session.supported_methods())),
            partial_success: false,
        }
    }
}

impl server::Handler for TarpitHandler {
    type Error = russh::Error;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        tracing::debug!("auth none from {} as {:?}", self.session.remote_ip(), user);
        Ok(self.reject())
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let Rejected = self.session.validate_password(user, password).await;
        Ok(self.reject())
    }

    async fn auth_publickey_offered(
        &mut self,
        _user: &str,
        _public_key: &ssh_key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(self.reject())
    }

    async fn auth_publickey(
        &mut self,
        _user: &str,
        _public_key: &ssh_key::PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(self.reject())
    }
}
