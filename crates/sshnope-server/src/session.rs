//! Per-connection tarpit behavior.
//!
//! [`TarpitSession`] knows nothing about SSH framing. The protocol engine
//! drives it through two capability traits: [`ConnectionObserver`] for the
//! transport lifecycle and [`PasswordAuthenticator`] for credential exchange.
//! Every password attempt is recorded, held for the stall delay, and then
//! rejected. There is no success path: the authenticator can only ever
//! return [`Rejected`].

use std::future::Future;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime};

use crate::capture::{CredentialBuffer, CredentialRecord};
use crate::gate::{Admission, ConnectionGate};

/// Transport lifecycle hooks.
pub trait ConnectionObserver {
    /// The transport is up. Returns `false` when the connection must be
    /// dropped immediately; no further hooks fire in that case.
    fn connection_made(&mut self) -> bool;

    /// The transport is gone.
    fn connection_lost(&mut self);
}

/// Which authentication methods to advertise to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthMethods {
    pub password: bool,
    pub public_key: bool,
    pub keyboard_interactive: bool,
}

/// Outcome of every authentication exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rejected;

/// Password authentication hooks.
pub trait PasswordAuthenticator {
    fn supported_methods(&self) -> AuthMethods;

    fn validate_password(
        &mut self,
        username: &str,
        password: &str,
    ) -> impl Future<Output = Rejected> + Send;

    fn change_password(
        &mut self,
        username: &str,
        old_password: &str,
        new_password: &str,
    ) -> impl Future<Output = Rejected> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Admitted, no attempt in flight.
    Connected,
    /// Holding an attempt for the stall delay.
    AuthStall,
    /// Last attempt was rejected; the client may try again.
    Rejected,
    /// Refused by the gate, or the transport is gone.
    Closed,
}

/// Tarpit state for one connection.
#[derive(Debug)]
pub struct TarpitSession {
    remote_ip: String,
    gate: ConnectionGate,
    admission: Option<Admission>,
    buffer: CredentialBuffer,
    stall_delay: Duration,
    state: SessionState,
    attempts: u32,
    created_at: SystemTime,
}

impl TarpitSession {
    /// Password only. Public key and keyboard-interactive are refused so
    /// every client ends up on the instrumented path.
    pub const METHODS: AuthMethods = AuthMethods {
        password: true,
        public_key: false,
        keyboard_interactive: false,
    };

    pub fn new(
        peer: SocketAddr,
        gate: ConnectionGate,
        buffer: CredentialBuffer,
        stall_delay: Duration,
    ) -> Self {
        Self {
            remote_ip: peer.ip().to_string(),
            gate,
            admission: None,
            buffer,
            stall_delay,
            state: SessionState::Connected,
            attempts: 0,
            created_at: SystemTime::now(),
        }
    }

    pub fn remote_ip(&self) -> &str {
        &self.remote_ip
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_admitted(&self) -> bool {
        self.admission.is_some()
    }

    /// Password attempts seen so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Record, stall, reject. The record is appended before the stall so it
    /// survives the client hanging up mid-wait.
    ///
    /// A session without an admission (refused, or already closed) is
    /// rejected at once: nothing is captured and nothing sleeps.
    async fn stall(&mut self, username: &str, password: &str) -> Rejected {
        if self.admission.is_none() {
            tracing::debug!("AUTH {} on a closed session, rejecting", self.remote_ip);
            self.state = SessionState::Closed;
            return Rejected;
        }

        self.attempts += 1;
        self.state = SessionState::AuthStall;

        if !username.is_empty() && !password.is_empty() {
            self.buffer
                .append(CredentialRecord::now(&self.remote_ip, username, password));
        }
        tracing::debug!(
            "AUTH {} attempt {} user {:?}, stalling {:?}",
            self.remote_ip,
            self.attempts,
            username,
            self.stall_delay
        );

        tokio::time::sleep(self.stall_delay).await;

        self.state = SessionState::Rejected;
        Rejected
    }
}

impl ConnectionObserver for TarpitSession {
    fn connection_made(&mut self) -> bool {
        match self.gate.admit(&self.remote_ip) {
            Some(admission) => {
                self.admission = Some(admission);
                self.state = SessionState::Connected;
                true
            }
            None => {
                self.state = SessionState::Closed;
                false
            }
        }
    }

    fn connection_lost(&mut self) {
        // Only an admitted connection holds a slot, and take() makes a
        // second call a no-op.
        if let Some(admission) = self.admission.take() {
            admission.release();
        }
        self.state = SessionState::Closed;
    }
}

impl PasswordAuthenticator for TarpitSession {
    fn supported_methods(&self) -> AuthMethods {
        Self::METHODS
    }

    async fn validate_password(&mut self, username: &str, password: &str) -> Rejected {
        self.stall(username, password).await
    }

    async fn change_password(
        &mut self,
        username: &str,
        _old_password: &str,
        new_password: &str,
    ) -> Rejected {
        self.stall(username, new_password).await
    }
}

impl Drop for TarpitSession {
    fn drop(&mut self) {
        self.connection_lost();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STALL: Duration = Duration::from_secs(10);

    fn session(gate: &ConnectionGate, buffer: &CredentialBuffer) -> TarpitSession {
        TarpitSession::new(
            "198.51.100.23:40022".parse().unwrap(),
            gate.clone(),
            buffer.clone(),
            STALL,
        )
    }

    #[test]
    fn advertises_password_only() {
        let s = session(&ConnectionGate::new(1), &CredentialBuffer::new());
        assert_eq!(
            s.supported_methods(),
            AuthMethods {
                password: true,
                public_key: false,
                keyboard_interactive: false,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn password_attempt_is_captured_then_stalled_then_rejected() {
        let gate = ConnectionGate::new(5);
        let buffer = CredentialBuffer::new();
        let mut s = session(&gate, &buffer);
        assert!(s.connection_made());

        let started = tokio::time::Instant::now();
        let outcome = s.validate_password("root", "toor").await;

        assert_eq!(outcome, Rejected);
        assert!(started.elapsed() >= STALL);
        assert_eq!(s.state(), SessionState::Rejected);
        assert_eq!(s.attempts(), 1);

        let records = buffer.take();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].remote_address, "198.51.100.23");
        assert_eq!(records[0].username, "root");
        assert_eq!(records[0].password, "toor");
    }

    #[tokio::test(start_paused = true)]
    async fn record_lands_before_the_stall_ends() {
        let gate = ConnectionGate::new(5);
        let buffer = CredentialBuffer::new();
        let mut s = session(&gate, &buffer);
        assert!(s.connection_made());

        let attempt = tokio::spawn(async move {
            s.validate_password("admin", "admin").await;
            s
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(buffer.len(), 1);
        assert!(!attempt.is_finished());

        // Hanging up mid-stall keeps the capture and frees the slot.
        attempt.abort();
        assert!(attempt.await.unwrap_err().is_cancelled());
        assert_eq!(buffer.len(), 1);
        assert_eq!(gate.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_credentials_are_stalled_but_not_recorded() {
        let gate = ConnectionGate::new(5);
        let buffer = CredentialBuffer::new();
        let mut s = session(&gate, &buffer);
        assert!(s.connection_made());

        let started = tokio::time::Instant::now();
        assert_eq!(s.validate_password("root", "").await, Rejected);
        assert_eq!(s.validate_password("", "hunter2").await, Rejected);
        assert!(started.elapsed() >= STALL * 2);
        assert!(buffer.is_empty());
        assert_eq!(s.attempts(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn change_password_captures_the_new_password() {
        let gate = ConnectionGate::new(5);
        let buffer = CredentialBuffer::new();
        let mut s = session(&gate, &buffer);
        assert!(s.connection_made());

        let started = tokio::time::Instant::now();
        assert_eq!(s.change_password("oracle", "old", "n3w").await, Rejected);
        assert!(started.elapsed() >= STALL);

        let records = buffer.take();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].username, "oracle");
        assert_eq!(records[0].password, "n3w");
    }

    #[tokio::test(start_paused = true)]
    async fn refused_session_neither_captures_nor_stalls() {
        let gate = ConnectionGate::new(0);
        let buffer = CredentialBuffer::new();
        let mut s = session(&gate, &buffer);
        assert!(!s.connection_made());
        assert_eq!(s.state(), SessionState::Closed);

        let started = tokio::time::Instant::now();
        assert_eq!(s.validate_password("root", "toor").await, Rejected);
        assert_eq!(s.change_password("root", "toor", "n3w").await, Rejected);

        assert_eq!(started.elapsed(), Duration::ZERO);
        assert!(buffer.is_empty());
        assert_eq!(s.state(), SessionState::Closed);
        assert_eq!(s.attempts(), 0);
        assert_eq!(gate.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_session_stays_closed() {
        let gate = ConnectionGate::new(1);
        let buffer = CredentialBuffer::new();
        let mut s = session(&gate, &buffer);
        assert!(s.connection_made());
        s.connection_lost();

        let started = tokio::time::Instant::now();
        assert_eq!(s.validate_password("admin", "admin").await, Rejected);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(s.state(), SessionState::Closed);
        assert!(buffer.is_empty());
    }

    #[test]
    fn rejected_connection_never_releases() {
        let gate = ConnectionGate::new(1);
        let buffer = CredentialBuffer::new();

        let mut a = session(&gate, &buffer);
        assert!(a.connection_made());

        let mut b = session(&gate, &buffer);
        assert!(!b.connection_made());
        assert_eq!(b.state(), SessionState::Closed);
        b.connection_lost();
        drop(b);
        assert_eq!(gate.active(), 1, "B must not free A's slot");

        a.connection_lost();
        a.connection_lost();
        assert_eq!(gate.active(), 0);
        drop(a);
        assert_eq!(gate.active(), 0);

        let mut c = session(&gate, &buffer);
        assert!(c.connection_made());
        assert!(c.is_admitted());
        assert_eq!(gate.active(), 1);
    }
}
