//! Per-connection session state.

use crate::router::MemberId;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Initial state, waiting for HELLO.
    Connected,
    /// Handshake complete, joined a cluster.
    Ready,
    /// Session is closing.
    Closing,
}

/// A connected client.
pub struct Session {
    /// Unique session ID, returned in WELCOME.
    pub id: String,

    /// Remote address.
    pub remote_addr: SocketAddr,

    state: SessionState,

    /// Cluster joined in HELLO.
    cluster: Option<String>,

    /// Client name from HELLO.
    client_name: Option<String>,

    /// Registry handle once joined.
    member: Option<MemberId>,

    requests_sent: u64,
    replies_sent: u64,

    created_at: Instant,
    last_activity: Instant,
}

impl Session {
    pub fn new(remote_addr: SocketAddr) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            remote_addr,
            state: SessionState::Connected,
            cluster: None,
            client_name: None,
            member: None,
            requests_sent: 0,
            replies_sent: 0,
            created_at: Instant::now(),
            last_activity: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    /// Completes the handshake and records the registry handle.
    pub fn complete_handshake(
        &mut self,
        cluster: String,
        client_name: Option<String>,
        member: MemberId,
    ) {
        self.cluster = Some(cluster);
        self.client_name = client_name;
        self.member = Some(member);
        self.state = SessionState::Ready;
    }

    pub fn cluster(&self) -> Option<&str> {
        self.cluster.as_deref()
    }

    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    pub fn member(&self) -> Option<MemberId> {
        self.member
    }

    /// Marks the session as active.
    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    pub fn record_request(&mut self) {
        self.requests_sent += 1;
    }

    pub fn record_reply(&mut self) {
        self.replies_sent += 1;
    }

    pub fn requests_sent(&self) -> u64 {
        self.requests_sent
    }

    pub fn replies_sent(&self) -> u64 {
        self.replies_sent
    }

    /// Returns the time since last activity.
    pub fn idle_duration(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Returns the session age.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}
