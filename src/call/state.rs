//! Call state machine and the status snapshot shared with the UI.
//!
//! [`CallStatus`] is the single source of truth for everything the window
//! shows.  The controller writes it; the egui update loop reads it each frame
//! through [`SharedStatus`].

use std::sync::{Arc, Mutex, MutexGuard};

use crate::signaling::PeerId;
use crate::transport::ConnectionState;

// ---------------------------------------------------------------------------
// CallState
// ---------------------------------------------------------------------------

/// ```text
/// Idle ──start_call──▶ Starting ──answer──▶ InCall ──disconnect──▶ Disconnecting ──▶ Idle
/// Idle ──inbound offer──▶ Starting ──answer sent──▶ InCall
/// any ──unrecoverable failure──▶ Idle
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CallState {
    #[default]
    Idle,
    Starting,
    InCall,
    Disconnecting,
}

impl CallState {
    pub fn label(&self) -> &'static str {
        match self {
            CallState::Idle => "Idle",
            CallState::Starting => "Calling…",
            CallState::InCall => "In call",
            CallState::Disconnecting => "Hanging up",
        }
    }
}

// ---------------------------------------------------------------------------
// Alert
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertKind {
    Auth,
    Device,
    /// The signaling connection gave up reconnecting.
    Connection,
}

/// A failure the user must acknowledge before it is cleared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
}

impl Alert {
    pub fn title(&self) -> &'static str {
        match self.kind {
            AlertKind::Auth => "Not signed in",
            AlertKind::Device => "Microphone unavailable",
            AlertKind::Connection => "Connection lost",
        }
    }
}

// ---------------------------------------------------------------------------
// CallStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Counters {
    pub frames_produced: u64,
    pub frames_sent: u64,
    pub frames_muted: u64,
    pub frames_decoded: u64,
    pub frames_dropped: u64,
    pub track_frames: u64,
}

#[derive(Debug, Clone, Default)]
pub struct CallStatus {
    pub call: CallState,
    pub connection: ConnectionState,
    pub muted: bool,
    pub local_peer: String,
    /// The peer of the current call attempt, cleared on disconnect.
    pub remote_peer: Option<String>,
    pub alert: Option<Alert>,
    /// Last recovered error, shown in the status line.
    pub last_error: Option<String>,
    pub counters: Counters,
}

impl CallStatus {
    pub fn new(local_peer: &PeerId) -> Self {
        Self {
            local_peer: local_peer.to_string(),
            ..Self::default()
        }
    }

    pub fn can_start_call(&self) -> bool {
        self.call == CallState::Idle && self.connection.is_open()
    }
}

/// Thread-safe handle to [`CallStatus`].  Do not hold the lock across `.await`.
pub type SharedStatus = Arc<Mutex<CallStatus>>;

pub fn new_shared_status(local_peer: &PeerId) -> SharedStatus {
    Arc::new(Mutex::new(CallStatus::new(local_peer)))
}

/// Lock `status`, recovering the data if a previous holder panicked.
pub fn lock_status(status: &SharedStatus) -> MutexGuard<'_, CallStatus> {
    status.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
