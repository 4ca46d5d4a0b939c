//! Connection lifecycle state machine.
//!
//! ```text
//!             ┌──────────────────────────────────────────────────┐
//!             │                                                  ▼
//! Unpaired ─► Connecting ─► Handshaking ─► Authenticating ─► Connected
//!                 ▲               │               │              │
//!                 │               ▼               ▼              ▼
//!           Reconnecting ◄──────────────── Disconnected ◄────────┘
//!
//! any state ─► Destroyed (absorbing)
//! ```

use crate::error::StateError;
use std::fmt;
use std::time::Instant;
use tokio::sync::watch;

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Constructed, never connected
    Unpaired,
    /// Opening the transport
    Connecting,
    /// Transport open, Noise handshake in progress
    Handshaking,
    /// Handshake done, login or registration in progress
    Authenticating,
    /// Authenticated, application traffic flowing
    Connected,
    /// Transport closed
    Disconnected,
    /// Waiting out the backoff delay before the next attempt
    Reconnecting,
    /// Shut down for good; accepts no transitions
    Destroyed,
}

impl ConnectionState {
    /// Check if a state transition is valid
    #[must_use]
    pub fn can_transition(self, to: ConnectionState) -> bool {
        use ConnectionState::*;

        match (self, to) {
            // Nothing leaves Destroyed
            (Destroyed, _) => false,
            (_, Destroyed) => true,

            (Unpaired | Disconnected | Reconnecting, Connecting) => true,

            (Connecting, Handshaking | Disconnected) => true,
            (Handshaking, Authenticating | Disconnected) => true,
            (Authenticating, Connected | Disconnected) => true,
            (Connected, Disconnected) => true,

            (Disconnected, Reconnecting) => true,

            // All other transitions invalid
            _ => false,
        }
    }

    /// Whether the transport is open (handshake, auth or connected).
    #[must_use]
    pub fn is_open(self) -> bool {
        matches!(
            self,
            Self::Handshaking | Self::Authenticating | Self::Connected
        )
    }

    /// Whether this is [`ConnectionState::Destroyed`].
    #[must_use]
    pub fn is_terminal(self) -> bool {
        self == Self::Destroyed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unpaired => "unpaired",
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Authenticating => "authenticating",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Reconnecting => "reconnecting",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Shared, observable connection state.
///
/// Check-and-set happens under the watch channel's lock, so concurrent
/// tasks cannot both win a race out of the same state.
#[derive(Debug)]
pub struct StateMachine {
    tx: watch::Sender<ConnectionState>,
    entered_at: std::sync::Mutex<Instant>,
}

impl StateMachine {
    /// Create a machine in [`ConnectionState::Unpaired`].
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Unpaired);
        Self {
            tx,
            entered_at: std::sync::Mutex::new(Instant::now()),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Receiver that observes every committed transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Time spent in the current state.
    #[must_use]
    pub fn time_in_state(&self) -> std::time::Duration {
        self.entered_at
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    /// Transition to a new state, returning the previous one.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::InvalidTransition`] if the transition is not
    /// allowed from the current state.
    pub fn transition_to(&self, to: ConnectionState) -> Result<ConnectionState, StateError> {
        let mut outcome = Err(StateError::InvalidTransition { from: to, to });
        self.tx.send_if_modified(|state| {
            let from = *state;
            if from.can_transition(to) {
                *state = to;
                outcome = Ok(from);
                true
            } else {
                outcome = Err(StateError::InvalidTransition { from, to });
                false
            }
        });

        let from = outcome?;
        if let Ok(mut at) = self.entered_at.lock() {
            *at = Instant::now();
        }
        tracing::debug!("Connection state transition: {} -> {}", from, to);
        Ok(from)
    }

    /// Enter [`ConnectionState::Destroyed`].
    ///
    /// Returns `false` if the machine was already destroyed.
    pub fn destroy(&self) -> bool {
        self.transition_to(ConnectionState::Destroyed).is_ok()
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}
