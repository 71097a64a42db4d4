//! Per-stream session state machine.

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::audio::AudioFormat;
use crate::error::{Error, Result};

/// Session lifecycle. `Stopped` and `Error` are terminal; a fatal fault
/// requires a new session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Playing,
    Paused,
    Stopped,
    Error,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Stopped | SessionState::Error)
    }

    fn can_transition_to(self, to: SessionState) -> bool {
        use SessionState::*;
        match (self, to) {
            // Error is reachable from any non-terminal state.
            (Idle | Playing | Paused, Error) => true,
            (Idle, Playing) | (Idle, Stopped) => true,
            (Playing, Paused) | (Playing, Stopped) => true,
            (Paused, Playing) | (Paused, Stopped) => true,
            _ => false,
        }
    }
}

/// One playback session: identity, negotiated format, render progress.
#[derive(Debug, Clone)]
pub struct StreamSession {
    pub id: Uuid,
    pub state: SessionState,
    pub format: AudioFormat,
    pub audio_position_ms: f64,
    pub chunks_rendered: u64,
    pub bytes_rendered: u64,
    pub underruns: u64,
    pub chunks_dropped: u64,
}

impl StreamSession {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            id: Uuid::new_v4(),
            state: SessionState::Idle,
            format,
            audio_position_ms: 0.0,
            chunks_rendered: 0,
            bytes_rendered: 0,
            underruns: 0,
            chunks_dropped: 0,
        }
    }

    /// Apply a validated state transition.
    pub fn transition(&mut self, to: SessionState) -> Result<SessionState> {
        let from = self.state;
        if from == to {
            return Ok(from);
        }
        if !from.can_transition_to(to) {
            return Err(Error::Session(format!(
                "invalid transition {from:?} -> {to:?} for session {}",
                self.id
            )));
        }
        debug!(session = %self.id, ?from, ?to, "session transition");
        self.state = to;
        Ok(from)
    }
}
