//! Typed message protocol between producers, the daemon, and subscribers.

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use super::session::SessionState;
use crate::adaptive::BufferConfig;
use crate::audio::{AudioChunk, AudioFormat};

/// Client → daemon control verbs.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlAction {
    Play,
    Pause,
    Resume,
    Stop,
    /// Atomically swap the active buffer configuration.
    Configure(BufferConfig),
}

/// Inbound daemon messages. All intake goes through
/// [`DaemonHandle::send`](super::DaemonHandle::send).
#[derive(Debug)]
pub enum DaemonMessage {
    /// Producer → daemon chunk delivery.
    Chunk(AudioChunk),
    Control(ControlAction),
    /// Producer-side liveness ping.
    Heartbeat,
    /// Status request with a reply channel.
    Status(oneshot::Sender<StatusReport>),
}

/// Render-side counters surfaced in status reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerformanceCounters {
    pub chunks_rendered: u64,
    pub bytes_rendered: u64,
    pub underruns: u64,
    pub chunks_dropped: u64,
}

/// Daemon → client status snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub session_id: Uuid,
    pub state: SessionState,
    /// Ring fill level in [0, 1].
    pub buffer_utilization: f64,
    pub audio_position_ms: f64,
    pub performance: PerformanceCounters,
}

/// Outbound event payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StatusEventKind {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    Status(StatusReport),
    Heartbeat,
    /// Playback starved while the session was playing.
    Underrun {
        total: u64,
    },
    /// Drop-oldest eviction produced a sequence gap.
    ChunksDropped {
        evicted_sequences: Vec<u64>,
    },
    /// Delivered chunk did not match the negotiated format. The chunk is
    /// still enqueued; this is advisory.
    FormatMismatch {
        negotiated: AudioFormat,
        received: AudioFormat,
    },
}

/// Event envelope emitted on the daemon's broadcast channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub session_id: Uuid,
    /// Milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub kind: StatusEventKind,
}

impl StatusEvent {
    pub fn now(session_id: Uuid, kind: StatusEventKind) -> Self {
        let timestamp_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            session_id,
            timestamp_ms,
            kind,
        }
    }
}
