//! Streaming daemon: one long-lived task per process owning the ring
//! buffer and audio sink for the active session.
//!
//! Producers and controllers talk to it through [`DaemonHandle`], which is
//! cheap to clone; a second producer attaches to the existing daemon
//! instead of spawning a competitor. Outbound status flows on a broadcast
//! channel that each subscriber consumes as a lazy stream.

mod message;
mod session;

pub use message::{
    ControlAction, DaemonMessage, PerformanceCounters, StatusEvent, StatusEventKind, StatusReport,
};
pub use session::{SessionState, StreamSession};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info, warn};

use crate::adaptive::BufferConfig;
use crate::audio::{AudioChunk, AudioFormat, AudioSink, OverflowPolicy, PushOutcome, RingBuffer};
use crate::error::{Error, Result};

/// Daemon construction parameters.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub heartbeat_interval: Duration,
    pub ring_capacity_bytes: usize,
    pub overflow_policy: OverflowPolicy,
    /// Capacity of the outbound broadcast channel.
    pub event_capacity: usize,
    pub initial_buffer: BufferConfig,
    /// Sleep for each chunk's playback duration while rendering. Disabled
    /// in tests that drive virtual time.
    pub pace_playback: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            ring_capacity_bytes: 96_000,
            overflow_policy: OverflowPolicy::Backpressure,
            event_capacity: 256,
            initial_buffer: BufferConfig::for_target(300, 100, AudioFormat::default()),
            pace_playback: true,
        }
    }
}

struct DaemonShared {
    session: Mutex<StreamSession>,
    events: broadcast::Sender<StatusEvent>,
    state_tx: watch::Sender<SessionState>,
    ring: Arc<RingBuffer>,
}

impl DaemonShared {
    fn session_id(&self) -> uuid::Uuid {
        self.session.lock().expect("session lock poisoned").id
    }

    fn state(&self) -> SessionState {
        self.session.lock().expect("session lock poisoned").state
    }

    fn emit(&self, kind: StatusEventKind) {
        let _ = self.events.send(StatusEvent::now(self.session_id(), kind));
    }

    /// Validated transition plus event emission and render-task wakeup.
    /// Every transition carries a full status report so subscribers see
    /// position and counters at the moment of the change.
    fn transition(&self, to: SessionState) -> Result<()> {
        let from = {
            let mut session = self.session.lock().expect("session lock poisoned");
            session.transition(to)?
        };
        if from != to {
            self.emit(StatusEventKind::StateChanged { from, to });
            self.emit(StatusEventKind::Status(self.report()));
            let _ = self.state_tx.send(to);
        }
        Ok(())
    }

    fn report(&self) -> StatusReport {
        let session = self.session.lock().expect("session lock poisoned");
        StatusReport {
            session_id: session.id,
            state: session.state,
            buffer_utilization: self.ring.utilization(),
            audio_position_ms: session.audio_position_ms,
            performance: PerformanceCounters {
                chunks_rendered: session.chunks_rendered,
                bytes_rendered: session.bytes_rendered,
                underruns: session.underruns,
                chunks_dropped: session.chunks_dropped,
            },
        }
    }
}

/// Cloneable handle onto the daemon. All inbound traffic goes through
/// [`send`](Self::send); convenience methods wrap the message kinds.
#[derive(Clone)]
pub struct DaemonHandle {
    msg_tx: mpsc::Sender<DaemonMessage>,
    ring: Arc<RingBuffer>,
    shared: Arc<DaemonShared>,
    buffer_config: watch::Receiver<BufferConfig>,
}

impl DaemonHandle {
    /// Single intake function: chunk delivery goes straight to the ring
    /// (so backpressure lands on the producer, not on control traffic),
    /// everything else is queued to the daemon task.
    pub async fn send(&self, message: DaemonMessage) -> Result<()> {
        match message {
            DaemonMessage::Chunk(chunk) => self.deliver_chunk(chunk).await,
            other => self
                .msg_tx
                .send(other)
                .await
                .map_err(|_| Error::DaemonUnavailable("daemon task exited".into())),
        }
    }

    /// Deliver one chunk. A format mismatch against the negotiated session
    /// format is a warning, not a rejection: the chunk still plays rather
    /// than starving the sink.
    pub async fn deliver_chunk(&self, chunk: AudioChunk) -> Result<()> {
        let negotiated = {
            let session = self.shared.session.lock().expect("session lock poisoned");
            if session.state.is_terminal() {
                return Err(Error::Session(format!(
                    "session {} is {:?}, start a new session",
                    session.id, session.state
                )));
            }
            session.format
        };

        if chunk.format != negotiated {
            warn!(
                sequence = chunk.sequence,
                ?negotiated,
                received = ?chunk.format,
                "chunk format mismatch, enqueuing anyway"
            );
            self.shared.emit(StatusEventKind::FormatMismatch {
                negotiated,
                received: chunk.format,
            });
        }

        // First chunk starts playback.
        if self.shared.state() == SessionState::Idle {
            self.shared.transition(SessionState::Playing)?;
        }

        match self.ring.push(chunk).await? {
            PushOutcome::Stored => {}
            PushOutcome::DroppedOldest { evicted_sequences } => {
                {
                    let mut session =
                        self.shared.session.lock().expect("session lock poisoned");
                    session.chunks_dropped += evicted_sequences.len() as u64;
                }
                self.shared
                    .emit(StatusEventKind::ChunksDropped { evicted_sequences });
            }
        }
        Ok(())
    }

    pub async fn control(&self, action: ControlAction) -> Result<()> {
        self.send(DaemonMessage::Control(action)).await
    }

    pub async fn heartbeat(&self) -> Result<()> {
        self.send(DaemonMessage::Heartbeat).await
    }

    pub async fn status(&self) -> Result<StatusReport> {
        let (tx, rx) = oneshot::channel();
        self.send(DaemonMessage::Status(tx)).await?;
        rx.await
            .map_err(|_| Error::DaemonUnavailable("daemon dropped status reply".into()))
    }

    /// Lazy per-subscriber event sequence.
    pub fn subscribe(&self) -> BroadcastStream<StatusEvent> {
        BroadcastStream::new(self.events())
    }

    pub fn events(&self) -> broadcast::Receiver<StatusEvent> {
        self.shared.events.subscribe()
    }

    /// Live buffer configuration; the borrowed value is always a complete
    /// config, replaced atomically by `Configure`.
    pub fn buffer_config(&self) -> watch::Receiver<BufferConfig> {
        self.buffer_config.clone()
    }

    pub fn session_id(&self) -> uuid::Uuid {
        self.shared.session_id()
    }

    pub fn session_state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn negotiated_format(&self) -> AudioFormat {
        self.shared
            .session
            .lock()
            .expect("session lock poisoned")
            .format
    }

    pub fn buffer_utilization(&self) -> f64 {
        self.ring.utilization()
    }
}

/// The daemon itself. [`spawn`](Self::spawn) is called exactly once per
/// process; everything after that goes through handles.
pub struct StreamingDaemon;

impl StreamingDaemon {
    pub fn spawn(
        config: DaemonConfig,
        format: AudioFormat,
        sink: Box<dyn AudioSink>,
        abort: watch::Receiver<bool>,
    ) -> DaemonHandle {
        let session = StreamSession::new(format);
        info!(session = %session.id, ?format, "starting streaming daemon");

        let (events, _) = broadcast::channel(config.event_capacity);
        let (state_tx, state_rx) = watch::channel(session.state);
        let ring = Arc::new(RingBuffer::new(
            config.ring_capacity_bytes,
            config.overflow_policy,
        ));
        let shared = Arc::new(DaemonShared {
            session: Mutex::new(session),
            events,
            state_tx,
            ring: Arc::clone(&ring),
        });
        let (config_tx, config_rx) = watch::channel(config.initial_buffer.clone());
        let (msg_tx, msg_rx) = mpsc::channel(32);

        tokio::spawn(control_loop(
            config.clone(),
            Arc::clone(&shared),
            Arc::clone(&ring),
            msg_rx,
            config_tx,
            abort,
        ));
        tokio::spawn(render_loop(
            Arc::clone(&shared),
            Arc::clone(&ring),
            state_rx,
            sink,
            config.pace_playback,
        ));

        DaemonHandle {
            msg_tx,
            ring,
            shared,
            buffer_config: config_rx,
        }
    }
}

async fn control_loop(
    config: DaemonConfig,
    shared: Arc<DaemonShared>,
    ring: Arc<RingBuffer>,
    mut msg_rx: mpsc::Receiver<DaemonMessage>,
    config_tx: watch::Sender<BufferConfig>,
    mut abort: watch::Receiver<bool>,
) {
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick completes immediately.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            msg = msg_rx.recv() => match msg {
                None => {
                    debug!("all daemon handles dropped, shutting down");
                    ring.close();
                    break;
                }
                Some(DaemonMessage::Control(action)) => {
                    handle_control(&shared, &ring, &config_tx, action);
                }
                Some(DaemonMessage::Heartbeat) => {
                    debug!("producer heartbeat received");
                }
                Some(DaemonMessage::Status(reply)) => {
                    let _ = reply.send(shared.report());
                }
                Some(DaemonMessage::Chunk(chunk)) => {
                    // Normal delivery short-circuits in DaemonHandle::send;
                    // this path serves callers holding only the raw channel
                    // and must never stall heartbeats, so a full ring is a
                    // dropped chunk rather than a wait.
                    let sequence = chunk.sequence;
                    match ring.try_push(chunk) {
                        Ok(PushOutcome::Stored) => {}
                        Ok(PushOutcome::DroppedOldest { evicted_sequences }) => {
                            {
                                let mut session =
                                    shared.session.lock().expect("session lock poisoned");
                                session.chunks_dropped += evicted_sequences.len() as u64;
                            }
                            shared.emit(StatusEventKind::ChunksDropped { evicted_sequences });
                        }
                        Err(e) => {
                            warn!(sequence, error = %e, "raw-channel chunk not enqueued");
                        }
                    }
                }
            },
            _ = heartbeat.tick() => {
                shared.emit(StatusEventKind::Heartbeat);
                shared.emit(StatusEventKind::Status(shared.report()));
            }
            changed = abort.changed() => {
                if changed.is_err() || *abort.borrow() {
                    info!("abort signal received, stopping session");
                    if let Err(e) = shared.transition(SessionState::Stopped) {
                        debug!(error = %e, "session already terminal on abort");
                    }
                    ring.close();
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

fn handle_control(
    shared: &DaemonShared,
    ring: &RingBuffer,
    config_tx: &watch::Sender<BufferConfig>,
    action: ControlAction,
) {
    let result = match action {
        ControlAction::Play | ControlAction::Resume => shared.transition(SessionState::Playing),
        ControlAction::Pause => shared.transition(SessionState::Paused),
        ControlAction::Stop => {
            let r = shared.transition(SessionState::Stopped);
            ring.close();
            r
        }
        ControlAction::Configure(new_config) => {
            debug!(
                target_ms = new_config.target_buffer_ms,
                chunk_bytes = new_config.chunk_size_bytes,
                "buffer configuration swapped"
            );
            let _ = config_tx.send(new_config);
            Ok(())
        }
    };
    // A rejected control is recoverable: log and keep serving.
    if let Err(e) = result {
        warn!(error = %e, "control action rejected");
    }
}

async fn render_loop(
    shared: Arc<DaemonShared>,
    ring: Arc<RingBuffer>,
    mut state_rx: watch::Receiver<SessionState>,
    mut sink: Box<dyn AudioSink>,
    pace_playback: bool,
) {
    // Popped but not yet rendered; survives a pause observed in between.
    let mut pending: Option<AudioChunk> = None;
    loop {
        let state = *state_rx.borrow();
        match state {
            SessionState::Paused => {
                if state_rx.changed().await.is_err() {
                    break;
                }
            }
            SessionState::Error => break,
            SessionState::Idle | SessionState::Playing | SessionState::Stopped => {
                if let Some(chunk) = pending.take() {
                    if !render_chunk(&shared, &mut sink, &chunk) {
                        break;
                    }
                    if pace_playback {
                        tokio::time::sleep(Duration::from_secs_f64(
                            chunk.duration_ms() / 1000.0,
                        ))
                        .await;
                    }
                    continue;
                }

                // Starvation while playing is an underrun, surfaced rather
                // than silently waited out.
                if state == SessionState::Playing && ring.is_empty() && !ring.is_closed() {
                    let total = {
                        let mut session =
                            shared.session.lock().expect("session lock poisoned");
                        if session.chunks_rendered == 0 {
                            None
                        } else {
                            session.underruns += 1;
                            Some(session.underruns)
                        }
                    };
                    if let Some(total) = total {
                        warn!(total, "playback underrun, buffer empty");
                        shared.emit(StatusEventKind::Underrun { total });
                    }
                }

                tokio::select! {
                    chunk = ring.pop() => match chunk {
                        // Held until the state is re-checked, so a pause
                        // racing the pop cannot slip one more chunk through.
                        Some(chunk) => pending = Some(chunk),
                        None => {
                            // Ring closed and drained: flush and finish.
                            if let Err(e) = sink.flush() {
                                warn!(error = %e, "sink flush failed at end of stream");
                            }
                            if let Err(e) = shared.transition(SessionState::Stopped) {
                                debug!(error = %e, "session already terminal at drain");
                            }
                            break;
                        }
                    },
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        // Re-evaluate pause/stop before the next pop.
                    }
                }
            }
        }
    }
    debug!("render loop exited");
}

/// Write one chunk; returns false when the session must end.
fn render_chunk(shared: &DaemonShared, sink: &mut Box<dyn AudioSink>, chunk: &AudioChunk) -> bool {
    match sink.write_chunk(chunk) {
        Ok(()) => {
            let first = {
                let mut session = shared.session.lock().expect("session lock poisoned");
                session.chunks_rendered += 1;
                session.bytes_rendered += chunk.size_bytes() as u64;
                session.audio_position_ms += chunk.duration_ms();
                session.chunks_rendered == 1
            };
            if first {
                // Lets subscribers measure time-to-first-audio.
                shared.emit(StatusEventKind::Status(shared.report()));
            }
            true
        }
        Err(e) => {
            // Unusable sink is fatal for the session.
            error!(sequence = chunk.sequence, error = %e, "sink write failed, session error");
            if let Err(te) = shared.transition(SessionState::Error) {
                debug!(error = %te, "session already terminal on sink failure");
            }
            false
        }
    }
}

/// Client-side liveness tracking over the daemon's heartbeat events.
///
/// Passive: callers record beats as they observe them and poll
/// [`is_healthy`](Self::is_healthy). N consecutive missed intervals mean
/// the daemon is presumed gone and the client should reconnect through
/// its retry executor.
pub struct HeartbeatMonitor {
    interval: Duration,
    miss_threshold: u32,
    last_beat: Mutex<Instant>,
}

impl HeartbeatMonitor {
    pub const DEFAULT_MISS_THRESHOLD: u32 = 3;

    pub fn new(interval: Duration, miss_threshold: u32) -> Self {
        Self {
            interval,
            miss_threshold,
            last_beat: Mutex::new(Instant::now()),
        }
    }

    pub fn record_beat(&self) {
        *self.last_beat.lock().expect("monitor lock poisoned") = Instant::now();
    }

    /// Whole heartbeat intervals elapsed since the last beat.
    pub fn missed(&self) -> u32 {
        let last = *self.last_beat.lock().expect("monitor lock poisoned");
        (last.elapsed().as_millis() / self.interval.as_millis().max(1)) as u32
    }

    pub fn is_healthy(&self) -> bool {
        self.missed() < self.miss_threshold
    }
}
