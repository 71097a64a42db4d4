//! Producer/consumer orchestration over the daemon channel.
//!
//! The producer fetches synthesis segments through the retry executor and
//! slices them into chunks sized by the live buffer config; the telemetry
//! task watches the daemon's event stream, feeds the adaptive controller,
//! and drives reconnect probes when heartbeats go missing. The two sides
//! share nothing but the ring (via the daemon handle) and the abort
//! signal.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::synth::{split_segments, SynthesisClient};
use crate::adaptive::{AdaptiveBufferController, PlaybackMetrics};
use crate::audio::AudioChunk;
use crate::daemon::{
    ControlAction, DaemonHandle, HeartbeatMonitor, SessionState, StatusEventKind, StatusReport,
};
use crate::error::{Error, Result};
use crate::retry::{CircuitBreaker, RetryExecutor};

/// Minimum segment length before sentence fragments are merged forward.
const MIN_SEGMENT_CHARS: usize = 8;

/// Source of synthesized audio for one text segment. The HTTP client is
/// the production implementation; tests script their own.
#[async_trait]
pub trait SegmentSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> Result<Bytes>;
}

#[async_trait]
impl SegmentSynthesizer for SynthesisClient {
    async fn synthesize(&self, text: &str) -> Result<Bytes> {
        SynthesisClient::synthesize(self, text).await
    }
}

/// A playback request.
#[derive(Debug, Clone)]
pub struct SpeakRequest {
    pub text: String,
}

/// What a completed (or aborted) stream delivered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamSummary {
    pub chunks_delivered: u64,
    pub bytes_delivered: u64,
    pub time_to_first_audio_ms: Option<f64>,
    pub underruns: u64,
}

/// Wires the synthesis producer and telemetry consumer to one daemon.
pub struct Orchestrator<S: SegmentSynthesizer> {
    synthesizer: S,
    daemon: DaemonHandle,
    executor: Arc<RetryExecutor>,
    /// Daemon liveness probes run on their own breaker; a probe success
    /// must not reset the synthesis target's failure count.
    probe_executor: Arc<RetryExecutor>,
    controller: Arc<Mutex<AdaptiveBufferController>>,
    monitor: Arc<HeartbeatMonitor>,
    abort_tx: watch::Sender<bool>,
    control_window: Duration,
}

impl<S: SegmentSynthesizer> Orchestrator<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        synthesizer: S,
        daemon: DaemonHandle,
        executor: Arc<RetryExecutor>,
        controller: AdaptiveBufferController,
        monitor: Arc<HeartbeatMonitor>,
        abort_tx: watch::Sender<bool>,
        control_window: Duration,
    ) -> Self {
        let probe_executor = Arc::new(
            RetryExecutor::new(
                executor.policy().clone(),
                Arc::new(CircuitBreaker::new("daemon")),
            )
            .with_abort(abort_tx.subscribe()),
        );
        Self {
            synthesizer,
            daemon,
            executor,
            probe_executor,
            controller: Arc::new(Mutex::new(controller)),
            monitor,
            abort_tx,
            control_window,
        }
    }

    pub fn daemon(&self) -> &DaemonHandle {
        &self.daemon
    }

    /// Signal every suspension point to wind down: network reads stop,
    /// retry sleeps cancel, the daemon flushes and stops the session.
    pub fn abort(&self) {
        let _ = self.abort_tx.send(true);
    }

    pub fn is_healthy(&self) -> bool {
        self.monitor.is_healthy()
    }

    pub async fn pause(&self) -> Result<()> {
        self.daemon.control(ControlAction::Pause).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.daemon.control(ControlAction::Resume).await
    }

    pub async fn stop(&self) -> Result<()> {
        self.daemon.control(ControlAction::Stop).await
    }

    pub async fn status(&self) -> Result<StatusReport> {
        self.daemon.status().await
    }

    /// Stream one request end to end. Transient upstream failures are
    /// absorbed by the executor; a persistent failure (or an open
    /// circuit) stops the session and surfaces here.
    pub async fn run(&self, request: SpeakRequest) -> Result<StreamSummary> {
        let started = Instant::now();
        let abort_rx = self.abort_tx.subscribe();

        // Subscribe before producing so the first-render event is not missed.
        let events = self.daemon.events();
        let telemetry = tokio::spawn(telemetry_loop(
            self.daemon.clone(),
            events,
            Arc::clone(&self.controller),
            Arc::clone(&self.monitor),
            Arc::clone(&self.probe_executor),
            self.abort_tx.subscribe(),
            self.control_window,
            started,
        ));

        let produced = self.produce(&request, &abort_rx).await;

        // End of stream (or failure): flush what is buffered and stop.
        if let Err(e) = self.daemon.control(ControlAction::Stop).await {
            debug!(error = %e, "daemon already gone at stop");
        }

        let ttfa = telemetry.await.unwrap_or_default();
        let (chunks_delivered, bytes_delivered) = produced?;

        // The render side drains the closed ring asynchronously; wait until
        // every delivered chunk is rendered or accounted as dropped.
        let report = loop {
            let report = self.daemon.status().await?;
            let drained = report.performance.chunks_rendered + report.performance.chunks_dropped
                >= chunks_delivered
                || report.state == SessionState::Error;
            if drained {
                break report;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        let summary = StreamSummary {
            chunks_delivered,
            bytes_delivered,
            time_to_first_audio_ms: ttfa,
            underruns: report.performance.underruns,
        };
        info!(
            chunks = summary.chunks_delivered,
            bytes = summary.bytes_delivered,
            underruns = summary.underruns,
            "stream finished"
        );
        Ok(summary)
    }

    /// Producer half: fetch, slice, deliver.
    async fn produce(
        &self,
        request: &SpeakRequest,
        abort_rx: &watch::Receiver<bool>,
    ) -> Result<(u64, u64)> {
        let config_rx = self.daemon.buffer_config();
        let format = self.daemon.negotiated_format();
        let mut sequence: u64 = 0;
        let mut bytes_delivered: u64 = 0;

        for segment in split_segments(&request.text, MIN_SEGMENT_CHARS) {
            if *abort_rx.borrow() {
                info!("abort requested, stopping producer");
                break;
            }

            let outcome = self
                .executor
                .execute("synthesis", || self.synthesizer.synthesize(&segment))
                .await;

            let pcm = match outcome.result {
                Ok(pcm) => pcm,
                Err(e) => {
                    if outcome.circuit_open {
                        warn!(
                            "synthesis circuit open after {} breaker trips; \
                             stream cannot continue until the service recovers",
                            self.executor.metrics().circuit_breaker_trips
                        );
                    } else {
                        warn!(
                            attempts = outcome.attempts.len(),
                            error = %e,
                            "segment synthesis failed permanently"
                        );
                    }
                    return Err(e);
                }
            };

            // Chunk size follows the live config; a configure swap applies
            // from the next slice onward.
            let chunk_size = config_rx.borrow().chunk_size_bytes.max(2);
            let mut offset = 0;
            while offset < pcm.len() {
                if *abort_rx.borrow() {
                    return Ok((sequence, bytes_delivered));
                }
                let end = (offset + chunk_size).min(pcm.len());
                let chunk = AudioChunk::new(sequence, pcm.slice(offset..end), format);
                match self.daemon.deliver_chunk(chunk).await {
                    Ok(()) => {}
                    // The daemon stops underneath us when aborted.
                    Err(_) if *abort_rx.borrow() => return Ok((sequence, bytes_delivered)),
                    Err(e) => return Err(e),
                }
                bytes_delivered += (end - offset) as u64;
                sequence += 1;
                offset = end;
            }
        }

        Ok((sequence, bytes_delivered))
    }
}

/// Consumer-side telemetry: watch events, track TTFA and underruns, feed
/// the controller, reconnect on missed heartbeats. Ends when the session
/// reaches a terminal state or the abort fires.
#[allow(clippy::too_many_arguments)]
async fn telemetry_loop(
    daemon: DaemonHandle,
    mut events: tokio::sync::broadcast::Receiver<crate::daemon::StatusEvent>,
    controller: Arc<Mutex<AdaptiveBufferController>>,
    monitor: Arc<HeartbeatMonitor>,
    probe_executor: Arc<RetryExecutor>,
    mut abort_rx: watch::Receiver<bool>,
    control_window: Duration,
    started: Instant,
) -> Option<f64> {
    use tokio::sync::broadcast::error::RecvError;

    let mut ticker = tokio::time::interval(control_window);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    ticker.tick().await;

    let mut ttfa_ms: Option<f64> = None;
    let mut underruns: u64 = 0;
    let mut audio_position_ms: f64 = 0.0;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => match event.kind {
                    StatusEventKind::Heartbeat => monitor.record_beat(),
                    StatusEventKind::Underrun { total } => underruns = total,
                    StatusEventKind::Status(report) => {
                        if ttfa_ms.is_none() && report.performance.chunks_rendered > 0 {
                            let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                            debug!(ttfa_ms = elapsed, "first audio rendered");
                            ttfa_ms = Some(elapsed);
                        }
                        underruns = report.performance.underruns;
                        audio_position_ms = report.audio_position_ms;
                        if report.state.is_terminal() {
                            break;
                        }
                    }
                    StatusEventKind::StateChanged { to, .. } if to.is_terminal() => break,
                    _ => {}
                },
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "telemetry subscriber lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = ticker.tick() => {
                if !monitor.is_healthy() {
                    warn!("heartbeats missing, probing daemon through retry executor");
                    let probe = probe_executor.execute("daemon", || daemon.status()).await;
                    if probe.is_success() {
                        // Reconnect: fresh event subscription plus a beat.
                        // Anything buffered on the stale receiver predates
                        // the silent gap.
                        events = daemon.events();
                        monitor.record_beat();
                    } else {
                        warn!("daemon probe failed, session presumed lost");
                        break;
                    }
                }

                let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
                let efficiency = if elapsed_ms > 0.0 {
                    (audio_position_ms / elapsed_ms).clamp(0.0, 1.0)
                } else {
                    1.0
                };
                let metrics = PlaybackMetrics {
                    time_to_first_audio_ms: ttfa_ms.unwrap_or(0.0),
                    underrun_count: underruns,
                    streaming_efficiency: efficiency,
                };
                let adjusted = controller
                    .lock()
                    .expect("controller lock poisoned")
                    .update_buffer(&metrics);
                if let Some(config) = adjusted {
                    if let Err(e) = daemon.control(ControlAction::Configure(config)).await {
                        debug!(error = %e, "daemon gone, stopping telemetry");
                        break;
                    }
                }
            },
            changed = abort_rx.changed() => {
                if changed.is_err() || *abort_rx.borrow() {
                    break;
                }
            }
        }
    }

    ttfa_ms
}

/// Convenience check used by the control surface: playing or paused means
/// a session is active.
pub fn session_is_active(state: SessionState) -> bool {
    matches!(state, SessionState::Playing | SessionState::Paused)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::{BufferConfig, BufferTuning};
    use crate::audio::{AudioFormat, AudioSink, MemorySink, OverflowPolicy};
    use crate::daemon::{DaemonConfig, StreamingDaemon};
    use crate::retry::{BreakerState, RetryPolicy};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct SharedSink(Arc<Mutex<MemorySink>>);

    impl AudioSink for SharedSink {
        fn write_chunk(&mut self, chunk: &AudioChunk) -> Result<()> {
            self.0.lock().expect("sink lock").write_chunk(chunk)
        }
        fn flush(&mut self) -> Result<()> {
            self.0.lock().expect("sink lock").flush()
        }
    }

    /// Scripted synthesizer: fails the first `fail_first` calls, then
    /// returns `segment_bytes` of silence per segment.
    struct ScriptedSynth {
        calls: AtomicU32,
        fail_first: u32,
        segment_bytes: usize,
    }

    #[async_trait]
    impl SegmentSynthesizer for ScriptedSynth {
        async fn synthesize(&self, _text: &str) -> Result<Bytes> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(Error::Network("synthesis unreachable".into()))
            } else {
                Ok(Bytes::from(vec![0u8; self.segment_bytes]))
            }
        }
    }

    fn build_orchestrator(
        synth: ScriptedSynth,
        retry_policy: RetryPolicy,
        breaker: CircuitBreaker,
    ) -> (Orchestrator<ScriptedSynth>, Arc<Mutex<MemorySink>>) {
        let sink = Arc::new(Mutex::new(MemorySink::new()));
        let (abort_tx, abort_rx) = watch::channel(false);
        let daemon_config = DaemonConfig {
            heartbeat_interval: Duration::from_millis(100),
            ring_capacity_bytes: 1_000_000,
            overflow_policy: OverflowPolicy::Backpressure,
            event_capacity: 1024,
            initial_buffer: BufferConfig::for_target(300, 100, AudioFormat::default()),
            pace_playback: false,
        };
        let daemon = StreamingDaemon::spawn(
            daemon_config,
            AudioFormat::default(),
            Box::new(SharedSink(Arc::clone(&sink))),
            abort_rx.clone(),
        );
        let executor = Arc::new(
            RetryExecutor::new(retry_policy, Arc::new(breaker)).with_abort(abort_rx),
        );
        let controller =
            AdaptiveBufferController::new(BufferTuning::default(), AudioFormat::default());
        let monitor = Arc::new(HeartbeatMonitor::new(Duration::from_millis(100), 3));
        let orchestrator = Orchestrator::new(
            synth,
            daemon,
            executor,
            controller,
            monitor,
            abort_tx,
            Duration::from_millis(250),
        );
        (orchestrator, sink)
    }

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn streams_segments_gap_free() {
        let synth = ScriptedSynth {
            calls: AtomicU32::new(0),
            fail_first: 0,
            segment_bytes: 9600,
        };
        let (orchestrator, sink) =
            build_orchestrator(synth, quick_policy(2), CircuitBreaker::new("synthesis"));

        let summary = orchestrator
            .run(SpeakRequest {
                text: "First sentence here. Second sentence follows.".into(),
            })
            .await
            .expect("stream");

        // Two segments, 9600 bytes each, 4800-byte chunks.
        assert_eq!(summary.chunks_delivered, 4);
        assert_eq!(summary.bytes_delivered, 19200);

        let sink = sink.lock().expect("sink lock");
        let sequences: Vec<u64> = sink.chunks.iter().map(|c| c.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 2, 3]);
        assert_eq!(orchestrator.daemon().session_state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn transient_failures_are_invisible_to_the_caller() {
        let synth = ScriptedSynth {
            calls: AtomicU32::new(0),
            fail_first: 2,
            segment_bytes: 4800,
        };
        let (orchestrator, sink) =
            build_orchestrator(synth, quick_policy(3), CircuitBreaker::new("synthesis"));

        let summary = orchestrator
            .run(SpeakRequest {
                text: "Only one sentence to speak.".into(),
            })
            .await
            .expect("stream recovers");

        assert_eq!(summary.chunks_delivered, 1);
        assert_eq!(sink.lock().expect("sink lock").chunks.len(), 1);

        let metrics = orchestrator.executor.metrics();
        assert_eq!(metrics.total_attempts, 3);
        assert_eq!(metrics.successful_retries, 1);
    }

    #[tokio::test]
    async fn persistent_failure_surfaces_and_stops_session() {
        let synth = ScriptedSynth {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
            segment_bytes: 4800,
        };
        let (orchestrator, sink) =
            build_orchestrator(synth, quick_policy(1), CircuitBreaker::new("synthesis"));

        let err = orchestrator
            .run(SpeakRequest {
                text: "This will never synthesize.".into(),
            })
            .await
            .expect_err("must fail");
        assert!(matches!(err, Error::Network(_)));
        assert!(sink.lock().expect("sink lock").chunks.is_empty());
        assert_eq!(orchestrator.daemon().session_state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn open_circuit_is_reported_distinctly() {
        let synth = ScriptedSynth {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
            segment_bytes: 4800,
        };
        // Threshold 1: the first failed segment trips the breaker.
        let breaker =
            CircuitBreaker::with_settings("synthesis", 1, Duration::from_secs(60));
        let (orchestrator, _sink) = build_orchestrator(synth, quick_policy(0), breaker);

        let err = orchestrator
            .run(SpeakRequest {
                text: "First sentence fails hard. Second never gets a chance.".into(),
            })
            .await
            .expect_err("must fail");
        // First segment exhausts its single attempt and trips the breaker.
        assert!(matches!(err, Error::Network(_)));
        assert_eq!(orchestrator.executor.metrics().circuit_breaker_trips, 1);

        // A follow-up run is rejected without touching the synthesizer.
        let calls_before = orchestrator.synthesizer.calls.load(Ordering::SeqCst);
        let err = orchestrator
            .run(SpeakRequest {
                text: "Blocked outright.".into(),
            })
            .await
            .expect_err("circuit open");
        assert!(matches!(err, Error::CircuitOpen(_)));
        assert_eq!(
            orchestrator.synthesizer.calls.load(Ordering::SeqCst),
            calls_before
        );
    }

    #[tokio::test]
    async fn abort_stops_gracefully_with_partial_delivery() {
        let synth = ScriptedSynth {
            calls: AtomicU32::new(0),
            fail_first: 0,
            segment_bytes: 4800,
        };
        let (orchestrator, _sink) =
            build_orchestrator(synth, quick_policy(2), CircuitBreaker::new("synthesis"));

        orchestrator.abort();
        let summary = orchestrator
            .run(SpeakRequest {
                text: "One. Two. Three. Four. Five. Six. Seven. Eight.".into(),
            })
            .await
            .expect("graceful abort");

        assert_eq!(summary.chunks_delivered, 0);
        assert_eq!(orchestrator.daemon().session_state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn daemon_probes_run_on_their_own_breaker() {
        let synth = ScriptedSynth {
            calls: AtomicU32::new(0),
            fail_first: 0,
            segment_bytes: 4800,
        };
        let (orchestrator, _sink) =
            build_orchestrator(synth, quick_policy(1), CircuitBreaker::new("synthesis"));

        // Synthesis is one failure away from its threshold of five.
        let synthesis = orchestrator.executor.breaker();
        for _ in 0..4 {
            synthesis.record_failure();
        }

        let probe = orchestrator
            .probe_executor
            .execute("daemon", || orchestrator.daemon.status())
            .await;
        assert!(probe.is_success());

        // The probe success landed on the daemon breaker, so the
        // synthesis failure count is intact and the next failure trips.
        assert_eq!(synthesis.failure_count(), 4);
        assert_eq!(orchestrator.probe_executor.breaker().failure_count(), 0);
        synthesis.record_failure();
        assert_eq!(synthesis.state(), BreakerState::Open);
    }

    #[tokio::test]
    async fn missed_heartbeats_drive_a_probe_through_the_retry_executor() {
        let sink = Arc::new(Mutex::new(MemorySink::new()));
        let (abort_tx, abort_rx) = watch::channel(false);
        // Daemon heartbeats are far slower than the monitor expects, so
        // the telemetry loop sees a dead session and must probe.
        let daemon = StreamingDaemon::spawn(
            DaemonConfig {
                heartbeat_interval: Duration::from_secs(3600),
                ring_capacity_bytes: 1_000_000,
                overflow_policy: OverflowPolicy::Backpressure,
                event_capacity: 64,
                initial_buffer: BufferConfig::for_target(300, 100, AudioFormat::default()),
                pace_playback: false,
            },
            AudioFormat::default(),
            Box::new(SharedSink(Arc::clone(&sink))),
            abort_rx.clone(),
        );
        let probe_executor = Arc::new(
            RetryExecutor::new(quick_policy(1), Arc::new(CircuitBreaker::new("daemon")))
                .with_abort(abort_rx),
        );
        let monitor = Arc::new(HeartbeatMonitor::new(Duration::from_millis(10), 3));
        let controller = Arc::new(Mutex::new(AdaptiveBufferController::new(
            BufferTuning::default(),
            AudioFormat::default(),
        )));

        let telemetry = tokio::spawn(telemetry_loop(
            daemon.clone(),
            daemon.events(),
            controller,
            Arc::clone(&monitor),
            Arc::clone(&probe_executor),
            abort_tx.subscribe(),
            Duration::from_millis(20),
            Instant::now(),
        ));

        tokio::time::timeout(Duration::from_secs(5), async {
            while probe_executor.metrics().total_attempts == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("probe before deadline");

        abort_tx.send(true).expect("telemetry alive");
        telemetry.await.expect("telemetry task");
    }

    #[test]
    fn active_session_states() {
        assert!(session_is_active(SessionState::Playing));
        assert!(session_is_active(SessionState::Paused));
        assert!(!session_is_active(SessionState::Idle));
        assert!(!session_is_active(SessionState::Stopped));
    }
}
