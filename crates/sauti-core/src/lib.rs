//! Sauti Core - Resilient Audio Streaming Engine
//!
//! This crate provides the building blocks for streaming synthesized speech
//! from a flaky network service to an audio sink without audible gaps:
//!
//! - Error classification and retry with exponential backoff and jitter
//! - A circuit breaker guarding the upstream synthesis endpoint
//! - A bounded ring buffer decoupling fetch pace from playback pace
//! - A streaming daemon owning the playback session and its lifecycle
//! - An adaptive controller that resizes buffering from observed metrics
//!
//! # Example
//!
//! ```ignore
//! use sauti_core::config::StreamConfig;
//! use sauti_core::pipeline::{Orchestrator, SynthesisClient};
//!
//! let config = StreamConfig::default();
//! let client = SynthesisClient::new(config.synthesis.clone())?;
//! let summary = orchestrator.run("Hello, world!").await?;
//! ```

pub mod adaptive;
pub mod audio;
pub mod config;
pub mod daemon;
pub mod error;
pub mod pipeline;
pub mod retry;

pub use adaptive::{AdaptiveBufferController, BufferConfig, BufferHealth, PlaybackMetrics};
pub use audio::{AudioChunk, AudioFormat, OverflowPolicy, RingBuffer};
pub use config::StreamConfig;
pub use daemon::{DaemonConfig, DaemonHandle, HeartbeatMonitor, SessionState, StreamingDaemon};
pub use error::{Error, Result};
pub use pipeline::{Orchestrator, SynthesisClient};
pub use retry::{CircuitBreaker, ErrorClass, ErrorKind, RetryExecutor, RetryPolicy};
