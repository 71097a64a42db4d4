//! Configuration types for the streaming engine.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adaptive::BufferTuning;
use crate::audio::{AudioFormat, OverflowPolicy};
use crate::retry::RetryPolicy;

/// Top-level engine configuration, one section per subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub synthesis: SynthesisConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub ring: RingConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub buffer: BufferSection,

    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
}

/// Listen address for the control surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Upstream synthesis endpoint parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisConfig {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_voice")]
    pub voice: String,

    #[serde(default = "default_speed")]
    pub speed: f32,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            voice: default_voice(),
            speed: default_speed(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl SynthesisConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Session audio format and sink output location.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    #[serde(default = "default_channels")]
    pub channels: u16,

    #[serde(default = "default_bit_depth")]
    pub bit_depth: u16,

    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: default_sample_rate(),
            channels: default_channels(),
            bit_depth: default_bit_depth(),
            output_dir: default_output_dir(),
        }
    }
}

impl AudioConfig {
    pub fn format(&self) -> AudioFormat {
        AudioFormat {
            sample_rate: self.sample_rate,
            channels: self.channels,
            bit_depth: self.bit_depth,
        }
    }
}

/// Ring buffer sizing and overflow behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    #[serde(default = "default_ring_capacity")]
    pub capacity_bytes: usize,

    #[serde(default = "default_overflow_policy")]
    pub overflow_policy: OverflowPolicy,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            capacity_bytes: default_ring_capacity(),
            overflow_policy: default_overflow_policy(),
        }
    }
}

/// Retry and circuit breaker settings for the synthesis target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,

    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            breaker_threshold: default_breaker_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            ..Default::default()
        }
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }
}

/// Adaptive buffer control bounds and cadence, in plain milliseconds for
/// config-file friendliness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferSection {
    #[serde(default = "default_min_target_ms")]
    pub min_target_ms: u32,

    #[serde(default = "default_max_target_ms")]
    pub max_target_ms: u32,

    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    #[serde(default = "default_ttfa_target_ms")]
    pub ttfa_target_ms: f64,

    #[serde(default = "default_grow_step_ms")]
    pub grow_step_ms: u32,

    #[serde(default = "default_shrink_step_ms")]
    pub shrink_step_ms: u32,

    #[serde(default = "default_chunk_ms")]
    pub chunk_ms: u32,
}

impl Default for BufferSection {
    fn default() -> Self {
        Self {
            min_target_ms: default_min_target_ms(),
            max_target_ms: default_max_target_ms(),
            window_ms: default_window_ms(),
            ttfa_target_ms: default_ttfa_target_ms(),
            grow_step_ms: default_grow_step_ms(),
            shrink_step_ms: default_shrink_step_ms(),
            chunk_ms: default_chunk_ms(),
        }
    }
}

impl BufferSection {
    pub fn tuning(&self) -> BufferTuning {
        BufferTuning {
            min_target_ms: self.min_target_ms,
            max_target_ms: self.max_target_ms,
            window: Duration::from_millis(self.window_ms),
            ttfa_target_ms: self.ttfa_target_ms,
            grow_step_ms: self.grow_step_ms,
            shrink_step_ms: self.shrink_step_ms,
            chunk_ms: self.chunk_ms,
        }
    }
}

/// Heartbeat cadence and the client-side miss threshold.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_miss_threshold")]
    pub miss_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval_ms(),
            miss_threshold: default_miss_threshold(),
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_endpoint() -> String {
    "http://127.0.0.1:8080/v1/synthesize".to_string()
}

fn default_voice() -> String {
    "default".to_string()
}

fn default_speed() -> f32 {
    1.0
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_sample_rate() -> u32 {
    24000
}

fn default_channels() -> u16 {
    1
}

fn default_bit_depth() -> u16 {
    16
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_ring_capacity() -> usize {
    // Two seconds of 24kHz mono 16-bit PCM.
    96_000
}

fn default_overflow_policy() -> OverflowPolicy {
    OverflowPolicy::Backpressure
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown_secs() -> u64 {
    60
}

fn default_min_target_ms() -> u32 {
    100
}

fn default_max_target_ms() -> u32 {
    2000
}

fn default_window_ms() -> u64 {
    5000
}

fn default_ttfa_target_ms() -> f64 {
    300.0
}

fn default_grow_step_ms() -> u32 {
    150
}

fn default_shrink_step_ms() -> u32 {
    50
}

fn default_chunk_ms() -> u32 {
    100
}

fn default_heartbeat_interval_ms() -> u64 {
    1000
}

fn default_miss_threshold() -> u32 {
    3
}
