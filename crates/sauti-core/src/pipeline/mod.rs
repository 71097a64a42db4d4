//! Synthesis fetch and producer/consumer orchestration.

mod orchestrator;
mod synth;

pub use orchestrator::{
    session_is_active, Orchestrator, SegmentSynthesizer, SpeakRequest, StreamSummary,
};
pub use synth::{split_segments, SynthesisClient};
