//! Audio chunk types, the delivery ring, and output sinks.

mod chunk;
mod ring;
mod sink;

pub use chunk::{AudioChunk, AudioFormat};
pub use ring::{OverflowPolicy, PushOutcome, RingBuffer, RingStats};
pub use sink::{AudioSink, MemorySink, WavFileSink};
