//! Audio sinks rendering PCM chunks to their final destination.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use hound::{SampleFormat, WavSpec, WavWriter};
use tracing::debug;

use super::chunk::{AudioChunk, AudioFormat};
use crate::error::{Error, Result};

/// Destination for rendered audio. One sink per session.
pub trait AudioSink: Send {
    fn write_chunk(&mut self, chunk: &AudioChunk) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// Writes 16-bit PCM chunks to a WAV file.
pub struct WavFileSink {
    writer: Option<WavWriter<BufWriter<File>>>,
    format: AudioFormat,
}

impl WavFileSink {
    pub fn create(path: impl AsRef<Path>, format: AudioFormat) -> Result<Self> {
        if format.bit_depth != 16 {
            return Err(Error::Audio(format!(
                "unsupported bit depth: {} (only 16-bit PCM)",
                format.bit_depth
            )));
        }
        let spec = WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: 16,
            sample_format: SampleFormat::Int,
        };
        let writer = WavWriter::create(path.as_ref(), spec)?;
        debug!(path = %path.as_ref().display(), "created WAV sink");
        Ok(Self {
            writer: Some(writer),
            format,
        })
    }

    /// Finish the WAV header. Called implicitly on drop, but errors are
    /// only observable through this method.
    pub fn finalize(mut self) -> Result<()> {
        if let Some(writer) = self.writer.take() {
            writer.finalize()?;
        }
        Ok(())
    }
}

impl AudioSink for WavFileSink {
    fn write_chunk(&mut self, chunk: &AudioChunk) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| Error::Audio("sink already finalized".into()))?;

        if chunk.format.bit_depth != self.format.bit_depth {
            return Err(Error::Audio(format!(
                "chunk bit depth {} does not match sink {}",
                chunk.format.bit_depth, self.format.bit_depth
            )));
        }
        if chunk.payload.len() % 2 != 0 {
            return Err(Error::Audio(format!(
                "chunk {} carries {} bytes, not a whole number of 16-bit samples",
                chunk.sequence,
                chunk.payload.len()
            )));
        }

        for pair in chunk.payload.chunks_exact(2) {
            let sample = i16::from_le_bytes([pair[0], pair[1]]);
            writer.write_sample(sample)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

impl Drop for WavFileSink {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            let _ = writer.finalize();
        }
    }
}

/// In-memory sink for tests and diagnostics.
#[derive(Default)]
pub struct MemorySink {
    pub chunks: Vec<AudioChunk>,
    pub flushes: u32,
    /// When set, the next write fails with this message. Lets tests
    /// exercise the session-error path.
    pub fail_next: Option<String>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes_written(&self) -> usize {
        self.chunks.iter().map(|c| c.size_bytes()).sum()
    }
}

impl AudioSink for MemorySink {
    fn write_chunk(&mut self, chunk: &AudioChunk) -> Result<()> {
        if let Some(msg) = self.fail_next.take() {
            return Err(Error::Audio(msg));
        }
        self.chunks.push(chunk.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.flushes += 1;
        Ok(())
    }
}
