//! Audio chunk and format types carried through the streaming pipeline.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Linear PCM format negotiated per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample_rate: 24000,
            channels: 1,
            bit_depth: 16,
        }
    }
}

impl AudioFormat {
    /// Bytes of PCM per second of audio.
    pub fn byte_rate(&self) -> usize {
        self.sample_rate as usize * self.channels as usize * (self.bit_depth as usize / 8)
    }

    /// Bytes needed to hold `ms` milliseconds of audio.
    pub fn bytes_for_ms(&self, ms: u32) -> usize {
        self.byte_rate() * ms as usize / 1000
    }
}

/// One unit of synthesized audio flowing producer → ring → sink.
///
/// Owned by the producer until enqueued, then by the ring buffer until
/// consumed. Sequence numbers are strictly increasing per stream.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub sequence: u64,
    pub payload: Bytes,
    pub format: AudioFormat,
}

impl AudioChunk {
    pub fn new(sequence: u64, payload: Bytes, format: AudioFormat) -> Self {
        Self {
            sequence,
            payload,
            format,
        }
    }

    pub fn size_bytes(&self) -> usize {
        self.payload.len()
    }

    /// Playback duration of this chunk's payload.
    pub fn duration_ms(&self) -> f64 {
        let rate = self.format.byte_rate();
        if rate == 0 {
            return 0.0;
        }
        self.payload.len() as f64 / rate as f64 * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_rate_for_default_format() {
        // 24kHz mono 16-bit = 48000 bytes/sec.
        let format = AudioFormat::default();
        assert_eq!(format.byte_rate(), 48000);
        assert_eq!(format.bytes_for_ms(100), 4800);
    }

    #[test]
    fn chunk_duration_matches_payload() {
        let format = AudioFormat::default();
        let chunk = AudioChunk::new(0, Bytes::from(vec![0u8; 4800]), format);
        assert!((chunk.duration_ms() - 100.0).abs() < 1e-9);
    }
}
