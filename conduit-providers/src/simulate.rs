//! Simulated audio streaming for providers without native TTS streaming:
//! the complete response is chunked and paced, with the last chunk marked
//! final.

use bytes::Bytes;
use conduit_core::{AudioChunk, AudioChunkStream};
use std::time::Duration;

pub const SIMULATED_CHUNK_BYTES: usize = 4 * 1024;
pub const SIMULATED_CHUNK_PACING: Duration = Duration::from_millis(10);

pub fn simulated_audio_stream(audio: Bytes) -> AudioChunkStream {
    simulated_audio_stream_with(audio, SIMULATED_CHUNK_BYTES, SIMULATED_CHUNK_PACING)
}

pub fn simulated_audio_stream_with(
    audio: Bytes,
    chunk_bytes: usize,
    pacing: Duration,
) -> AudioChunkStream {
    Box::pin(async_stream::stream! {
        if audio.is_empty() {
            yield Ok(AudioChunk {
                data: Bytes::new(),
                chunk_index: 0,
                is_final: true,
                text_segment: None,
                timestamp: Some(0.0),
            });
            return;
        }

        let total = audio.len();
        let chunk_count = total.div_ceil(chunk_bytes);
        for index in 0..chunk_count {
            if index > 0 {
                tokio::time::sleep(pacing).await;
            }
            let start = index * chunk_bytes;
            let end = (start + chunk_bytes).min(total);
            yield Ok(AudioChunk {
                data: audio.slice(start..end),
                chunk_index: index as u32,
                is_final: index + 1 == chunk_count,
                text_segment: None,
                timestamp: Some(index as f64 * pacing.as_secs_f64()),
            });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn chunks_and_marks_final_exactly_once() {
        let audio = Bytes::from(vec![0u8; 10 * 1024]);
        let chunks: Vec<AudioChunk> =
            simulated_audio_stream_with(audio, 4 * 1024, Duration::ZERO)
                .map(|c| c.unwrap())
                .collect()
                .await;

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].data.len(), 4 * 1024);
        assert_eq!(chunks[2].data.len(), 2 * 1024);
        let finals: Vec<bool> = chunks.iter().map(|c| c.is_final).collect();
        assert_eq!(finals, vec![false, false, true]);
        let indices: Vec<u32> = chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn empty_audio_yields_single_final_chunk() {
        let chunks: Vec<AudioChunk> = simulated_audio_stream(Bytes::new())
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_final);
    }
}
