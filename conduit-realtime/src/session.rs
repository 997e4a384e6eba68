//! Session trait, lifecycle state machine, statistics, and the registry
//! that guarantees disposal.

use crate::config::RealtimeConfig;
use crate::events::{ClientFrame, RealtimeResponse};
use async_trait::async_trait;
use conduit_core::Result;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Transport close is bounded by this on disposal.
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Connecting,
    Connected,
    Active,
    Disconnected,
    Reconnecting,
    Closed,
    Error,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SessionStats {
    pub input_audio_seconds: f64,
    pub output_audio_seconds: f64,
    pub turn_count: u64,
    pub interruption_count: u64,
    pub function_call_count: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub error_count: u64,
    pub average_latency_ms: f64,
}

/// Shared mutable statistics updated from both halves of a session.
#[derive(Default)]
pub struct StatsRecorder {
    stats: Mutex<SessionStats>,
    latency_samples: Mutex<Vec<f64>>,
}

impl StatsRecorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn snapshot(&self) -> SessionStats {
        *self.stats.lock()
    }

    pub fn add_input_audio(&self, seconds: f64) {
        self.stats.lock().input_audio_seconds += seconds;
    }

    pub fn add_output_audio(&self, seconds: f64) {
        self.stats.lock().output_audio_seconds += seconds;
    }

    pub fn turn_completed(&self, interrupted: bool) {
        let mut stats = self.stats.lock();
        stats.turn_count += 1;
        if interrupted {
            stats.interruption_count += 1;
        }
    }

    pub fn function_called(&self) {
        self.stats.lock().function_call_count += 1;
    }

    pub fn add_tokens(&self, input: u64, output: u64) {
        let mut stats = self.stats.lock();
        stats.input_tokens += input;
        stats.output_tokens += output;
    }

    pub fn note_error(&self) {
        self.stats.lock().error_count += 1;
    }

    pub fn note_latency(&self, latency: Duration) {
        let mut samples = self.latency_samples.lock();
        samples.push(latency.as_secs_f64() * 1000.0);
        let average = samples.iter().sum::<f64>() / samples.len() as f64;
        self.stats.lock().average_latency_ms = average;
    }
}

/// One duplex conversation. Send and receive are independently
/// cancel-safe: a timeout on one half does not disturb the other.
#[async_trait]
pub trait RealtimeSession: Send + Sync {
    fn id(&self) -> &str;

    fn provider(&self) -> &str;

    fn state(&self) -> SessionState;

    fn stats(&self) -> SessionStats;

    /// Translate and send one canonical frame.
    async fn send(&self, frame: ClientFrame) -> Result<()>;

    /// Receive the next canonical response; `None` when the provider
    /// closed the stream.
    async fn receive(&self) -> Result<Option<RealtimeResponse>>;

    /// Apply a mid-session configuration update.
    async fn update(&self, config: RealtimeConfig) -> Result<()>;

    /// Close the underlying transport with a normal-closure frame,
    /// best-effort within [`CLOSE_TIMEOUT`].
    async fn close(&self) -> Result<()>;
}

/// Tracks live sessions and disposes them on removal or shutdown.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, Arc<dyn RealtimeSession>>,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn insert(&self, session: Arc<dyn RealtimeSession>) {
        self.sessions.insert(session.id().to_string(), session);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn RealtimeSession>> {
        self.sessions.get(id).map(|s| Arc::clone(&s))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Remove and close a session. Closing is best-effort; the session is
    /// always removed.
    pub async fn dispose(&self, id: &str) -> Option<SessionStats> {
        let (_, session) = self.sessions.remove(id)?;
        let stats = session.stats();
        if let Err(e) = session.close().await {
            tracing::debug!(session = id, error = %e, "session close failed");
        }
        Some(stats)
    }

    /// Close everything, e.g. on shutdown.
    pub async fn dispose_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|s| s.key().clone()).collect();
        for id in ids {
            self.dispose(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FakeSession {
        id: String,
        closed: AtomicBool,
        recorder: Arc<StatsRecorder>,
    }

    #[async_trait]
    impl RealtimeSession for FakeSession {
        fn id(&self) -> &str {
            &self.id
        }

        fn provider(&self) -> &str {
            "fake"
        }

        fn state(&self) -> SessionState {
            if self.closed.load(Ordering::SeqCst) {
                SessionState::Closed
            } else {
                SessionState::Active
            }
        }

        fn stats(&self) -> SessionStats {
            self.recorder.snapshot()
        }

        async fn send(&self, _frame: ClientFrame) -> Result<()> {
            Ok(())
        }

        async fn receive(&self) -> Result<Option<RealtimeResponse>> {
            Ok(None)
        }

        async fn update(&self, _config: RealtimeConfig) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispose_closes_and_returns_stats() {
        let registry = SessionRegistry::new();
        let recorder = StatsRecorder::new();
        recorder.turn_completed(false);
        recorder.turn_completed(true);

        let session = Arc::new(FakeSession {
            id: "s1".to_string(),
            closed: AtomicBool::new(false),
            recorder,
        });
        registry.insert(session.clone());
        assert_eq!(registry.len(), 1);

        let stats = registry.dispose("s1").await.unwrap();
        assert_eq!(stats.turn_count, 2);
        assert_eq!(stats.interruption_count, 1);
        assert_eq!(session.state(), SessionState::Closed);
        assert!(registry.is_empty());
    }

    #[test]
    fn latency_average_tracks_samples() {
        let recorder = StatsRecorder::new();
        recorder.note_latency(Duration::from_millis(100));
        recorder.note_latency(Duration::from_millis(300));
        let stats = recorder.snapshot();
        assert!((stats.average_latency_ms - 200.0).abs() < 1e-9);
    }
}
