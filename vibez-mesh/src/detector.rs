//! Audio Level Detector
//!
//! Polls the frequency analyser of the local capture and turns its average
//! energy into a debounced speaking / not-speaking signal:
//! - speaking fires on the first loud sample of an unmuted track
//! - not-speaking fires once energy stayed low for the configured delay

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::DetectorConfig;
use crate::error::{Error, Result};
use crate::media::{LocalAudioTrack, LocalStream};

/// Receives every confirmed transition
pub type SpeakingCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Average energy over all frequency bins
#[must_use]
pub fn average_energy(bins: &[u8]) -> f32 {
    if bins.is_empty() {
        return 0.0;
    }
    let sum: u32 = bins.iter().map(|&b| u32::from(b)).sum();
    sum as f32 / bins.len() as f32
}

/// Hysteresis state machine, independent of timers
#[derive(Debug, Clone)]
pub struct SpeakingState {
    speaking: bool,
    quiet_since: Option<Instant>,
    threshold: f32,
    silence_delay: std::time::Duration,
}

impl SpeakingState {
    #[must_use]
    pub fn new(config: &DetectorConfig) -> Self {
        Self {
            speaking: false,
            quiet_since: None,
            threshold: config.threshold,
            silence_delay: config.silence_delay(),
        }
    }

    #[must_use]
    pub const fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Feed one sample. Returns the new value when a transition is confirmed.
    pub fn observe(&mut self, energy: f32, track_enabled: bool, now: Instant) -> Option<bool> {
        let loud = track_enabled && energy > self.threshold;

        if loud {
            self.quiet_since = None;
            if !self.speaking {
                self.speaking = true;
                return Some(true);
            }
            return None;
        }

        if !self.speaking {
            return None;
        }

        let since = *self.quiet_since.get_or_insert(now);
        if now.duration_since(since) >= self.silence_delay {
            self.speaking = false;
            self.quiet_since = None;
            return Some(false);
        }
        None
    }

    /// Drop to not-speaking without waiting for the debounce
    pub fn reset(&mut self) {
        self.speaking = false;
        self.quiet_since = None;
    }
}

/// Running detector. Stopping (or dropping) it ends the sampling task.
pub struct LevelDetector {
    state: Arc<Mutex<SpeakingState>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LevelDetector {
    /// Start sampling `stream`. Fails if the stream has no enabled audio track.
    pub fn start(
        stream: &LocalStream,
        config: &DetectorConfig,
        on_change: SpeakingCallback,
    ) -> Result<Self> {
        let track = stream
            .primary_track()
            .cloned()
            .ok_or_else(|| Error::InvalidInput("capture has no enabled audio track".to_string()))?;

        let state = Arc::new(Mutex::new(SpeakingState::new(config)));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(sample_loop(
            track,
            config.poll_interval(),
            Arc::clone(&state),
            cancel.clone(),
            on_change,
        ));

        debug!(
            stream_id = %stream.id(),
            poll_ms = config.poll_interval_ms,
            "Level detector started"
        );
        Ok(Self {
            state,
            cancel,
            task: Some(task),
        })
    }

    #[must_use]
    pub fn is_speaking(&self) -> bool {
        self.state.lock().is_speaking()
    }

    /// Reset to not-speaking. The caller is responsible for announcing it.
    pub fn force_silent(&self) {
        self.state.lock().reset();
    }

    /// Cancelled once the detector is stopped
    #[cfg(test)]
    pub(crate) fn stop_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.abort();
            debug!("Level detector stopped");
        }
    }
}

impl Drop for LevelDetector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn sample_loop(
    track: Arc<LocalAudioTrack>,
    period: std::time::Duration,
    state: Arc<Mutex<SpeakingState>>,
    cancel: CancellationToken,
    on_change: SpeakingCallback,
) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if !track.is_live() {
            break;
        }

        let energy = average_energy(&track.analyser().byte_frequency_data());
        let transition = state
            .lock()
            .observe(energy, track.is_enabled(), Instant::now());

        if let Some(speaking) = transition {
            trace!(energy, speaking, "Speaking transition");
            on_change(speaking);
        }
    }
}
