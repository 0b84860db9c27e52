//! Simulated video player
//!
//! Stands in for a real engine so the monitor can take part in a group: it
//! keeps a position that advances with the tokio clock at the current
//! playback rate and reports the events a real engine would.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use syncplay_core::queue::QueueEntry;
use syncplay_core::time::{ms_to_ticks, ticks_to_ms, Millis, Ticks};
use syncplay_core::{LocalPlayer, PlayRequest, PlayerError, PlayerEvent, PlayerEventSink, PlayerKind};
use tokio::time::Instant;
use tracing::debug;

/// How often a playing engine reports its position
const TIME_UPDATE_INTERVAL: Duration = Duration::from_millis(250);

/// Loading and buffering delays of the simulated engine
#[derive(Debug, Clone, Copy)]
pub struct SimTiming {
    pub load: Duration,
    pub seek: Duration,
}

impl Default for SimTiming {
    fn default() -> Self {
        Self {
            load: Duration::from_millis(400),
            seek: Duration::from_millis(150),
        }
    }
}

struct SimState {
    entries: Vec<QueueEntry>,
    index: usize,
    active: bool,
    playing: bool,
    rate: f64,
    /// Position at `base_at`
    base_ms: f64,
    base_at: Instant,
}

impl SimState {
    fn position_ms(&self) -> f64 {
        if self.playing {
            self.base_ms + self.base_at.elapsed().as_secs_f64() * 1000.0 * self.rate
        } else {
            self.base_ms
        }
    }

    /// Freeze the current position as the new base
    fn rebase(&mut self) {
        self.base_ms = self.position_ms();
        self.base_at = Instant::now();
    }

    fn jump_to(&mut self, position_ms: f64) {
        self.base_ms = position_ms.max(0.0);
        self.base_at = Instant::now();
    }
}

pub struct SimulatedPlayer {
    state: Mutex<SimState>,
    sink: PlayerEventSink,
    timing: SimTiming,
}

impl SimulatedPlayer {
    pub fn new(sink: PlayerEventSink, timing: SimTiming) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState {
                entries: Vec::new(),
                index: 0,
                active: false,
                playing: false,
                rate: 1.0,
                base_ms: 0.0,
                base_at: Instant::now(),
            }),
            sink,
            timing,
        })
    }

    /// Report the position while playing, until the session goes away
    pub fn spawn_ticker(self: &Arc<Self>) {
        let player = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TIME_UPDATE_INTERVAL);
            loop {
                interval.tick().await;
                let update = {
                    let state = player.state.lock();
                    state.playing.then(|| state.position_ms())
                };
                if let Some(position_ms) = update {
                    if !player.sink.emit(PlayerEvent::TimeUpdate { position_ms }) {
                        debug!("Session gone, stopping simulated player ticker");
                        break;
                    }
                }
            }
        });
    }

    pub fn position_ms(&self) -> f64 {
        self.state.lock().position_ms()
    }

    pub fn rate(&self) -> f64 {
        self.state.lock().rate
    }

    /// Title of the item being played
    pub fn current_title(&self) -> Option<String> {
        let state = self.state.lock();
        if !state.active {
            return None;
        }
        state.entries.get(state.index).map(|e| {
            if e.media.name.is_empty() {
                e.item_id.clone()
            } else {
                e.media.name.clone()
            }
        })
    }

    /// Emit an event after a simulated delay
    fn emit_after(&self, delay: Duration, event: PlayerEvent) {
        let sink = self.sink.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sink.emit(event);
        });
    }
}

#[async_trait]
impl LocalPlayer for SimulatedPlayer {
    fn kind(&self) -> PlayerKind {
        PlayerKind::Video
    }

    fn is_playback_active(&self) -> bool {
        self.state.lock().active
    }

    fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    async fn current_time(&self) -> Result<Millis, PlayerError> {
        Ok(self.position_ms().round() as Millis)
    }

    fn has_playback_rate(&self) -> bool {
        true
    }

    async fn set_playback_rate(&self, rate: f64) -> Result<(), PlayerError> {
        if !rate.is_finite() || rate <= 0.0 {
            return Err(PlayerError::Engine(format!("invalid rate {}", rate)));
        }
        let mut state = self.state.lock();
        state.rebase();
        state.rate = rate;
        Ok(())
    }

    async fn local_play(&self, request: PlayRequest) -> Result<(), PlayerError> {
        if request.start_index >= request.entries.len() {
            return Err(PlayerError::Engine("start index outside the queue".to_string()));
        }
        {
            let mut state = self.state.lock();
            state.entries = request.entries;
            state.index = request.start_index;
            state.active = true;
            state.playing = true;
            state.jump_to(ticks_to_ms(request.start_position_ticks));
        }
        self.emit_after(self.timing.load, PlayerEvent::PlaybackStart);
        Ok(())
    }

    async fn local_pause(&self) -> Result<(), PlayerError> {
        {
            let mut state = self.state.lock();
            state.rebase();
            state.playing = false;
        }
        self.sink.emit(PlayerEvent::Pause);
        Ok(())
    }

    async fn local_unpause(&self) -> Result<(), PlayerError> {
        {
            let mut state = self.state.lock();
            state.rebase();
            state.playing = true;
        }
        self.sink.emit(PlayerEvent::Unpause);
        Ok(())
    }

    async fn local_seek(&self, position_ticks: Ticks) -> Result<(), PlayerError> {
        self.state.lock().jump_to(ticks_to_ms(position_ticks));
        self.sink.emit(PlayerEvent::Buffering);
        self.emit_after(self.timing.seek, PlayerEvent::Ready);
        Ok(())
    }

    async fn local_stop(&self) -> Result<(), PlayerError> {
        {
            let mut state = self.state.lock();
            state.active = false;
            state.playing = false;
            state.rate = 1.0;
            state.jump_to(0.0);
        }
        self.sink.emit(PlayerEvent::PlaybackStop);
        Ok(())
    }

    async fn local_set_current_playlist_item(&self, playlist_item_id: &str) -> Result<(), PlayerError> {
        {
            let mut state = self.state.lock();
            let index = state
                .entries
                .iter()
                .position(|e| e.playlist_item_id == playlist_item_id)
                .ok_or_else(|| PlayerError::Engine(format!("{} is not loaded", playlist_item_id)))?;
            state.index = index;
            state.active = true;
            state.playing = true;
            state.jump_to(0.0);
        }
        self.emit_after(self.timing.load, PlayerEvent::PlaybackStart);
        Ok(())
    }
}

/// Ticks of a millisecond position, for seeks typed by the user
pub fn seek_target(position_ms: f64, delta_ms: f64) -> Ticks {
    ms_to_ticks((position_ms + delta_ms).max(0.0))
}
