//! Scripted player and service used by the unit tests

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::player::{LocalPlayer, PlayRequest, PlayerError, PlayerKind};
use crate::service::{GroupService, JoinedState, MediaItem, ServiceError, ServiceRequest, TimeProbe};
use crate::time::{LocalClock, Millis, Ticks, TICKS_PER_MS};

/// A call the session made on the player
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerCall {
    Play { start_index: usize, start_position_ticks: Ticks },
    Pause,
    Unpause,
    Seek(Ticks),
    Stop,
    SetRate(f64),
    SetCurrentItem(String),
    QueueRefreshed,
}

#[derive(Debug)]
struct MockPlayerState {
    active: bool,
    playing: bool,
    position_ms: Millis,
    has_rate: bool,
    fail_play: bool,
    calls: Vec<PlayerCall>,
}

/// Player that records every call. Transport calls update its state the way
/// a real engine would, minus the time passing.
#[derive(Debug)]
pub struct MockPlayer {
    kind: PlayerKind,
    state: Mutex<MockPlayerState>,
}

impl MockPlayer {
    pub fn new(kind: PlayerKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            state: Mutex::new(MockPlayerState {
                active: true,
                playing: false,
                position_ms: 0,
                has_rate: false,
                fail_play: false,
                calls: Vec::new(),
            }),
        })
    }

    pub fn calls(&self) -> Vec<PlayerCall> {
        self.state.lock().calls.clone()
    }

    pub fn take_calls(&self) -> Vec<PlayerCall> {
        std::mem::take(&mut self.state.lock().calls)
    }

    pub fn set_active(&self, active: bool) {
        self.state.lock().active = active;
    }

    pub fn set_playing(&self, playing: bool) {
        self.state.lock().playing = playing;
    }

    pub fn set_position_ms(&self, position_ms: Millis) {
        self.state.lock().position_ms = position_ms;
    }

    pub fn set_has_rate(&self, has_rate: bool) {
        self.state.lock().has_rate = has_rate;
    }

    pub fn set_fail_play(&self, fail: bool) {
        self.state.lock().fail_play = fail;
    }

    fn record(&self, call: PlayerCall) {
        self.state.lock().calls.push(call);
    }
}

#[async_trait]
impl LocalPlayer for MockPlayer {
    fn kind(&self) -> PlayerKind {
        self.kind
    }

    fn is_playback_active(&self) -> bool {
        self.state.lock().active
    }

    fn is_playing(&self) -> bool {
        self.state.lock().playing
    }

    fn is_remote(&self) -> bool {
        self.kind == PlayerKind::Remote
    }

    async fn current_time(&self) -> Result<Millis, PlayerError> {
        Ok(self.state.lock().position_ms)
    }

    fn has_playback_rate(&self) -> bool {
        self.state.lock().has_rate
    }

    async fn set_playback_rate(&self, rate: f64) -> Result<(), PlayerError> {
        if !self.has_playback_rate() {
            return Err(PlayerError::FeatureNotSupported);
        }
        self.record(PlayerCall::SetRate(rate));
        Ok(())
    }

    async fn local_play(&self, request: PlayRequest) -> Result<(), PlayerError> {
        self.record(PlayerCall::Play {
            start_index: request.start_index,
            start_position_ticks: request.start_position_ticks,
        });
        let mut state = self.state.lock();
        if state.fail_play {
            return Err(PlayerError::Engine("cannot open media".to_string()));
        }
        state.active = true;
        state.position_ms = request.start_position_ticks / TICKS_PER_MS;
        Ok(())
    }

    async fn local_pause(&self) -> Result<(), PlayerError> {
        self.record(PlayerCall::Pause);
        self.state.lock().playing = false;
        Ok(())
    }

    async fn local_unpause(&self) -> Result<(), PlayerError> {
        self.record(PlayerCall::Unpause);
        self.state.lock().playing = true;
        Ok(())
    }

    async fn local_seek(&self, position_ticks: Ticks) -> Result<(), PlayerError> {
        self.record(PlayerCall::Seek(position_ticks));
        self.state.lock().position_ms = position_ticks / TICKS_PER_MS;
        Ok(())
    }

    async fn local_stop(&self) -> Result<(), PlayerError> {
        self.record(PlayerCall::Stop);
        let mut state = self.state.lock();
        state.playing = false;
        Ok(())
    }

    async fn local_set_current_playlist_item(&self, playlist_item_id: &str) -> Result<(), PlayerError> {
        self.record(PlayerCall::SetCurrentItem(playlist_item_id.to_string()));
        Ok(())
    }

    async fn on_queue_update(&self) -> Result<(), PlayerError> {
        self.record(PlayerCall::QueueRefreshed);
        Ok(())
    }
}

/// Coordination service whose clock runs `offset_ms` ahead of the local one
/// and answers instantly.
pub struct MockService {
    clock: LocalClock,
    offset_ms: Millis,
    failing_probes: AtomicUsize,
    requests: Mutex<Vec<ServiceRequest>>,
    joined_state: Mutex<Option<JoinedState>>,
    fetch_count: AtomicUsize,
    fetch_delay: Mutex<Option<Duration>>,
    fail_resolve: AtomicBool,
}

impl MockService {
    pub fn new(clock: LocalClock, offset_ms: Millis) -> Self {
        Self {
            clock,
            offset_ms,
            failing_probes: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
            joined_state: Mutex::new(Some(JoinedState::NotMember)),
            fetch_count: AtomicUsize::new(0),
            fetch_delay: Mutex::new(None),
            fail_resolve: AtomicBool::new(false),
        }
    }

    /// Make the next `n` probes fail
    pub fn fail_probes(&self, n: usize) {
        self.failing_probes.store(n, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<ServiceRequest> {
        self.requests.lock().clone()
    }

    pub fn take_requests(&self) -> Vec<ServiceRequest> {
        std::mem::take(&mut *self.requests.lock())
    }

    /// Names of the recorded requests, pings excluded
    pub fn request_names(&self) -> Vec<&'static str> {
        self.requests
            .lock()
            .iter()
            .map(|r| r.name())
            .filter(|name| *name != "Ping")
            .collect()
    }

    /// Answer for joined-state fetches; `None` makes them fail
    pub fn set_joined_state(&self, state: Option<JoinedState>) {
        *self.joined_state.lock() = state;
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = Some(delay);
    }

    pub fn set_fail_resolve(&self, fail: bool) {
        self.fail_resolve.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl GroupService for MockService {
    async fn probe_time(&self) -> Result<TimeProbe, ServiceError> {
        let failing = self.failing_probes.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_probes.store(failing - 1, Ordering::SeqCst);
            return Err(ServiceError::NotReachable);
        }

        let now = self.clock.now_ms() + self.offset_ms;
        Ok(TimeProbe {
            request_received: now,
            response_sent: now,
        })
    }

    async fn send(&self, request: ServiceRequest) -> Result<(), ServiceError> {
        self.requests.lock().push(request);
        Ok(())
    }

    async fn fetch_joined_state(&self) -> Result<JoinedState, ServiceError> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.joined_state
            .lock()
            .clone()
            .ok_or_else(|| ServiceError::Api("joined state unavailable".to_string()))
    }

    async fn resolve_items(&self, item_ids: &[String]) -> Result<Vec<MediaItem>, ServiceError> {
        if self.fail_resolve.load(Ordering::SeqCst) {
            return Err(ServiceError::NotReachable);
        }

        Ok(item_ids
            .iter()
            .map(|id| MediaItem {
                id: id.clone(),
                name: format!("Item {}", id),
                run_time_ticks: Some(3 * 60 * 1000 * TICKS_PER_MS),
                media_type: Some("Audio".to_string()),
            })
            .collect())
    }
}
