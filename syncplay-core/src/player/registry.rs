//! Player registry
//!
//! Adapters are registered under a [`PlayerKind`]. The session binds one kind
//! at a time; when nothing is bound it talks to [`NoActivePlayer`].

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::{LocalPlayer, PlayRequest, PlayerError};
use crate::time::{Millis, Ticks};

/// Closed set of player variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlayerKind {
    /// Placeholder when no engine is bound
    NoActive,
    /// In-process video engine
    Video,
    /// In-process audio engine
    Audio,
    /// Engine on another device controlled over the network
    Remote,
}

impl PlayerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerKind::NoActive => "none",
            PlayerKind::Video => "video",
            PlayerKind::Audio => "audio",
            PlayerKind::Remote => "remote",
        }
    }
}

/// Adapter used when no player is bound. Every operation succeeds and does nothing.
#[derive(Debug, Default)]
pub struct NoActivePlayer;

#[async_trait]
impl LocalPlayer for NoActivePlayer {
    fn kind(&self) -> PlayerKind {
        PlayerKind::NoActive
    }

    fn is_playback_active(&self) -> bool {
        false
    }

    fn is_playing(&self) -> bool {
        false
    }

    async fn current_time(&self) -> Result<Millis, PlayerError> {
        Ok(0)
    }

    async fn local_play(&self, _request: PlayRequest) -> Result<(), PlayerError> {
        Ok(())
    }

    async fn local_pause(&self) -> Result<(), PlayerError> {
        Ok(())
    }

    async fn local_unpause(&self) -> Result<(), PlayerError> {
        Ok(())
    }

    async fn local_seek(&self, _position_ticks: Ticks) -> Result<(), PlayerError> {
        Ok(())
    }

    async fn local_stop(&self) -> Result<(), PlayerError> {
        Ok(())
    }
}

/// Adapters by kind
pub struct PlayerRegistry {
    adapters: HashMap<PlayerKind, Arc<dyn LocalPlayer>>,
    fallback: Arc<dyn LocalPlayer>,
}

impl PlayerRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
            fallback: Arc::new(NoActivePlayer),
        }
    }

    /// Register an adapter under its own kind, replacing any previous one
    pub fn register(&mut self, adapter: Arc<dyn LocalPlayer>) {
        let kind = adapter.kind();
        debug!("Registered {} player", kind.as_str());
        self.adapters.insert(kind, adapter);
    }

    pub fn unregister(&mut self, kind: PlayerKind) -> Option<Arc<dyn LocalPlayer>> {
        self.adapters.remove(&kind)
    }

    /// Adapter for a kind, or the no-op adapter
    pub fn resolve(&self, kind: Option<PlayerKind>) -> Arc<dyn LocalPlayer> {
        kind.and_then(|k| self.adapters.get(&k))
            .cloned()
            .unwrap_or_else(|| Arc::clone(&self.fallback))
    }

    pub fn kinds(&self) -> Vec<PlayerKind> {
        self.adapters.keys().copied().collect()
    }
}

impl Default for PlayerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry shared between the session handle and the session task
pub type SharedPlayerRegistry = Arc<RwLock<PlayerRegistry>>;

pub fn new_shared_registry() -> SharedPlayerRegistry {
    Arc::new(RwLock::new(PlayerRegistry::new()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockPlayer;

    #[test]
    fn test_unbound_resolves_to_noop() {
        let registry = PlayerRegistry::new();
        assert_eq!(registry.resolve(None).kind(), PlayerKind::NoActive);
        assert_eq!(registry.resolve(Some(PlayerKind::Video)).kind(), PlayerKind::NoActive);
    }

    #[test]
    fn test_register_and_resolve() {
        let mut registry = PlayerRegistry::new();
        registry.register(MockPlayer::new(PlayerKind::Audio));

        assert_eq!(registry.resolve(Some(PlayerKind::Audio)).kind(), PlayerKind::Audio);
        assert_eq!(registry.kinds(), vec![PlayerKind::Audio]);

        registry.unregister(PlayerKind::Audio);
        assert_eq!(registry.resolve(Some(PlayerKind::Audio)).kind(), PlayerKind::NoActive);
    }

    #[tokio::test]
    async fn test_noop_player_accepts_everything() {
        let player = NoActivePlayer;
        assert!(!player.is_playback_active());
        assert!(player.local_seek(10).await.is_ok());
        assert_eq!(player.set_playback_rate(1.5).await, Err(PlayerError::FeatureNotSupported));
    }
}
