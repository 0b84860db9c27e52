//! Group queue state
//!
//! Holds the resolved playlist the group is playing. Every accepted update
//! replaces the whole sequence; entries are never edited in place.

use thiserror::Error;
use tracing::{debug, info};

use crate::service::{
    MediaItem, PlayQueueUpdate, QueueUpdateReason, RepeatMode, ShuffleMode,
};
use crate::time::{Millis, Ticks};

/// One occurrence of an item in the queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub item_id: String,
    /// Unique per occurrence; the same item may appear several times
    pub playlist_item_id: String,
    pub media: MediaItem,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue update from {update} is not newer than {current}")]
    Stale { update: Millis, current: Millis },

    #[error("Resolved {resolved} items for a playlist of {expected}")]
    Incomplete { expected: usize, resolved: usize },
}

/// Local follow-up an accepted update requires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueAction {
    /// (Re)start local playback from the queue
    StartPlayback,
    /// Switch the player to this playlist item
    SwitchItem(String),
    /// The playing item was removed and nothing replaces it
    StopPlayback,
    /// Only the view of the queue changed
    RefreshView,
    SetRepeatMode(RepeatMode),
    SetShuffleMode(ShuffleMode),
}

#[derive(Debug, Default)]
pub struct QueueCore {
    last_update: Option<Millis>,
    entries: Vec<QueueEntry>,
    playing_index: Option<usize>,
    start_position_ticks: Ticks,
    is_playing: bool,
    repeat_mode: RepeatMode,
    shuffle_mode: ShuffleMode,
}

impl QueueCore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an update would be accepted
    pub fn is_newer(&self, update: &PlayQueueUpdate) -> bool {
        self.last_update.map_or(true, |current| update.last_update > current)
    }

    /// Replace the queue with a resolved update.
    ///
    /// `items` must be the catalog entries for `update.playlist`, in order.
    /// Staleness is checked again here since another update may have been
    /// accepted while the items were being resolved.
    pub fn apply(&mut self, update: PlayQueueUpdate, items: Vec<MediaItem>) -> Result<QueueAction, QueueError> {
        if let Some(current) = self.last_update {
            if update.last_update <= current {
                return Err(QueueError::Stale {
                    update: update.last_update,
                    current,
                });
            }
        }

        if items.len() != update.playlist.len() {
            return Err(QueueError::Incomplete {
                expected: update.playlist.len(),
                resolved: items.len(),
            });
        }

        let previous = self.current_playlist_item_id().map(str::to_owned);

        let entries: Vec<QueueEntry> = update
            .playlist
            .into_iter()
            .zip(items)
            .map(|(item, media)| QueueEntry {
                item_id: item.item_id,
                playlist_item_id: item.playlist_item_id,
                media,
            })
            .collect();

        let playing_index = usize::try_from(update.playing_item_index)
            .ok()
            .filter(|i| *i < entries.len());

        self.entries = entries;
        self.playing_index = playing_index;
        self.last_update = Some(update.last_update);
        self.start_position_ticks = update.start_position_ticks;
        self.is_playing = update.is_playing;
        self.repeat_mode = update.repeat_mode;
        self.shuffle_mode = update.shuffle_mode;

        let current = self.current_playlist_item_id().map(str::to_owned);
        info!(
            "Queue updated ({:?}): {} entries, playing={:?}",
            update.reason,
            self.entries.len(),
            current
        );

        let action = match update.reason {
            QueueUpdateReason::NewPlaylist => QueueAction::StartPlayback,
            QueueUpdateReason::SetCurrentItem
            | QueueUpdateReason::NextItem
            | QueueUpdateReason::PreviousItem => match current {
                Some(id) => QueueAction::SwitchItem(id),
                None => QueueAction::StopPlayback,
            },
            QueueUpdateReason::RemoveItems => match current {
                None => QueueAction::StopPlayback,
                Some(id) if previous.as_deref() != Some(id.as_str()) => QueueAction::SwitchItem(id),
                Some(_) => QueueAction::RefreshView,
            },
            QueueUpdateReason::MoveItem | QueueUpdateReason::Queue | QueueUpdateReason::QueueNext => {
                QueueAction::RefreshView
            }
            QueueUpdateReason::RepeatMode => QueueAction::SetRepeatMode(self.repeat_mode),
            QueueUpdateReason::ShuffleMode => QueueAction::SetShuffleMode(self.shuffle_mode),
        };

        debug!("Queue action: {:?}", action);
        Ok(action)
    }

    /// Forget everything (session teardown)
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn current_playlist_item_id(&self) -> Option<&str> {
        self.playing_index
            .and_then(|i| self.entries.get(i))
            .map(|e| e.playlist_item_id.as_str())
    }

    pub fn current_index(&self) -> Option<usize> {
        self.playing_index
    }

    pub fn playlist(&self) -> Vec<QueueEntry> {
        self.entries.clone()
    }

    #[cfg(test)]
    fn item_ids(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.item_id.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn repeat_mode(&self) -> RepeatMode {
        self.repeat_mode
    }

    pub fn shuffle_mode(&self) -> ShuffleMode {
        self.shuffle_mode
    }

    /// Service time of the accepted update
    pub fn last_update(&self) -> Option<Millis> {
        self.last_update
    }

    /// Position the group was at when the queue was last updated
    pub fn start_position_ticks(&self) -> Ticks {
        self.start_position_ticks
    }

    /// Whether the group was playing when the queue was last updated
    pub fn is_playing(&self) -> bool {
        self.is_playing
    }
}
