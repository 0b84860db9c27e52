//! Group-coordination service data types
//!
//! Field names follow the service's PascalCase JSON; timestamps are ISO-8601
//! strings on the wire and epoch milliseconds in memory.

use serde::{Deserialize, Serialize};

use crate::time::{iso8601, Millis, Ticks};

/// Transport command kinds issued by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandKind {
    Unpause,
    Pause,
    Stop,
    Seek,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Unpause => "Unpause",
            CommandKind::Pause => "Pause",
            CommandKind::Stop => "Stop",
            CommandKind::Seek => "Seek",
        }
    }
}

/// A timestamped transport command.
///
/// Two commands are duplicates when every field matches, including `when`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlaybackCommand {
    pub command: CommandKind,
    /// Service time at which the command takes effect
    #[serde(with = "iso8601")]
    pub when: Millis,
    /// Service time at which the command was issued
    #[serde(with = "iso8601")]
    pub emitted_at: Millis,
    #[serde(default)]
    pub position_ticks: Option<Ticks>,
    pub playlist_item_id: String,
}

/// Group playback state as seen by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GroupState {
    Idle,
    Waiting,
    Paused,
    Playing,
}

impl GroupState {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupState::Idle => "Idle",
            GroupState::Waiting => "Waiting",
            GroupState::Paused => "Paused",
            GroupState::Playing => "Playing",
        }
    }
}

/// Group description
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GroupInfo {
    pub group_id: String,
    pub group_name: String,
    pub state: GroupState,
    #[serde(default)]
    pub participants: Vec<String>,
    #[serde(with = "iso8601")]
    pub last_updated_at: Millis,
    /// Monotonic revision stamped by the service
    #[serde(default)]
    pub revision: u64,
}

/// One occurrence of a content item in the group queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct QueueItem {
    pub item_id: String,
    pub playlist_item_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RepeatMode {
    RepeatOne,
    RepeatAll,
    #[default]
    RepeatNone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ShuffleMode {
    #[default]
    Sorted,
    Shuffle,
}

/// Why the service sent a queue update
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueUpdateReason {
    NewPlaylist,
    SetCurrentItem,
    RemoveItems,
    MoveItem,
    Queue,
    QueueNext,
    NextItem,
    PreviousItem,
    RepeatMode,
    ShuffleMode,
}

/// Full queue state pushed by the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PlayQueueUpdate {
    pub reason: QueueUpdateReason,
    #[serde(with = "iso8601")]
    pub last_update: Millis,
    pub playlist: Vec<QueueItem>,
    /// Index of the playing entry, -1 when nothing is selected
    pub playing_item_index: i32,
    #[serde(default)]
    pub start_position_ticks: Ticks,
    #[serde(default)]
    pub is_playing: bool,
    #[serde(default)]
    pub shuffle_mode: ShuffleMode,
    #[serde(default)]
    pub repeat_mode: RepeatMode,
}

/// Group state transition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GroupStateUpdate {
    pub state: GroupState,
    /// Request type that caused the transition
    pub reason: String,
}

/// Push notifications about the group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "Type", content = "Data")]
pub enum GroupUpdate {
    PlayQueue(PlayQueueUpdate),
    UserJoined(String),
    UserLeft(String),
    GroupJoined(GroupInfo),
    GroupUpdate(GroupInfo),
    StateUpdate(GroupStateUpdate),
    NotInGroup(String),
    GroupLeft(String),
    GroupDoesNotExist(String),
    CreateGroupDenied(String),
    JoinGroupDenied(String),
    LibraryAccessDenied(String),
    SyncPlayIsDisabled(String),
}

/// Authoritative group state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct GroupSnapshot {
    pub group_info: GroupInfo,
    #[serde(default)]
    pub play_queue: Option<PlayQueueUpdate>,
    #[serde(default)]
    pub playing_command: Option<PlaybackCommand>,
}

impl GroupSnapshot {
    pub fn revision(&self) -> u64 {
        self.group_info.revision
    }
}

/// Result of a joined-state fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinedState {
    Member(GroupSnapshot),
    NotMember,
}

/// Service-side timestamps of a time probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeProbe {
    #[serde(rename = "RequestReceptionTime", with = "iso8601")]
    pub request_received: Millis,
    #[serde(rename = "ResponseTransmissionTime", with = "iso8601")]
    pub response_sent: Millis,
}

/// Playable item resolved from the content catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MediaItem {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub run_time_ticks: Option<Ticks>,
    #[serde(default)]
    pub media_type: Option<String>,
}

/// Client readiness, reported whenever the player buffers or becomes ready
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BufferingReport {
    #[serde(with = "iso8601")]
    pub when: Millis,
    pub position_ticks: Ticks,
    pub is_playing: bool,
    pub playlist_item_id: String,
    #[serde(skip)]
    pub is_buffering: bool,
}
