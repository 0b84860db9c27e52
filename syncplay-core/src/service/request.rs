//! Outbound requests to the coordination service

use serde_json::{json, Value};

use super::types::{BufferingReport, RepeatMode, ShuffleMode};
use crate::time::{iso8601, Ticks};

/// Where queued items are inserted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueMode {
    /// Append to the end of the queue
    Queue,
    /// Insert after the playing item
    QueueNext,
}

/// Every request this client sends besides probes and fetches
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceRequest {
    /// Latest one-way latency estimate
    Ping { ping_ms: f64 },
    /// Ready or buffering, depending on `report.is_buffering`
    Buffering(BufferingReport),
    Unpause,
    Pause,
    Stop,
    Seek { position_ticks: Ticks },
    SetNewQueue {
        item_ids: Vec<String>,
        start_index: usize,
        start_position_ticks: Ticks,
    },
    Queue { item_ids: Vec<String>, mode: QueueMode },
    RemoveFromPlaylist { playlist_item_ids: Vec<String> },
    MovePlaylistItem { playlist_item_id: String, new_index: usize },
    SetCurrentItem { playlist_item_id: String },
    NextItem { playlist_item_id: String },
    PreviousItem { playlist_item_id: String },
    SetRepeatMode(RepeatMode),
    SetShuffleMode(ShuffleMode),
    /// Whether the group should stop waiting for this client
    SetIgnoreWait(bool),
}

impl ServiceRequest {
    /// Short name for logs
    pub fn name(&self) -> &'static str {
        match self {
            ServiceRequest::Ping { .. } => "Ping",
            ServiceRequest::Buffering(report) if report.is_buffering => "Buffering",
            ServiceRequest::Buffering(_) => "Ready",
            ServiceRequest::Unpause => "Unpause",
            ServiceRequest::Pause => "Pause",
            ServiceRequest::Stop => "Stop",
            ServiceRequest::Seek { .. } => "Seek",
            ServiceRequest::SetNewQueue { .. } => "SetNewQueue",
            ServiceRequest::Queue { .. } => "Queue",
            ServiceRequest::RemoveFromPlaylist { .. } => "RemoveFromPlaylist",
            ServiceRequest::MovePlaylistItem { .. } => "MovePlaylistItem",
            ServiceRequest::SetCurrentItem { .. } => "SetPlaylistItem",
            ServiceRequest::NextItem { .. } => "NextItem",
            ServiceRequest::PreviousItem { .. } => "PreviousItem",
            ServiceRequest::SetRepeatMode(_) => "SetRepeatMode",
            ServiceRequest::SetShuffleMode(_) => "SetShuffleMode",
            ServiceRequest::SetIgnoreWait(_) => "SetIgnoreWait",
        }
    }

    /// Endpoint path relative to the service base URL
    pub fn path(&self) -> String {
        format!("/SyncPlay/{}", self.name())
    }

    /// JSON body, if the endpoint takes one
    pub fn body(&self) -> Option<Value> {
        match self {
            ServiceRequest::Ping { ping_ms } => Some(json!({ "Ping": ping_ms.round() as i64 })),
            ServiceRequest::Buffering(report) => Some(json!({
                "When": iso8601_string(report.when),
                "PositionTicks": report.position_ticks,
                "IsPlaying": report.is_playing,
                "PlaylistItemId": report.playlist_item_id,
            })),
            ServiceRequest::Unpause | ServiceRequest::Pause | ServiceRequest::Stop => None,
            ServiceRequest::Seek { position_ticks } => Some(json!({ "PositionTicks": position_ticks })),
            ServiceRequest::SetNewQueue {
                item_ids,
                start_index,
                start_position_ticks,
            } => Some(json!({
                "PlayingQueue": item_ids,
                "PlayingItemPosition": start_index,
                "StartPositionTicks": start_position_ticks,
            })),
            ServiceRequest::Queue { item_ids, mode } => Some(json!({
                "ItemIds": item_ids,
                "Mode": match mode {
                    QueueMode::Queue => "Queue",
                    QueueMode::QueueNext => "QueueNext",
                },
            })),
            ServiceRequest::RemoveFromPlaylist { playlist_item_ids } => {
                Some(json!({ "PlaylistItemIds": playlist_item_ids }))
            }
            ServiceRequest::MovePlaylistItem {
                playlist_item_id,
                new_index,
            } => Some(json!({ "PlaylistItemId": playlist_item_id, "NewIndex": new_index })),
            ServiceRequest::SetCurrentItem { playlist_item_id }
            | ServiceRequest::NextItem { playlist_item_id }
            | ServiceRequest::PreviousItem { playlist_item_id } => {
                Some(json!({ "PlaylistItemId": playlist_item_id }))
            }
            ServiceRequest::SetRepeatMode(mode) => Some(json!({ "Mode": mode })),
            ServiceRequest::SetShuffleMode(mode) => Some(json!({ "Mode": mode })),
            ServiceRequest::SetIgnoreWait(ignore) => Some(json!({ "IgnoreWait": ignore })),
        }
    }
}

fn iso8601_string(ms: i64) -> Value {
    iso8601::serialize(&ms, serde_json::value::Serializer).unwrap_or(Value::Null)
}
