//! Notification rows and their resolved, display-ready form.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::{CommentId, NotificationId, UserId, VideoId};

/// What triggered a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    /// A video was published in the user's system.
    NewVideo,
    /// Someone replied to one of the user's comments.
    CommentReply,
    /// Someone commented on a video the user owns.
    NewComment,
}

/// A raw `notifications` row as stored by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: NotificationId,
    pub user_id: UserId,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub video_id: Option<VideoId>,
    #[serde(default)]
    pub comment_id: Option<CommentId>,
    #[serde(default)]
    pub related_user_id: Option<UserId>,
    #[serde(default)]
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

/// Video reference resolved from the `videos` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRef {
    pub id: VideoId,
    #[serde(rename = "titulo")]
    pub title: String,
    #[serde(rename = "sistema", default)]
    pub system: Option<String>,
}

/// User reference resolved from the `profiles` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedUser {
    pub id: UserId,
    #[serde(default)]
    pub full_name: Option<String>,
}

/// A notification with its video and user references resolved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: NotificationId,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub video: Option<VideoRef>,
    pub related_user: Option<RelatedUser>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    /// Attach resolved references to a raw record.
    #[must_use]
    pub fn from_record(
        record: NotificationRecord,
        video: Option<VideoRef>,
        related_user: Option<RelatedUser>,
    ) -> Self {
        Self {
            id: record.id,
            kind: record.kind,
            title: record.title,
            message: record.message,
            video,
            related_user,
            read: record.read,
            created_at: record.created_at,
        }
    }
}

/// Point-in-time view of the notification cache handed to UI collaborators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NotificationSnapshot {
    /// Cached notifications, most recent first.
    pub notifications: Vec<Notification>,
    /// Number of cached notifications with `read == false`.
    pub unread_count: usize,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_record_deserializes_backend_row() {
        let json = r#"{
            "id": "0b7c7d2e-7c1f-4f9a-8a53-7d2f1c0e9b11",
            "user_id": "5a0e5b8c-2d4f-4c6b-9f0a-3b1d2e4f6a7c",
            "type": "comment_reply",
            "title": "Nova resposta",
            "message": "Alguém respondeu ao seu comentário",
            "video_id": null,
            "comment_id": "9d3a6c1e-1b2f-4e8d-a7c5-6f4e3d2c1b0a",
            "related_user_id": null,
            "read": false,
            "created_at": "2026-03-14T12:30:00Z"
        }"#;
        let record: NotificationRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.kind, NotificationKind::CommentReply);
        assert!(record.video_id.is_none());
        assert!(record.comment_id.is_some());
        assert!(!record.read);
    }

    #[test]
    fn test_video_ref_uses_backend_column_names() {
        let json = r#"{"id":"0b7c7d2e-7c1f-4f9a-8a53-7d2f1c0e9b11","titulo":"Intro","sistema":"ERP"}"#;
        let video: VideoRef = serde_json::from_str(json).unwrap();
        assert_eq!(video.title, "Intro");
        assert_eq!(video.system.as_deref(), Some("ERP"));
    }
}
