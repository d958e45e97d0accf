//! Wire-format events exchanged with collaboration clients.
//!
//! Every message on the socket is a JSON envelope `{"type": ..., "payload": ...}`.
//! The envelope tag is decoded first and the payload is decoded into the
//! matching concrete type, so a mismatched payload fails cleanly instead of
//! being probed field by field.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{NoteId, ThreadId, UserId};

/// A note as carried by content events.
///
/// This mirrors what the CRUD layer returns to clients; the hub relays it
/// verbatim and never inspects `content`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: NoteId,
    pub thread_id: ThreadId,
    pub user_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Client → server messages.
///
/// The originating user is never trusted from the payload; it is attached
/// from the authenticated connection identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientEvent {
    ThreadJoin { thread_id: ThreadId },
    ThreadLeave { thread_id: ThreadId },
    NoteAdd { thread_id: ThreadId, note: Note },
    NoteUpdate { thread_id: ThreadId, note: Note },
    NoteDelete { thread_id: ThreadId, note_id: NoteId },
    UserTyping { thread_id: ThreadId, is_typing: bool },
}

/// Server → client messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    UserJoined { thread_id: ThreadId, user_id: UserId },
    UserLeft { thread_id: ThreadId, user_id: UserId },
    NoteAdded { thread_id: ThreadId, note: Note },
    NoteUpdated { thread_id: ThreadId, note: Note },
    NoteDeleted { thread_id: ThreadId, note_id: NoteId },
    UserTyping { thread_id: ThreadId, user_id: UserId, is_typing: bool },
}
