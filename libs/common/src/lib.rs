pub mod event;
pub mod id;

pub use event::{ClientEvent, Note, ServerEvent};
pub use id::{NoteId, ThreadId, UserId};
