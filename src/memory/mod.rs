//! 记忆层：会话草稿本（只追加日志 + 写时复制分支）、对话消息、长期检索

pub mod branch;
pub mod clock;
pub mod conversation;
pub mod entry;
pub mod long_term;
pub mod scratchpad;

pub use branch::{BranchManager, CommitSummary};
pub use clock::{Clock, ManualClock, SystemClock};
pub use conversation::{Message, Role};
pub use entry::{
    Content, Entry, EntryFilter, MetaValue, Metadata, NewEntry, SequenceNo, SessionId, RELATED_KEY,
};
pub use long_term::{InMemoryLongTerm, LongTermMemory, NoopLongTerm, SearchError, SearchHit};
pub use scratchpad::{SessionStatus, SessionStore};
