//! Channel naming.

use courseforge_core::{ThreadId, UserId};

/// Per-user channel: every job lifecycle event of the owner lands here.
pub fn user_channel(owner: UserId) -> String {
    format!("user:{owner}")
}

/// Per-thread channel used for chat turn events.
pub fn thread_channel(thread_id: ThreadId) -> String {
    format!("thread:{thread_id}")
}
