//! Chat threads and reply turns.

pub mod coordinator;
pub mod responder;
pub mod types;

pub use coordinator::{CHAT_REBUILD, CHAT_RESPOND, ChatCoordinator, THREAD_ENTITY, thread_entity};
pub use responder::ChatResponder;
pub use types::{ChatMessage, ChatThread, ChatTurn, MessageRole, MessageStatus, SentTurn};
