//! Explicit request context.

use serde::{Deserialize, Serialize};

use crate::id::UserId;

/// Caller identity threaded through control-plane operations as a parameter.
///
/// The owner id is always required; the session id is informational and only
/// ends up in logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub user_id: UserId,
    pub session_id: Option<String>,
}

impl RequestContext {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn owner(&self) -> UserId {
        self.user_id
    }
}
