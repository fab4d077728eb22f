use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::signaling::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipantRole {
    Tutor,
    Student,
}

/// Where a participant stands in the session's approval flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

/// One entry of a session roster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub user_name: String,
    pub role: ParticipantRole,
    pub joined_at: DateTime<Utc>,
    pub approval_status: ApprovalStatus,
}

impl Participant {
    /// A participant admitted to the live room right now.
    pub fn joining(user_id: UserId, user_name: impl Into<String>, role: ParticipantRole) -> Self {
        Self {
            user_id,
            user_name: user_name.into(),
            role,
            joined_at: Utc::now(),
            approval_status: ApprovalStatus::Approved,
        }
    }
}
