use std::fmt;

use serde::{Deserialize, Serialize};

/// Connection state of a school's gateway instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum InstanceStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
        }
    }

    /// `connecting` and `connected` hold a live gateway session.
    pub fn holds_session(&self) -> bool {
        matches!(self, Self::Connecting | Self::Connected)
    }

    /// Polling stops once one of these is reached.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Connected | Self::Error | Self::Disconnected)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }
}

/// Delivery status of a message.
///
/// Ordered `pending < sent < delivered < read`. `failed` sits outside the
/// order: it can be reached from any state that is not `read`, and nothing
/// leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    /// Position in the forward order, `None` for `failed`.
    pub fn rank(&self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Sent => Some(1),
            Self::Delivered => Some(2),
            Self::Read => Some(3),
            Self::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Read | Self::Failed)
    }

    /// Whether moving from `self` to `next` is a forward transition.
    pub fn can_advance_to(&self, next: MessageStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (Some(current), Some(next)) => next > current,
            (None, _) => false,
        }
    }

    /// Inbound messages in one of these states count as unread.
    pub fn is_unread(&self) -> bool {
        matches!(self, Self::Sent | Self::Delivered)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
