use std::fmt::{Display, Formatter};

use cadence_core::{AppError, AppResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of this process inside a coordination group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a random node identifier.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Creates a node identifier from an existing value.
    pub fn parse(value: impl Into<String>) -> AppResult<Self> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(AppError::Validation("node id must not be empty".to_owned()));
        }

        Ok(Self(value))
    }

    /// Returns the identifier as stored in lease records.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Default for NodeId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for NodeId {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.0.as_str())
    }
}

/// Fencing token proving ownership of one lock acquisition.
///
/// A token is minted per acquisition attempt and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseToken(String);

impl LeaseToken {
    /// Mints a fresh token.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the token as stored in lease records.
    #[must_use]
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Default for LeaseToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for LeaseToken {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.0.as_str())
    }
}

/// Ownership state of one lock handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockState {
    /// Not held: the lease was lost to expiry or another holder.
    Unlocked,
    /// Held and being renewed.
    Locked,
    /// Released by its holder.
    Released,
}

impl LockState {
    /// Returns stable state value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unlocked => "unlocked",
            Self::Locked => "locked",
            Self::Released => "released",
        }
    }
}

/// Process-wide lifecycle of the distributed scheduler.
///
/// Transitions only move forward: `Init -> Pending -> Started -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorState {
    /// Nothing scheduled yet.
    Init,
    /// Jobs scheduled, engine not started.
    Pending,
    /// Engine dispatching.
    Started,
    /// Engine stopped for good.
    Stopped,
}

impl CoordinatorState {
    /// Returns true when `next` is the single allowed successor of `self`.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Init, Self::Pending)
                | (Self::Pending, Self::Started)
                | (Self::Started, Self::Stopped)
        )
    }

    /// Returns stable state value.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Pending => "pending",
            Self::Started => "started",
            Self::Stopped => "stopped",
        }
    }
}

impl Display for CoordinatorState {
    fn fmt(&self, formatter: &mut Formatter<'_>) -> std::fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::{CoordinatorState, LeaseToken, NodeId};

    #[test]
    fn lease_tokens_are_unique_per_mint() {
        assert_ne!(LeaseToken::new(), LeaseToken::new());
    }

    #[test]
    fn node_id_rejects_blank_value() {
        assert!(NodeId::parse(" ").is_err());
        assert!(NodeId::parse("node-a").is_ok());
    }

    #[test]
    fn coordinator_state_is_monotonic() {
        use CoordinatorState::{Init, Pending, Started, Stopped};

        assert!(Init.can_transition_to(Pending));
        assert!(Pending.can_transition_to(Started));
        assert!(Started.can_transition_to(Stopped));

        assert!(!Started.can_transition_to(Pending));
        assert!(!Init.can_transition_to(Started));
        assert!(!Stopped.can_transition_to(Init));
        assert!(!Pending.can_transition_to(Pending));
    }
}
