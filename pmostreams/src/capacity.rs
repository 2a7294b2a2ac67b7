//! Admission of new workers against the broadcast server's source limit

use crate::error::{Result, StreamError};
use pmoicecast::IcecastController;
use serde::Serialize;
use std::sync::Arc;

/// Checks `active` against `limit`.
///
/// An unknown limit denies admission with `limit: 0`.
pub fn admit(limit: Option<u32>, active: u32) -> Result<()> {
    match limit {
        Some(limit) if active < limit => Ok(()),
        Some(limit) => Err(StreamError::CapacityExceeded { limit, active }),
        None => Err(StreamError::CapacityExceeded { limit: 0, active }),
    }
}

/// Source slots as seen from the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[cfg_attr(feature = "pmoserver", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct CapacitySnapshot {
    pub limit: Option<u32>,
    pub active: u32,
    pub remaining: u32,
}

impl CapacitySnapshot {
    pub fn new(limit: Option<u32>, active: u32) -> Self {
        Self {
            limit,
            active,
            remaining: limit.map(|l| l.saturating_sub(active)).unwrap_or(0),
        }
    }
}

/// Reads the source limit from the broadcast server controller.
#[derive(Clone)]
pub struct CapacityGate {
    controller: Arc<IcecastController>,
}

impl CapacityGate {
    pub fn new(controller: Arc<IcecastController>) -> Self {
        Self { controller }
    }

    /// Current source limit; `None` when not installed or unreadable.
    pub async fn limit(&self) -> Option<u32> {
        if !self.controller.installation().await.installed {
            return None;
        }
        self.controller.source_limit().await
    }

    pub async fn can_admit(&self, active: u32) -> Result<()> {
        admit(self.limit().await, active)
    }

    pub async fn snapshot(&self, active: u32) -> CapacitySnapshot {
        CapacitySnapshot::new(self.limit().await, active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_below_limit() {
        assert!(admit(Some(1), 0).is_ok());
        assert!(admit(Some(4), 3).is_ok());
    }

    #[test]
    fn test_deny_at_limit() {
        match admit(Some(1), 1) {
            Err(StreamError::CapacityExceeded { limit, active }) => {
                assert_eq!((limit, active), (1, 1));
            }
            other => panic!("expected CapacityExceeded, got {:?}", other),
        }
    }

    #[test]
    fn test_unknown_limit_fails_closed() {
        match admit(None, 2) {
            Err(StreamError::CapacityExceeded { limit, active }) => {
                assert_eq!((limit, active), (0, 2));
            }
            other => panic!("expected CapacityExceeded, got {:?}", other),
        }
    }

    #[test]
    fn test_snapshot_remaining() {
        assert_eq!(CapacitySnapshot::new(Some(4), 1).remaining, 3);
        assert_eq!(CapacitySnapshot::new(Some(1), 3).remaining, 0);
        assert_eq!(CapacitySnapshot::new(None, 0).remaining, 0);
    }
}
