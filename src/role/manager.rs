//! Pending role requests for one connection.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use super::{RoleExpectation, RoleMessaging, RoleRecvStatus, RoleReplyInfo, RoleState};
use crate::codec::{ErrorMsg, OfMessage, OfVersion};
use crate::error::{OfError, Result};

/// Default expiry of a pending role request
pub const ROLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy)]
struct PendingRole {
    role: RoleState,
    expectation: RoleExpectation,
    sent_at: Instant,
}

/// Outcome of delivering a role reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleDelivery {
    /// How the reply was matched
    pub status: RoleRecvStatus,
    /// Role we had asked for, when the reply matched a pending request
    pub requested: Option<RoleState>,
}

/// Tracks role requests sent to one device.
///
/// Every request gets its own xid and pending entry; entries expire after
/// a fixed window. The table is shared between the connection task and
/// callers on other threads, so it lives in a concurrent map and expiry is
/// evaluated lazily on each access.
#[derive(Debug)]
pub struct RoleManager {
    messaging: Option<RoleMessaging>,
    version: OfVersion,
    pending: DashMap<u32, PendingRole>,
    xids: Arc<AtomicU32>,
    expiry: Duration,
}

impl RoleManager {
    /// Create a manager for a connection's negotiated version.
    pub fn new(version: OfVersion, supports_nx_role: bool) -> Self {
        Self {
            messaging: RoleMessaging::select(version, supports_nx_role),
            version,
            pending: DashMap::new(),
            xids: Arc::new(AtomicU32::new(0)),
            expiry: ROLE_TIMEOUT,
        }
    }

    /// Set the pending request expiry
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.expiry = expiry;
        self
    }

    /// Draw xids from a counter shared with the rest of the connection
    pub fn with_xid_source(mut self, xids: Arc<AtomicU32>) -> Self {
        self.xids = xids;
        self
    }

    /// Strategy in use, `None` if the device has no role support.
    pub fn messaging(&self) -> Option<RoleMessaging> {
        self.messaging
    }

    /// Number of live pending requests.
    pub fn pending_count(&self) -> usize {
        self.evict_expired();
        self.pending.len()
    }

    /// Record a role request and return the message to send.
    ///
    /// Returns `None` when the device cannot take role messages; nothing is
    /// recorded in that case and the caller decides how to proceed.
    pub fn request_role(&self, role: RoleState, expectation: RoleExpectation) -> Option<OfMessage> {
        self.evict_expired();
        let Some(messaging) = self.messaging else {
            tracing::debug!("Driver indicates no support for role messages, not sending {role}");
            return None;
        };

        let xid = self.xids.fetch_add(1, Ordering::Relaxed);
        let wire_role = messaging.wire_role(role);
        if wire_role != role {
            tracing::warn!("Sending Nicira role {wire_role} in place of {role}");
        }
        self.pending.insert(
            xid,
            PendingRole {
                role: wire_role,
                expectation,
                sent_at: Instant::now(),
            },
        );
        Some(messaging.request(role, xid))
    }

    /// Extract a role reply from an incoming message.
    pub fn extract_reply(&self, msg: &OfMessage) -> Result<Option<RoleReplyInfo>> {
        match self.messaging {
            Some(messaging) => messaging.extract_reply(msg),
            None => Ok(None),
        }
    }

    /// Match a role reply against pending requests.
    ///
    /// `current` is the role the switch last confirmed. A reply nobody is
    /// waiting for that disagrees with it is a [`OfError::RoleProtocol`].
    pub fn deliver_role_reply(
        &self,
        info: RoleReplyInfo,
        current: Option<RoleState>,
    ) -> Result<RoleDelivery> {
        self.evict_expired();

        let Some((_, pending)) = self.pending.remove(&info.xid) else {
            if self.pending.iter().any(|e| *e.key() > info.xid) {
                tracing::debug!(
                    "Received older role reply xid={} ({}), a newer request is pending",
                    info.xid,
                    info.role
                );
                return Ok(RoleDelivery {
                    status: RoleRecvStatus::OldReply,
                    requested: None,
                });
            }
            return match current {
                Some(role) if role != info.role => Err(OfError::RoleProtocol(format!(
                    "unexpected role reply {} (xid={}) with no pending request; current role {}",
                    info.role, info.xid, role
                ))),
                _ => {
                    tracing::debug!(
                        "Ignoring unexpected role reply {} (xid={}), matches current role",
                        info.role,
                        info.xid
                    );
                    Ok(RoleDelivery {
                        status: RoleRecvStatus::OtherExpectation,
                        requested: None,
                    })
                }
            };
        };

        let status = if pending.role == info.role {
            pending.expectation.matched()
        } else if pending.expectation == RoleExpectation::Query {
            RoleRecvStatus::ReplyQuery
        } else {
            RoleRecvStatus::OtherExpectation
        };
        tracing::debug!(
            "Role reply {} (xid={}) for request {} resolved as {:?}",
            info.role,
            info.xid,
            pending.role,
            status
        );
        Ok(RoleDelivery {
            status,
            requested: Some(pending.role),
        })
    }

    /// Match an error against pending requests.
    ///
    /// Stale generation, unsupported role and bad role are fatal for the
    /// connection.
    pub fn deliver_error(&self, xid: u32, error: &ErrorMsg) -> Result<RoleDelivery> {
        self.evict_expired();

        let Some((_, pending)) = self.pending.remove(&xid) else {
            if error.is_role_request_failed(self.version) {
                tracing::debug!("Role request error for unknown xid {xid}, ignoring");
            }
            return Ok(RoleDelivery {
                status: RoleRecvStatus::OtherExpectation,
                requested: None,
            });
        };

        if error.is_bad_request() {
            tracing::error!(
                "Error type {} code {} for pending role request {}; role messages unsupported",
                error.err_type,
                error.code,
                pending.role
            );
            return Ok(RoleDelivery {
                status: RoleRecvStatus::Unsupported,
                requested: Some(pending.role),
            });
        }

        match error.role_request_failure(self.version) {
            Some(reason) => Err(OfError::RoleProtocol(format!(
                "role request {} (xid={xid}) failed: {reason:?}",
                pending.role
            ))),
            None => Ok(RoleDelivery {
                status: RoleRecvStatus::OtherExpectation,
                requested: Some(pending.role),
            }),
        }
    }

    /// Drop expired entries, returning the roles that never got a reply.
    pub fn evict_expired(&self) -> Vec<(u32, RoleState)> {
        let now = Instant::now();
        let mut expired = Vec::new();
        self.pending.retain(|xid, p| {
            let live = now.duration_since(p.sent_at) < self.expiry;
            if !live {
                expired.push((*xid, p.role));
            }
            live
        });
        for (xid, role) in &expired {
            tracing::debug!("Role request {role} (xid={xid}) expired: {:?}", RoleRecvStatus::NoReply);
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn reply(role: RoleState, xid: u32) -> RoleReplyInfo {
        RoleReplyInfo {
            role,
            generation_id: Some(0),
            xid,
        }
    }

    fn error(err_type: u16, code: u16) -> ErrorMsg {
        ErrorMsg {
            err_type,
            code,
            data: Bytes::new(),
        }
    }

    #[test]
    fn test_single_completion_per_xid() {
        let manager = RoleManager::new(OfVersion::Of13, false);
        let msg = manager
            .request_role(RoleState::Master, RoleExpectation::SetRole)
            .unwrap();
        assert_eq!(msg.xid, 0);

        let first = manager
            .deliver_role_reply(reply(RoleState::Master, 0), None)
            .unwrap();
        assert_eq!(first.status, RoleRecvStatus::MatchedSetRole);
        assert_eq!(first.requested, Some(RoleState::Master));

        // The caller has applied MASTER; a repeat is ignored, not re-applied.
        let second = manager
            .deliver_role_reply(reply(RoleState::Master, 0), Some(RoleState::Master))
            .unwrap();
        assert_eq!(second.status, RoleRecvStatus::OtherExpectation);
        assert_eq!(second.requested, None);
    }

    #[test]
    fn test_unexpected_mismatch_is_protocol_error() {
        let manager = RoleManager::new(OfVersion::Of13, false);
        let result = manager.deliver_role_reply(reply(RoleState::Slave, 42), Some(RoleState::Master));
        assert!(matches!(result, Err(OfError::RoleProtocol(_))));

        // No known role yet: ignored.
        let result = manager
            .deliver_role_reply(reply(RoleState::Slave, 42), None)
            .unwrap();
        assert_eq!(result.status, RoleRecvStatus::OtherExpectation);
    }

    #[test]
    fn test_query_and_other_expectations() {
        let manager = RoleManager::new(OfVersion::Of13, false);
        manager.request_role(RoleState::Master, RoleExpectation::Query);
        let status = manager
            .deliver_role_reply(reply(RoleState::Slave, 0), None)
            .unwrap()
            .status;
        assert_eq!(status, RoleRecvStatus::ReplyQuery);

        manager.request_role(RoleState::Master, RoleExpectation::SetRole);
        let status = manager
            .deliver_role_reply(reply(RoleState::Equal, 1), None)
            .unwrap()
            .status;
        assert_eq!(status, RoleRecvStatus::OtherExpectation);

        manager.request_role(RoleState::Equal, RoleExpectation::CurrentRole);
        let status = manager
            .deliver_role_reply(reply(RoleState::Equal, 2), None)
            .unwrap()
            .status;
        assert_eq!(status, RoleRecvStatus::MatchedCurrentRole);
    }

    #[test]
    fn test_old_reply() {
        let manager = RoleManager::new(OfVersion::Of13, false);
        manager.request_role(RoleState::Master, RoleExpectation::SetRole);
        manager.request_role(RoleState::Slave, RoleExpectation::SetRole);
        // xid 0 answered, xid 1 outstanding: a second reply for 0 is old.
        manager
            .deliver_role_reply(reply(RoleState::Master, 0), None)
            .unwrap();
        let late = manager
            .deliver_role_reply(reply(RoleState::Master, 0), Some(RoleState::Master))
            .unwrap();
        assert_eq!(late.status, RoleRecvStatus::OldReply);
    }

    #[test]
    fn test_nicira_equal_matches_slave_reply() {
        let manager = RoleManager::new(OfVersion::Of10, true);
        manager.request_role(RoleState::Equal, RoleExpectation::SetRole);
        let delivery = manager
            .deliver_role_reply(reply(RoleState::Slave, 0), None)
            .unwrap();
        assert_eq!(delivery.status, RoleRecvStatus::MatchedSetRole);
        assert_eq!(delivery.requested, Some(RoleState::Slave));
    }

    #[test]
    fn test_no_role_support_sends_nothing() {
        let manager = RoleManager::new(OfVersion::Of10, false);
        assert!(manager
            .request_role(RoleState::Master, RoleExpectation::SetRole)
            .is_none());
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn test_deliver_error() {
        let manager = RoleManager::new(OfVersion::Of13, false);
        manager.request_role(RoleState::Master, RoleExpectation::SetRole);
        manager.request_role(RoleState::Master, RoleExpectation::SetRole);
        manager.request_role(RoleState::Master, RoleExpectation::SetRole);

        // Not a pending xid.
        assert_eq!(
            manager.deliver_error(99, &error(1, 1)).unwrap().status,
            RoleRecvStatus::OtherExpectation
        );
        let unsupported = manager.deliver_error(0, &error(1, 1)).unwrap();
        assert_eq!(unsupported.status, RoleRecvStatus::Unsupported);
        assert_eq!(unsupported.requested, Some(RoleState::Master));
        assert!(matches!(
            manager.deliver_error(1, &error(11, 0)),
            Err(OfError::RoleProtocol(_))
        ));
        assert_eq!(
            manager.deliver_error(2, &error(5, 1)).unwrap().status,
            RoleRecvStatus::OtherExpectation
        );
        assert_eq!(manager.pending_count(), 0);
    }

    #[test]
    fn test_shared_xid_source() {
        let xids = Arc::new(AtomicU32::new(40));
        let manager = RoleManager::new(OfVersion::Of13, false).with_xid_source(xids.clone());
        let msg = manager
            .request_role(RoleState::Master, RoleExpectation::SetRole)
            .unwrap();
        assert_eq!(msg.xid, 40);
        assert_eq!(xids.load(Ordering::Relaxed), 41);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_request_expires() {
        let manager =
            RoleManager::new(OfVersion::Of13, false).with_expiry(Duration::from_secs(60));
        manager.request_role(RoleState::Master, RoleExpectation::SetRole);
        assert_eq!(manager.pending_count(), 1);

        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(manager.pending_count(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(manager.evict_expired(), vec![(0, RoleState::Master)]);
        assert_eq!(manager.pending_count(), 0);

        // A late reply for the evicted xid is not applied to any state.
        let late = manager.deliver_role_reply(reply(RoleState::Master, 0), Some(RoleState::Equal));
        assert!(late.is_err());
        let late = manager
            .deliver_role_reply(reply(RoleState::Master, 0), Some(RoleState::Master))
            .unwrap();
        assert_eq!(late.requested, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_reports_no_reply() {
        let manager =
            RoleManager::new(OfVersion::Of13, false).with_expiry(Duration::from_millis(100));
        manager.request_role(RoleState::Slave, RoleExpectation::SetRole);
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(manager.evict_expired(), vec![(0, RoleState::Slave)]);
    }
}
