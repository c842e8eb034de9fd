//! Controller role negotiation.
//!
//! After a device is active, external mastership decisions ask it to treat
//! this controller as master, equal or slave. The request and its reply
//! take one of two forms, fixed once per connection:
//!
//! | Version | Strategy                 | Request                        |
//! |---------|--------------------------|--------------------------------|
//! | 1.0     | [`RoleMessaging::Nicira`]   | vendor 0x2320, `NXT_ROLE_REQUEST` |
//! | 1.3     | [`RoleMessaging::Standard`] | `OFPT_ROLE_REQUEST`, generation 0 |
//!
//! Nicira has no defined behaviour for its OTHER role, so EQUAL is sent as
//! SLAVE to 1.0 devices.

mod manager;

pub use manager::{RoleDelivery, RoleManager};

use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

use crate::codec::{
    Body, ControllerRole, Experimenter, OfMessage, OfVersion, RoleMessage, NICIRA_EXPERIMENTER,
};
use crate::error::{OfError, Result};

const NXT_ROLE_REQUEST: u32 = 10;
const NXT_ROLE_REPLY: u32 = 11;

const NX_ROLE_OTHER: u32 = 0;
const NX_ROLE_MASTER: u32 = 1;
const NX_ROLE_SLAVE: u32 = 2;

/// Role of this controller towards a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleState {
    /// Full control
    Master,
    /// Shared control
    Equal,
    /// Read only
    Slave,
}

impl fmt::Display for RoleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleState::Master => write!(f, "MASTER"),
            RoleState::Equal => write!(f, "EQUAL"),
            RoleState::Slave => write!(f, "SLAVE"),
        }
    }
}

/// What the caller of a role request expects back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleExpectation {
    /// Confirm the role we already hold (startup, reassertion)
    CurrentRole,
    /// Confirm a role newly set by the mastership service
    SetRole,
    /// Find out what the device thinks our role is
    Query,
}

/// How a role reply (or its absence) was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleRecvStatus {
    /// The device reported it does not support role messages.
    Unsupported,
    /// The request expired without a reply.
    NoReply,
    /// The reply was for an older request; a newer one is pending.
    OldReply,
    /// The reply confirmed the role we already held.
    MatchedCurrentRole,
    /// The reply confirmed a newly set role.
    MatchedSetRole,
    /// The reply answered a query.
    ReplyQuery,
    /// Unclear or no expectation.
    OtherExpectation,
}

impl RoleExpectation {
    pub(crate) fn matched(self) -> RoleRecvStatus {
        match self {
            RoleExpectation::CurrentRole => RoleRecvStatus::MatchedCurrentRole,
            RoleExpectation::SetRole => RoleRecvStatus::MatchedSetRole,
            RoleExpectation::Query => RoleRecvStatus::OtherExpectation,
        }
    }
}

/// A role reply reduced to what the controller cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleReplyInfo {
    /// Role the device reports
    pub role: RoleState,
    /// Generation id (1.3 only)
    pub generation_id: Option<u64>,
    /// Transaction id of the reply
    pub xid: u32,
}

/// Wire form used for role messages on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleMessaging {
    /// Nicira vendor extension (1.0)
    Nicira,
    /// Standard role request (1.3)
    Standard,
}

impl RoleMessaging {
    /// Pick the strategy for a connection; `None` when the device cannot
    /// negotiate roles at all.
    pub fn select(version: OfVersion, supports_nx_role: bool) -> Option<Self> {
        match version {
            OfVersion::Of13 => Some(RoleMessaging::Standard),
            OfVersion::Of10 if supports_nx_role => Some(RoleMessaging::Nicira),
            OfVersion::Of10 => None,
        }
    }

    /// Role actually carried on the wire for a requested role.
    pub fn wire_role(self, role: RoleState) -> RoleState {
        match (self, role) {
            (RoleMessaging::Nicira, RoleState::Equal) => RoleState::Slave,
            _ => role,
        }
    }

    /// Build the request message.
    pub fn request(self, role: RoleState, xid: u32) -> OfMessage {
        match self {
            RoleMessaging::Nicira => {
                let nx_role = match self.wire_role(role) {
                    RoleState::Master => NX_ROLE_MASTER,
                    _ => NX_ROLE_SLAVE,
                };
                let mut data = BytesMut::with_capacity(4);
                data.put_u32(nx_role);
                OfMessage::new(
                    OfVersion::Of10,
                    xid,
                    Body::Experimenter(Experimenter {
                        experimenter: NICIRA_EXPERIMENTER,
                        exp_type: NXT_ROLE_REQUEST,
                        data: data.freeze(),
                    }),
                )
            }
            RoleMessaging::Standard => {
                let role = match role {
                    RoleState::Master => ControllerRole::Master,
                    RoleState::Equal => ControllerRole::Equal,
                    RoleState::Slave => ControllerRole::Slave,
                };
                OfMessage::new(
                    OfVersion::Of13,
                    xid,
                    Body::RoleRequest(RoleMessage {
                        role,
                        generation_id: 0,
                    }),
                )
            }
        }
    }

    /// Extract a role reply.
    ///
    /// `Ok(None)` means the message is not a role reply for this strategy.
    /// A reply carrying a role the controller cannot interpret is a hard
    /// protocol violation.
    pub fn extract_reply(self, msg: &OfMessage) -> Result<Option<RoleReplyInfo>> {
        match (self, &msg.body) {
            (RoleMessaging::Nicira, Body::Experimenter(exp))
                if exp.experimenter == NICIRA_EXPERIMENTER && exp.exp_type == NXT_ROLE_REPLY =>
            {
                let mut data = exp.data.clone();
                if data.remaining() < 4 {
                    return Err(OfError::RoleProtocol(
                        "truncated Nicira role reply".to_string(),
                    ));
                }
                let role = match data.get_u32() {
                    NX_ROLE_MASTER => RoleState::Master,
                    NX_ROLE_OTHER => RoleState::Equal,
                    NX_ROLE_SLAVE => RoleState::Slave,
                    other => {
                        return Err(OfError::RoleProtocol(format!(
                            "NX_ROLE_REPLY with invalid role value {other}"
                        )))
                    }
                };
                Ok(Some(RoleReplyInfo {
                    role,
                    generation_id: None,
                    xid: msg.xid,
                }))
            }
            (RoleMessaging::Standard, Body::RoleReply(reply)) => {
                let role = match reply.role {
                    ControllerRole::Master => RoleState::Master,
                    ControllerRole::Equal => RoleState::Equal,
                    ControllerRole::Slave => RoleState::Slave,
                    ControllerRole::NoChange => {
                        return Err(OfError::RoleProtocol(
                            "role reply carried ROLE_NOCHANGE".to_string(),
                        ))
                    }
                };
                Ok(Some(RoleReplyInfo {
                    role,
                    generation_id: Some(reply.generation_id),
                    xid: msg.xid,
                }))
            }
            _ => Ok(None),
        }
    }
}
