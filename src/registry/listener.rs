//! Upstream notification traits.
//!
//! Listeners run on the thread that produced the event: the dispatch task for
//! incoming traffic, the caller for writes. They must not block.

use crate::codec::{OfMessage, PortStatus};
use crate::role::RoleState;
use crate::switch::Dpid;

/// Switch lifecycle and role events.
pub trait SwitchListener: Send + Sync {
    /// A device passed the handshake and entered the registry.
    fn switch_added(&self, dpid: Dpid) {
        let _ = dpid;
    }

    /// A registered device went away.
    fn switch_removed(&self, dpid: Dpid) {
        let _ = dpid;
    }

    /// Features or port set changed.
    fn switch_changed(&self, dpid: Dpid) {
        let _ = dpid;
    }

    /// A port was added, removed or modified.
    fn port_changed(&self, dpid: Dpid, status: &PortStatus) {
        let _ = (dpid, status);
    }

    /// A role reply matched a request.
    fn role_reply_received(&self, dpid: Dpid, requested: RoleState, response: RoleState) {
        let _ = (dpid, requested, response);
    }
}

/// Sees every message in both directions.
pub trait MessageListener: Send + Sync {
    /// Message from the device, before dispatch.
    fn handle_incoming(&self, dpid: Dpid, msg: &OfMessage);

    /// Message written to the device.
    fn handle_outgoing(&self, dpid: Dpid, msg: &OfMessage);
}

/// PACKET_IN consumer. Registered with a priority; lower runs first.
pub trait PacketListener: Send + Sync {
    /// A PACKET_IN arrived.
    fn handle_packet(&self, dpid: Dpid, msg: &OfMessage);
}

/// Generic per-message fan-out for everything else.
pub trait EventListener: Send + Sync {
    /// A dispatched message (flow removed, barrier reply, error, stats ...).
    fn handle_event(&self, dpid: Dpid, msg: &OfMessage);
}
