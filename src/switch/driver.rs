//! Device drivers.
//!
//! A driver is chosen once the description stats are known. It may run a
//! vendor specific sub-handshake before the switch becomes active, and it
//! gets hooks for role changes and connect/disconnect.
//!
//! ```text
//!   DESC reply ──► DriverProvider::driver(dpid, desc, version)
//!                      │
//!                      ├─ None ──► connection waits (logged)
//!                      └─ Some(driver)
//!                            ├─ init(io, desc)
//!                            ├─ start_driver_handshake()
//!                            └─ process_driver_handshake_message() ... until complete
//! ```

use super::{Dpid, SwitchIo};
use crate::codec::{Body, DescStats, OfMessage, OfVersion};
use crate::role::RoleState;

/// Per-device driver hooks.
///
/// Every hook has a default, so a driver only overrides what it needs.
pub trait SwitchDriver: Send {
    /// Short name for logs.
    fn name(&self) -> &str {
        "default"
    }

    /// Called once when the switch handle is built.
    fn init(&mut self, io: SwitchIo, desc: &DescStats) {
        let _ = (io, desc);
    }

    /// Begin the vendor sub-handshake, if any.
    fn start_driver_handshake(&mut self) {}

    /// Whether the sub-handshake is done.
    fn is_driver_handshake_complete(&self) -> bool {
        true
    }

    /// A message received during the sub-handshake.
    fn process_driver_handshake_message(&mut self, msg: &OfMessage) {
        let _ = msg;
    }

    /// Whether a 1.0 device accepts Nicira role messages.
    fn supports_nx_role(&self) -> bool {
        true
    }

    /// The device confirmed a role.
    fn set_role(&mut self, role: RoleState) {
        let _ = role;
    }

    /// The device disagrees with our role. Return true to re-request it.
    fn reassert_role(&mut self, role: RoleState) -> bool {
        let _ = role;
        true
    }

    /// The switch entered the registry.
    fn connect(&mut self) {}

    /// The connection is gone.
    fn disconnect(&mut self) {}

    /// An active-state message, before it is dispatched.
    fn handle_message(&mut self, msg: &OfMessage) {
        let _ = msg;
    }
}

/// Chooses a driver for a newly described device.
pub trait DriverProvider: Send + Sync {
    /// `None` leaves the connection waiting in the description state.
    fn driver(
        &self,
        dpid: Dpid,
        desc: &DescStats,
        version: OfVersion,
    ) -> Option<Box<dyn SwitchDriver>>;
}

impl<F> DriverProvider for F
where
    F: Fn(Dpid, &DescStats, OfVersion) -> Option<Box<dyn SwitchDriver>> + Send + Sync,
{
    fn driver(
        &self,
        dpid: Dpid,
        desc: &DescStats,
        version: OfVersion,
    ) -> Option<Box<dyn SwitchDriver>> {
        self(dpid, desc, version)
    }
}

/// Driver with no sub-handshake.
#[derive(Debug, Default)]
pub struct DefaultDriver;

impl SwitchDriver for DefaultDriver {}

/// Driver whose sub-handshake is a single barrier round trip.
#[derive(Debug, Default)]
pub struct BarrierHandshakeDriver {
    io: Option<SwitchIo>,
    barrier_xid: Option<u32>,
    complete: bool,
}

impl BarrierHandshakeDriver {
    /// Create a driver.
    pub fn new() -> Self {
        Self::default()
    }
}

impl SwitchDriver for BarrierHandshakeDriver {
    fn name(&self) -> &str {
        "barrier-handshake"
    }

    fn init(&mut self, io: SwitchIo, _desc: &DescStats) {
        self.io = Some(io);
    }

    fn start_driver_handshake(&mut self) {
        let Some(io) = &self.io else {
            return;
        };
        let xid = io.next_xid();
        if io.send_one(OfMessage::new(io.version(), xid, Body::BarrierRequest)) {
            tracing::debug!("Sent sub-handshake barrier xid={} to {}", xid, io.dpid());
            self.barrier_xid = Some(xid);
        }
    }

    fn is_driver_handshake_complete(&self) -> bool {
        self.complete
    }

    fn process_driver_handshake_message(&mut self, msg: &OfMessage) {
        if matches!(msg.body, Body::BarrierReply) && Some(msg.xid) == self.barrier_xid {
            self.complete = true;
        }
    }
}

/// Provider that hands every device a [`DefaultDriver`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDriverProvider;

impl DriverProvider for DefaultDriverProvider {
    fn driver(
        &self,
        dpid: Dpid,
        desc: &DescStats,
        version: OfVersion,
    ) -> Option<Box<dyn SwitchDriver>> {
        tracing::debug!(
            "Default driver for {} ({} {}) {}",
            dpid,
            desc.mfr_desc,
            desc.hw_desc,
            version
        );
        Some(Box::new(DefaultDriver))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::switch::{ChannelCommand, ChannelSender};
    use tokio::sync::mpsc;

    #[test]
    fn test_barrier_handshake() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let io = SwitchIo::new(ChannelSender::new(tx), Dpid(7), OfVersion::Of13);

        let mut driver = BarrierHandshakeDriver::new();
        driver.init(io, &DescStats::default());
        assert!(!driver.is_driver_handshake_complete());

        driver.start_driver_handshake();
        let Ok(ChannelCommand::Send(msgs)) = rx.try_recv() else {
            panic!("no barrier sent");
        };
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].body, Body::BarrierRequest);
        let xid = msgs[0].xid;

        // A barrier reply for some other request does not finish it.
        driver.process_driver_handshake_message(&OfMessage::new(
            OfVersion::Of13,
            xid + 100,
            Body::BarrierReply,
        ));
        assert!(!driver.is_driver_handshake_complete());

        driver.process_driver_handshake_message(&OfMessage::new(
            OfVersion::Of13,
            xid,
            Body::BarrierReply,
        ));
        assert!(driver.is_driver_handshake_complete());
    }

    #[test]
    fn test_closure_provider() {
        let provider = |dpid: Dpid, _: &DescStats, _: OfVersion| -> Option<Box<dyn SwitchDriver>> {
            (dpid.0 != 0).then(|| Box::new(DefaultDriver) as Box<dyn SwitchDriver>)
        };
        assert!(provider
            .driver(Dpid(0), &DescStats::default(), OfVersion::Of10)
            .is_none());
        assert!(provider
            .driver(Dpid(1), &DescStats::default(), OfVersion::Of10)
            .is_some());
        assert!(DefaultDriverProvider
            .driver(Dpid(1), &DescStats::default(), OfVersion::Of13)
            .is_some());
    }
}
