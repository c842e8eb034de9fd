//! Live switch handles.
//!
//! A [`Switch`] exists from the moment a device has been described and a
//! driver chosen, until its connection closes. It holds what the handshake
//! learned (features, ports, description), the confirmed role, the role
//! request table and the driver. Writes go through the connection's command
//! channel, so a `Switch` can be used from any thread.

mod driver;
mod io;

pub use driver::{
    BarrierHandshakeDriver, DefaultDriver, DefaultDriverProvider, DriverProvider, SwitchDriver,
};
pub use io::{ChannelCommand, ChannelSender, SwitchIo};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::codec::{
    DescStats, FeaturesReply, MeterFeatures, OfMessage, OfVersion, PortDesc, PortReason,
    PortStatus,
};
use crate::error::{OfError, Result};
use crate::registry::SwitchRegistry;
use crate::role::{RoleExpectation, RoleManager, RoleRecvStatus, RoleReplyInfo, RoleState};

/// Datapath id, the identity of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Dpid(pub u64);

impl fmt::Display for Dpid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0.to_be_bytes();
        for (i, b) in bytes.iter().enumerate() {
            if i > 0 {
                f.write_str(":")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl From<u64> for Dpid {
    fn from(v: u64) -> Self {
        Dpid(v)
    }
}

impl FromStr for Dpid {
    type Err = OfError;

    /// Accepts `00:00:00:00:00:00:00:01`, `of:0000000000000001` or bare hex.
    fn from_str(s: &str) -> Result<Self> {
        let hex: String = s
            .trim()
            .trim_start_matches("of:")
            .chars()
            .filter(|c| *c != ':')
            .collect();
        if hex.is_empty() || hex.len() > 16 {
            return Err(OfError::Config(format!("invalid datapath id: {s}")));
        }
        u64::from_str_radix(&hex, 16)
            .map(Dpid)
            .map_err(|_| OfError::Config(format!("invalid datapath id: {s}")))
    }
}

/// Everything the handshake learned about a device.
#[derive(Debug, Clone)]
pub(crate) struct SwitchParts {
    pub io: SwitchIo,
    pub remote: String,
    pub desc: DescStats,
    pub features: FeaturesReply,
    pub ports: Vec<PortDesc>,
    pub meter_features: Option<MeterFeatures>,
    pub role_timeout: Duration,
}

/// Handle to one connected device.
pub struct Switch {
    io: SwitchIo,
    remote: String,
    desc: DescStats,
    features: RwLock<FeaturesReply>,
    ports: RwLock<BTreeMap<u32, PortDesc>>,
    meter_features: Option<MeterFeatures>,
    role: RwLock<Option<RoleState>>,
    table_full: AtomicBool,
    role_manager: RoleManager,
    driver: Mutex<Box<dyn SwitchDriver>>,
    registry: Arc<SwitchRegistry>,
}

impl fmt::Debug for Switch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Switch")
            .field("dpid", &self.dpid())
            .field("remote", &self.remote)
            .field("version", &self.version())
            .field("role", &self.role())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Switch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} DPID[{}]]", self.remote, self.dpid())
    }
}

impl Switch {
    pub(crate) fn new(
        parts: SwitchParts,
        mut driver: Box<dyn SwitchDriver>,
        registry: Arc<SwitchRegistry>,
    ) -> Arc<Self> {
        let role_manager = RoleManager::new(parts.io.version(), driver.supports_nx_role())
            .with_expiry(parts.role_timeout)
            .with_xid_source(parts.io.sender().xid_source());
        driver.init(parts.io.clone(), &parts.desc);
        tracing::debug!("Switch {} bound to driver {}", parts.io.dpid(), driver.name());

        Arc::new(Self {
            io: parts.io,
            remote: parts.remote,
            desc: parts.desc,
            features: RwLock::new(parts.features),
            ports: RwLock::new(parts.ports.into_iter().map(|p| (p.port_no, p)).collect()),
            meter_features: parts.meter_features,
            role: RwLock::new(None),
            table_full: AtomicBool::new(false),
            role_manager,
            driver: Mutex::new(driver),
            registry,
        })
    }

    /// Device identity.
    pub fn dpid(&self) -> Dpid {
        self.io.dpid()
    }

    /// Negotiated version.
    pub fn version(&self) -> OfVersion {
        self.io.version()
    }

    /// Peer address of the connection.
    pub fn remote_addr(&self) -> &str {
        &self.remote
    }

    /// Description stats.
    pub fn desc(&self) -> &DescStats {
        &self.desc
    }

    /// Latest features reply.
    pub fn features(&self) -> FeaturesReply {
        self.features.read().clone()
    }

    /// Meter features, if the device reported them.
    pub fn meter_features(&self) -> Option<MeterFeatures> {
        self.meter_features
    }

    /// Known ports ordered by port number.
    pub fn ports(&self) -> Vec<PortDesc> {
        self.ports.read().values().cloned().collect()
    }

    /// Confirmed role, `None` until one is confirmed.
    pub fn role(&self) -> Option<RoleState> {
        *self.role.read()
    }

    /// Whether the device reported a full flow table.
    pub fn is_table_full(&self) -> bool {
        self.table_full.load(Ordering::Relaxed)
    }

    /// Set or clear the table-full flag.
    pub fn set_table_full(&self, full: bool) {
        self.table_full.store(full, Ordering::Relaxed);
    }

    /// Pending role requests.
    pub fn role_manager(&self) -> &RoleManager {
        &self.role_manager
    }

    /// Allocate a runtime xid.
    pub fn next_xid(&self) -> u32 {
        self.io.next_xid()
    }

    /// Write messages, passing each to outgoing message listeners first.
    pub fn send(&self, msgs: Vec<OfMessage>) -> bool {
        for msg in &msgs {
            self.registry.notify_outgoing(self.dpid(), msg);
        }
        self.io.send(msgs)
    }

    /// Close the connection.
    pub fn disconnect(&self) {
        self.io.close();
    }

    /// Whether the connection task is still alive.
    pub fn is_connected(&self) -> bool {
        self.io.sender().is_open()
    }

    pub(crate) fn set_features(&self, features: FeaturesReply) {
        if self.version() == OfVersion::Of10 {
            self.set_ports(features.ports.clone());
        }
        *self.features.write() = features;
    }

    pub(crate) fn set_ports(&self, ports: Vec<PortDesc>) {
        *self.ports.write() = ports.into_iter().map(|p| (p.port_no, p)).collect();
    }

    pub(crate) fn apply_port_status(&self, status: &PortStatus) {
        let mut ports = self.ports.write();
        match status.reason {
            PortReason::Add | PortReason::Modify => {
                ports.insert(status.desc.port_no, status.desc.clone());
            }
            PortReason::Delete => {
                ports.remove(&status.desc.port_no);
            }
        }
    }

    // Driver hooks

    pub(crate) fn start_driver_handshake(&self) {
        self.driver.lock().start_driver_handshake();
    }

    pub(crate) fn is_driver_handshake_complete(&self) -> bool {
        self.driver.lock().is_driver_handshake_complete()
    }

    pub(crate) fn process_driver_handshake_message(&self, msg: &OfMessage) {
        self.driver.lock().process_driver_handshake_message(msg);
    }

    pub(crate) fn handle_message(&self, msg: &OfMessage) {
        self.driver.lock().handle_message(msg);
    }

    /// Register in the registry. False means another connection already
    /// holds this dpid.
    pub(crate) fn connect_switch(self: &Arc<Self>) -> bool {
        if !self.registry.add_connected(self.dpid(), self.clone()) {
            return false;
        }
        self.driver.lock().connect();
        true
    }

    /// Connection cleanup for a switch that was registered.
    pub(crate) fn disconnect_switch(self: &Arc<Self>) {
        self.driver.lock().disconnect();
        self.registry.remove_switch(self);
    }

    // Roles

    /// Ask the device to take `role`.
    pub fn set_role(&self, role: RoleState) -> Result<bool> {
        self.send_role_request(role, RoleExpectation::SetRole)
    }

    /// Send a role request.
    ///
    /// Returns `Ok(false)` when the device takes no role messages. A
    /// [`RoleExpectation::SetRole`] request is then applied directly.
    pub fn send_role_request(&self, role: RoleState, expectation: RoleExpectation) -> Result<bool> {
        let Some(msg) = self.role_manager.request_role(role, expectation) else {
            if expectation == RoleExpectation::SetRole {
                tracing::info!("{} takes no role messages, assuming role {}", self, role);
                self.apply_role(role);
            } else {
                tracing::error!("{} takes no role messages, cannot request {}", self, role);
            }
            return Ok(false);
        };
        tracing::debug!("Sending role request {} xid={} to {}", role, msg.xid, self);
        if !self.send(vec![msg]) {
            return Err(OfError::NotConnected(self.dpid().to_string()));
        }
        Ok(true)
    }

    /// Re-request the confirmed role if the driver agrees.
    pub fn reassert_role(&self) {
        let Some(role) = self.role() else {
            return;
        };
        if !self.driver.lock().reassert_role(role) {
            return;
        }
        tracing::info!("Reasserting role {} on {}", role, self);
        if let Err(e) = self.send_role_request(role, RoleExpectation::CurrentRole) {
            tracing::warn!("Role reassertion on {} failed: {}", self, e);
        }
    }

    /// Handle a message if it is a role reply.
    ///
    /// Returns whether it was one. Replies the controller cannot interpret
    /// are errors that end the connection.
    pub(crate) fn handle_role_message(&self, msg: &OfMessage) -> Result<bool> {
        let Some(info) = self.role_manager.extract_reply(msg)? else {
            return Ok(false);
        };
        self.handle_role_reply(info);
        Ok(true)
    }

    pub(crate) fn handle_role_reply(&self, info: RoleReplyInfo) {
        let delivery = match self.role_manager.deliver_role_reply(info, self.role()) {
            Ok(delivery) => delivery,
            Err(e) => {
                tracing::warn!("{}: {}", self, e);
                self.reassert_role();
                return;
            }
        };

        match (delivery.status, delivery.requested) {
            (RoleRecvStatus::MatchedSetRole | RoleRecvStatus::MatchedCurrentRole, requested) => {
                self.apply_role(info.role);
                if let Some(requested) = requested {
                    self.registry
                        .notify_role_reply(self.dpid(), requested, info.role);
                }
            }
            (RoleRecvStatus::ReplyQuery, Some(requested)) => {
                self.registry
                    .notify_role_reply(self.dpid(), requested, info.role);
            }
            (status, _) => {
                tracing::debug!(
                    "Role reply {} xid={} from {}: {:?}",
                    info.role,
                    info.xid,
                    self,
                    status
                );
            }
        }
    }

    /// Offer an error message to role handling.
    ///
    /// Returns whether it answered a pending role request.
    pub(crate) fn handle_role_error(&self, msg: &OfMessage) -> Result<bool> {
        let Some(error) = msg.as_error() else {
            return Ok(false);
        };
        let delivery = self.role_manager.deliver_error(msg.xid, error)?;
        if delivery.status == RoleRecvStatus::Unsupported {
            if let Some(role) = delivery.requested {
                tracing::warn!("{} rejected role messages, assuming role {}", self, role);
                self.apply_role(role);
            }
        }
        Ok(delivery.requested.is_some())
    }

    fn apply_role(&self, role: RoleState) {
        *self.role.write() = Some(role);
        let dpid = self.dpid();
        if !self.registry.is_active(dpid) {
            if !self.registry.activate(dpid, role == RoleState::Master) {
                tracing::debug!("{} not activated as {}", self, role);
            }
        } else if role == RoleState::Master {
            self.registry.transition_to_master(dpid);
        } else {
            self.registry.transition_to_equal(dpid);
        }
        self.driver.lock().set_role(role);
    }

    /// Drop role requests that outlived their expiry.
    pub(crate) fn evict_expired_roles(&self) {
        for (xid, role) in self.role_manager.evict_expired() {
            tracing::debug!("No reply to role request {} xid={} from {}", role, xid, self);
        }
    }
}
