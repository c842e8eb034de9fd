//! Switch registry and dispatch hub.
//!
//! Every device that completes the handshake is recorded here under its
//! [`Dpid`]. Each record is in exactly one of these classes:
//!
//! | Class            | connected | master | equal |
//! |------------------|-----------|--------|-------|
//! | absent           |           |        |       |
//! | connected-only   | x         |        |       |
//! | connected+master | x         | x      |       |
//! | connected+equal  | x         |        | x     |
//!
//! Reads go straight to the maps. Only activation and role transitions,
//! which touch two maps, take the activation lock.
//!
//! Incoming traffic arrives through [`SwitchRegistry::dispatch`], which
//! completes correlated replies, reassembles multi-part statistics and fans
//! messages out to the registered listeners. Packet classifiers kept here
//! decide which dispatch lane a device's packet-ins travel on.

mod classifier;
mod listener;
mod response;
mod stats;

pub use classifier::PacketClassifier;
pub use listener::{EventListener, MessageListener, PacketListener, SwitchListener};
pub use response::PendingReply;
pub use stats::{StatsAccumulator, DEFAULT_MAX_BYTES, DEFAULT_MAX_FRAGMENTS};

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use crate::codec::{Body, MessageType, OfMessage, PortStatus, StatsType};
use crate::config::DispatchConfig;
use crate::error::{OfError, Result};
use crate::role::RoleState;
use crate::switch::{Dpid, Switch};
use classifier::ClassifierTable;
use response::ResponseTable;

/// Error xids remembered per device
const MAX_ERROR_XIDS: usize = 1024;

/// Registry classification of a dpid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchClass {
    /// Not connected
    Absent,
    /// Connected, no role confirmed yet
    ConnectedOnly,
    /// Active as master
    Master,
    /// Active as equal or slave
    Equal,
}

#[derive(Default)]
struct Listeners {
    switch: Vec<Arc<dyn SwitchListener>>,
    message: Vec<Arc<dyn MessageListener>>,
    packet: Vec<(u32, Arc<dyn PacketListener>)>,
    event: Vec<Arc<dyn EventListener>>,
}

/// Registry of connected switches.
pub struct SwitchRegistry {
    connected: DashMap<Dpid, Arc<Switch>>,
    active_master: DashMap<Dpid, Arc<Switch>>,
    active_equal: DashMap<Dpid, Arc<Switch>>,
    activation: Mutex<()>,
    responses: ResponseTable,
    stats: StatsAccumulator,
    error_xids: DashMap<Dpid, VecDeque<u32>>,
    classifiers: ClassifierTable,
    listeners: RwLock<Listeners>,
}

impl std::fmt::Debug for SwitchRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SwitchRegistry")
            .field("connected", &self.connected.len())
            .field("master", &self.active_master.len())
            .field("equal", &self.active_equal.len())
            .field("pending_replies", &self.responses.len())
            .finish_non_exhaustive()
    }
}

impl Default for SwitchRegistry {
    fn default() -> Self {
        Self::new(&DispatchConfig::default())
    }
}

impl SwitchRegistry {
    /// Create an empty registry.
    pub fn new(config: &DispatchConfig) -> Self {
        Self {
            connected: DashMap::new(),
            active_master: DashMap::new(),
            active_equal: DashMap::new(),
            activation: Mutex::new(()),
            responses: ResponseTable::default(),
            stats: StatsAccumulator::new(config.max_stats_fragments, config.max_stats_bytes),
            error_xids: DashMap::new(),
            classifiers: ClassifierTable::default(),
            listeners: RwLock::new(Listeners::default()),
        }
    }

    // Listener registration

    /// Register a lifecycle listener.
    pub fn add_switch_listener(&self, listener: Arc<dyn SwitchListener>) {
        self.listeners.write().switch.push(listener);
    }

    /// Register a message listener.
    pub fn add_message_listener(&self, listener: Arc<dyn MessageListener>) {
        self.listeners.write().message.push(listener);
    }

    /// Register a PACKET_IN listener. Lower priorities run first; equal
    /// priorities run in registration order.
    pub fn add_packet_listener(&self, priority: u32, listener: Arc<dyn PacketListener>) {
        let mut listeners = self.listeners.write();
        let at = listeners.packet.partition_point(|(p, _)| *p <= priority);
        listeners.packet.insert(at, (priority, listener));
    }

    /// Register an event listener.
    pub fn add_event_listener(&self, listener: Arc<dyn EventListener>) {
        self.listeners.write().event.push(listener);
    }

    fn switch_listeners(&self) -> Vec<Arc<dyn SwitchListener>> {
        self.listeners.read().switch.clone()
    }

    fn event_listeners(&self) -> Vec<Arc<dyn EventListener>> {
        self.listeners.read().event.clone()
    }

    // Membership

    /// Record a switch that finished the handshake.
    ///
    /// Returns false, leaving the existing entry untouched, if the dpid is
    /// already connected.
    pub fn add_connected(&self, dpid: Dpid, switch: Arc<Switch>) -> bool {
        match self.connected.entry(dpid) {
            Entry::Occupied(_) => {
                tracing::error!(
                    "Trying to add connected switch {} but one is already connected",
                    dpid
                );
                return false;
            }
            Entry::Vacant(slot) => {
                slot.insert(switch);
            }
        }
        tracing::info!("Added switch {}", dpid);
        for l in self.switch_listeners() {
            l.switch_added(dpid);
        }
        true
    }

    /// Move a connected switch into an active map.
    ///
    /// Fails if the dpid is not connected or is already active.
    pub fn activate(&self, dpid: Dpid, as_master: bool) -> bool {
        let _guard = self.activation.lock();
        let Some(switch) = self.connected.get(&dpid).map(|s| s.clone()) else {
            tracing::error!("Trying to activate switch {} but it is not connected", dpid);
            return false;
        };
        if self.active_master.contains_key(&dpid) || self.active_equal.contains_key(&dpid) {
            tracing::error!("Trying to activate switch {} but it is already active", dpid);
            return false;
        }
        if as_master {
            self.active_master.insert(dpid, switch);
        } else {
            self.active_equal.insert(dpid, switch);
        }
        tracing::info!(
            "Activated switch {} as {}",
            dpid,
            if as_master { "master" } else { "equal" }
        );
        true
    }

    /// Make an active switch master. Idempotent.
    pub fn transition_to_master(&self, dpid: Dpid) {
        let _guard = self.activation.lock();
        Self::transition(&self.connected, &self.active_equal, &self.active_master, dpid);
    }

    /// Make an active switch equal. Idempotent.
    pub fn transition_to_equal(&self, dpid: Dpid) {
        let _guard = self.activation.lock();
        Self::transition(&self.connected, &self.active_master, &self.active_equal, dpid);
    }

    fn transition(
        connected: &DashMap<Dpid, Arc<Switch>>,
        from: &DashMap<Dpid, Arc<Switch>>,
        to: &DashMap<Dpid, Arc<Switch>>,
        dpid: Dpid,
    ) {
        if to.contains_key(&dpid) {
            from.remove(&dpid);
            return;
        }
        let switch = match from.remove(&dpid) {
            Some((_, sw)) => sw,
            None => match connected.get(&dpid) {
                Some(sw) => sw.clone(),
                None => {
                    tracing::warn!("Role transition for unknown switch {}", dpid);
                    return;
                }
            },
        };
        to.insert(dpid, switch);
    }

    /// Remove a device and everything kept for it.
    ///
    /// Notifies `switch_removed` once, only if it was present.
    pub fn remove(&self, dpid: Dpid) {
        let removed = {
            let _guard = self.activation.lock();
            self.active_master.remove(&dpid);
            self.active_equal.remove(&dpid);
            self.connected.remove(&dpid).is_some()
        };
        self.forget(dpid, removed);
    }

    /// Remove a switch only if the registered entry is this exact handle.
    pub(crate) fn remove_switch(&self, switch: &Arc<Switch>) {
        let dpid = switch.dpid();
        let removed = {
            let _guard = self.activation.lock();
            let removed = self
                .connected
                .remove_if(&dpid, |_, registered| Arc::ptr_eq(registered, switch))
                .is_some();
            if removed {
                self.active_master.remove(&dpid);
                self.active_equal.remove(&dpid);
            }
            removed
        };
        if removed {
            self.forget(dpid, true);
        }
    }

    fn forget(&self, dpid: Dpid, notify: bool) {
        self.responses.clear_device(dpid);
        self.stats.clear_device(dpid);
        self.error_xids.remove(&dpid);
        if notify {
            tracing::info!("Removed switch {}", dpid);
            for l in self.switch_listeners() {
                l.switch_removed(dpid);
            }
        }
    }

    // Lookups

    /// Connected switch by dpid.
    pub fn get_switch(&self, dpid: Dpid) -> Option<Arc<Switch>> {
        self.connected.get(&dpid).map(|s| s.clone())
    }

    /// Switch if active as master.
    pub fn master_switch(&self, dpid: Dpid) -> Option<Arc<Switch>> {
        self.active_master.get(&dpid).map(|s| s.clone())
    }

    /// Switch if active as equal.
    pub fn equal_switch(&self, dpid: Dpid) -> Option<Arc<Switch>> {
        self.active_equal.get(&dpid).map(|s| s.clone())
    }

    /// All connected dpids.
    pub fn connected_dpids(&self) -> Vec<Dpid> {
        self.connected.iter().map(|e| *e.key()).collect()
    }

    /// Dpids active as master.
    pub fn master_dpids(&self) -> Vec<Dpid> {
        self.active_master.iter().map(|e| *e.key()).collect()
    }

    /// Dpids active as equal.
    pub fn equal_dpids(&self) -> Vec<Dpid> {
        self.active_equal.iter().map(|e| *e.key()).collect()
    }

    /// Whether the dpid is in either active map.
    pub fn is_active(&self, dpid: Dpid) -> bool {
        self.active_master.contains_key(&dpid) || self.active_equal.contains_key(&dpid)
    }

    /// Current classification.
    pub fn classify(&self, dpid: Dpid) -> SwitchClass {
        if !self.connected.contains_key(&dpid) {
            SwitchClass::Absent
        } else if self.active_master.contains_key(&dpid) {
            SwitchClass::Master
        } else if self.active_equal.contains_key(&dpid) {
            SwitchClass::Equal
        } else {
            SwitchClass::ConnectedOnly
        }
    }

    /// Whether the device answered `xid` with an ERROR.
    pub fn is_error_xid(&self, dpid: Dpid, xid: u32) -> bool {
        self.error_xids
            .get(&dpid)
            .is_some_and(|xids| xids.contains(&xid))
    }

    // Packet classification

    /// Route a device's packet-ins of one ethertype to a priority lane.
    ///
    /// Applies to connections opened after the call as well as live ones.
    pub fn add_classifier(&self, classifier: PacketClassifier) -> Result<()> {
        self.classifiers.add(classifier)?;
        tracing::debug!(
            "Classifier for {} ethertype {:#06x} -> lane {}",
            classifier.dpid,
            classifier.ethertype,
            classifier.lane
        );
        Ok(())
    }

    /// Remove a classifier. Returns whether it existed.
    pub fn remove_classifier(&self, classifier: &PacketClassifier) -> bool {
        self.classifiers.remove(classifier)
    }

    /// Classifiers in effect for a device, defaults included.
    pub fn classifiers(&self, dpid: Dpid) -> Vec<PacketClassifier> {
        self.classifiers.for_device(dpid)
    }

    /// Dispatch lane for a packet-in of `ethertype` from `dpid`.
    pub fn packet_lane(&self, dpid: Dpid, ethertype: u16) -> usize {
        self.classifiers.lane(dpid, ethertype)
    }

    // Commands

    /// Write messages to a device. Returns false if it is not connected.
    pub fn write(&self, dpid: Dpid, msgs: Vec<OfMessage>) -> bool {
        match self.get_switch(dpid) {
            Some(switch) => switch.send(msgs),
            None => {
                tracing::warn!("Write to {} dropped, switch not connected", dpid);
                false
            }
        }
    }

    /// Write a message and wait for the message dispatched under its xid.
    pub fn write_expecting_reply(&self, dpid: Dpid, msg: OfMessage) -> Result<PendingReply> {
        let switch = self
            .get_switch(dpid)
            .ok_or_else(|| OfError::NotConnected(dpid.to_string()))?;
        let xid = msg.xid;
        let pending = self.responses.register(dpid, xid);
        if !switch.send(vec![msg]) {
            self.responses.cancel(dpid, xid);
            return Err(OfError::NotConnected(dpid.to_string()));
        }
        Ok(pending)
    }

    /// Ask a device to take a role.
    pub fn set_role(&self, dpid: Dpid, role: RoleState) -> Result<()> {
        let switch = self
            .get_switch(dpid)
            .ok_or_else(|| OfError::NotConnected(dpid.to_string()))?;
        switch.set_role(role).map(|_| ())
    }

    // Dispatch

    /// Deliver an incoming active-state message.
    pub fn dispatch(&self, dpid: Dpid, msg: OfMessage) {
        let message_listeners = self.listeners.read().message.clone();
        for l in message_listeners {
            l.handle_incoming(dpid, &msg);
        }

        // Multi-part replies complete their waiter when assembled.
        let assembling = matches!(&msg.body, Body::StatsReply(r) if StatsAccumulator::accumulates(r.stats_type));
        if !assembling {
            self.responses.complete(dpid, &msg);
        }

        match &msg.body {
            Body::PortStatus(status) => self.notify_port_changed(dpid, status),
            Body::FeaturesReply(_) => self.notify_switch_changed(dpid),
            Body::Error(_) => {
                self.record_error_xid(dpid, msg.xid);
                self.fan_out(dpid, &msg);
            }
            Body::StatsReply(reply) if assembling => {
                match self.stats.push(dpid, msg.xid, reply.clone()) {
                    Ok(Some(assembled)) => {
                        let assembled = OfMessage {
                            version: msg.version,
                            xid: msg.xid,
                            body: Body::StatsReply(assembled),
                        };
                        self.responses.complete(dpid, &assembled);
                        self.fan_out(dpid, &assembled);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!("{}", e);
                        self.responses.cancel(dpid, msg.xid);
                    }
                }
            }
            Body::StatsReply(reply) if reply.stats_type == StatsType::PortDesc => {
                if !reply.is_reply_more() {
                    self.notify_switch_changed(dpid);
                }
            }
            _ if msg.msg_type() == MessageType::PacketIn => {
                let packet = self.listeners.read().packet.clone();
                for (_, l) in packet {
                    l.handle_packet(dpid, &msg);
                }
            }
            _ => self.fan_out(dpid, &msg),
        }
    }

    fn fan_out(&self, dpid: Dpid, msg: &OfMessage) {
        for l in self.event_listeners() {
            l.handle_event(dpid, msg);
        }
    }

    fn record_error_xid(&self, dpid: Dpid, xid: u32) {
        let mut xids = self.error_xids.entry(dpid).or_default();
        if xids.len() >= MAX_ERROR_XIDS {
            xids.pop_front();
        }
        xids.push_back(xid);
    }

    pub(crate) fn notify_outgoing(&self, dpid: Dpid, msg: &OfMessage) {
        let message_listeners = self.listeners.read().message.clone();
        for l in message_listeners {
            l.handle_outgoing(dpid, msg);
        }
    }

    pub(crate) fn notify_switch_changed(&self, dpid: Dpid) {
        for l in self.switch_listeners() {
            l.switch_changed(dpid);
        }
    }

    pub(crate) fn notify_port_changed(&self, dpid: Dpid, status: &PortStatus) {
        for l in self.switch_listeners() {
            l.port_changed(dpid, status);
        }
    }

    pub(crate) fn notify_role_reply(&self, dpid: Dpid, requested: RoleState, response: RoleState) {
        for l in self.switch_listeners() {
            l.role_reply_received(dpid, requested, response);
        }
    }
}
