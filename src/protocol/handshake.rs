//! Per-connection handshake driver.
//!
//! A [`ChannelHandler`] owns everything one connection learns while it
//! brings a device up. The connection task feeds it [`ChannelEvent`]s in
//! arrival order (decoded messages and timer ticks) and writes whatever it
//! queues on the [`ChannelSender`]. Any `Err` returned by the handler ends
//! the connection.
//!
//! Active-state messages are not dispatched inline. They are collected as
//! [`DispatchItem`]s and handed to the connection's dispatch queue through
//! [`ChannelHandler::take_dispatch`].

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::time::Instant;

use super::state::{route, ChannelState, Route};
use crate::codec::{
    Body, DescStats, ErrorMsg, FeaturesReply, Hello, MessageType, MeterFeatures, OfMessage,
    OfVersion, PortDesc, StatsBody, StatsReply, StatsType, SwitchConfig, MISS_SEND_LEN_FULL,
    NICIRA_EXPERIMENTER,
};
use crate::config::OpenFlowConfig;
use crate::error::{OfError, Result};
use crate::registry::SwitchRegistry;
use crate::switch::{
    ChannelSender, DefaultDriverProvider, Dpid, DriverProvider, Switch, SwitchIo, SwitchParts,
};
use crate::transport::DeviceCertificates;

/// Passes over the port-status buffer at activation
const MAX_REPLAY_PASSES: usize = 5;

/// What every connection of a controller shares.
#[derive(Clone)]
pub struct ChannelContext {
    /// Switch registry
    pub registry: Arc<SwitchRegistry>,
    /// Driver selection
    pub drivers: Arc<dyn DriverProvider>,
    /// Pinned certificates for strict TLS
    pub certificates: Arc<DeviceCertificates>,
    /// Timer settings snapshot
    pub config: OpenFlowConfig,
}

impl fmt::Debug for ChannelContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelContext")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ChannelContext {
    /// Context with default timers, permissive certificates and the default
    /// driver provider.
    pub fn new(registry: Arc<SwitchRegistry>) -> Self {
        Self {
            registry,
            drivers: Arc::new(DefaultDriverProvider),
            certificates: Arc::new(DeviceCertificates::permissive()),
            config: OpenFlowConfig::default(),
        }
    }

    /// Use a driver provider.
    pub fn with_drivers(mut self, drivers: Arc<dyn DriverProvider>) -> Self {
        self.drivers = drivers;
        self
    }

    /// Use a certificate check.
    pub fn with_certificates(mut self, certificates: Arc<DeviceCertificates>) -> Self {
        self.certificates = certificates;
        self
    }

    /// Use timer settings.
    pub fn with_config(mut self, config: OpenFlowConfig) -> Self {
        self.config = config;
        self
    }
}

/// An active-state message waiting for the dispatch queue.
#[derive(Debug)]
pub struct DispatchItem {
    /// Switch it came from
    pub switch: Arc<Switch>,
    /// The message
    pub msg: OfMessage,
}

/// Input to the state machine.
#[derive(Debug)]
pub enum ChannelEvent {
    /// A decoded message
    Message(OfMessage),
    /// `max_idle_retry` idle ticks passed without inbound bytes
    Idle,
    /// The meter features wait expired
    MeterTimeout,
    /// The handshake timer fired
    HandshakeTimeout,
}

/// Read-only view of a connection's state from other threads.
#[derive(Debug, Clone)]
pub struct StateHandle(Arc<AtomicU8>);

impl StateHandle {
    /// Current state.
    pub fn get(&self) -> ChannelState {
        ChannelState::from_u8(self.0.load(Ordering::Acquire)).unwrap_or(ChannelState::Init)
    }
}

/// Handshake state machine for one connection.
pub struct ChannelHandler {
    ctx: ChannelContext,
    sender: ChannelSender,
    remote: String,
    peer_certificate: Option<Vec<u8>>,
    state: ChannelState,
    published: Arc<AtomicU8>,
    state_entered: Instant,
    version: Option<OfVersion>,
    handshake_xid: u32,
    dpid: Option<Dpid>,
    features: Option<FeaturesReply>,
    port_desc: Vec<PortDesc>,
    meter_features: Option<MeterFeatures>,
    pending_port_status: Vec<OfMessage>,
    switch: Option<Arc<Switch>>,
    duplicate: bool,
    dispatch: Vec<DispatchItem>,
    messages_received: u64,
}

impl fmt::Display for ChannelHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dpid {
            Some(dpid) => write!(f, "[{} DPID[{}]]", self.remote, dpid),
            None => write!(f, "[{} DPID[?]]", self.remote),
        }
    }
}

impl fmt::Debug for ChannelHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandler")
            .field("remote", &self.remote)
            .field("state", &self.state)
            .field("version", &self.version)
            .field("dpid", &self.dpid)
            .field("duplicate", &self.duplicate)
            .finish_non_exhaustive()
    }
}

impl ChannelHandler {
    /// Handler for a freshly accepted connection, in INIT.
    pub fn new(
        ctx: ChannelContext,
        sender: ChannelSender,
        remote: impl Into<String>,
        peer_certificate: Option<Vec<u8>>,
    ) -> Self {
        Self {
            ctx,
            sender,
            remote: remote.into(),
            peer_certificate,
            state: ChannelState::Init,
            published: Arc::new(AtomicU8::new(ChannelState::Init.as_u8())),
            state_entered: Instant::now(),
            version: None,
            handshake_xid: u32::MAX,
            dpid: None,
            features: None,
            port_desc: Vec::new(),
            meter_features: None,
            pending_port_status: Vec::new(),
            switch: None,
            duplicate: false,
            dispatch: Vec::new(),
            messages_received: 0,
        }
    }

    /// Leave INIT and wait for the device's HELLO.
    pub fn start(&mut self) {
        tracing::info!("New switch connection from {}", self.remote);
        self.set_state(ChannelState::WaitHello);
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Shareable view of the state.
    pub fn state_handle(&self) -> StateHandle {
        StateHandle(self.published.clone())
    }

    /// When the current state was entered.
    pub fn state_entered(&self) -> Instant {
        self.state_entered
    }

    /// Negotiated version, once HELLO was processed.
    pub fn version(&self) -> Option<OfVersion> {
        self.version
    }

    /// Datapath id, once the features reply arrived.
    pub fn dpid(&self) -> Option<Dpid> {
        self.dpid
    }

    /// The switch handle, once a driver was bound.
    pub fn switch(&self) -> Option<&Arc<Switch>> {
        self.switch.as_ref()
    }

    /// Whether activation found the dpid already connected.
    pub fn is_duplicate(&self) -> bool {
        self.duplicate
    }

    /// Messages processed so far.
    pub fn messages_received(&self) -> u64 {
        self.messages_received
    }

    /// Deadline for the meter features reply while waiting for it.
    pub fn meter_deadline(&self) -> Option<Instant> {
        (self.state == ChannelState::WaitMeterFeaturesReply)
            .then(|| self.state_entered + self.ctx.config.meter_timeout())
    }

    /// Messages collected for dispatch since the last call.
    pub fn take_dispatch(&mut self) -> Vec<DispatchItem> {
        std::mem::take(&mut self.dispatch)
    }

    /// Feed one event.
    pub fn process_event(&mut self, event: ChannelEvent) -> Result<()> {
        match event {
            ChannelEvent::Message(msg) => self.process_message(msg),
            ChannelEvent::Idle => self.process_idle(),
            ChannelEvent::MeterTimeout => self.process_meter_timeout(),
            ChannelEvent::HandshakeTimeout => self.check_handshake_timeout(),
        }
    }

    /// Feed one decoded message.
    pub fn process_message(&mut self, msg: OfMessage) -> Result<()> {
        self.messages_received += 1;
        self.route_message(msg)
    }

    fn route_message(&mut self, msg: OfMessage) -> Result<()> {
        let msg_type = msg.msg_type();
        match route(self.state, msg_type) {
            Route::Illegal => Err(OfError::IllegalStateMessage {
                state: self.state,
                msg_type,
            }),
            Route::Ignore => {
                if msg_type == MessageType::Hello {
                    tracing::warn!("Ignoring HELLO from {} in state {}", self, self.state);
                } else {
                    tracing::debug!("Ignoring {:?} from {} in state {}", msg_type, self, self.state);
                }
                Ok(())
            }
            Route::Echo => self.on_echo_request(&msg),
            Route::Buffer => {
                tracing::debug!("Buffering port status from {} in state {}", self, self.state);
                self.pending_port_status.push(msg);
                Ok(())
            }
            Route::Driver => self.process_driver_message(msg),
            Route::Handle => self.handle(msg),
        }
    }

    fn handle(&mut self, msg: OfMessage) -> Result<()> {
        use ChannelState as S;

        if self.state == S::Active {
            return self.handle_active(msg);
        }

        let OfMessage { version, xid, body } = msg;
        match (self.state, body) {
            (_, Body::Error(error)) => self.on_handshake_error(xid, error),
            (S::WaitHello, Body::Hello(hello)) => self.on_hello(version, hello),
            (S::WaitFeaturesReply, Body::FeaturesReply(features)) => {
                self.on_features_reply(features)
            }
            (S::WaitPortDescReply, Body::StatsReply(reply)) => self.on_port_desc(reply),
            (S::WaitConfigReply, Body::GetConfigReply(config)) => self.on_config_reply(config),
            (S::WaitMeterFeaturesReply, Body::StatsReply(reply)) => self.on_meter_features(reply),
            (S::WaitDescriptionStatReply, Body::StatsReply(reply)) => self.on_description(reply),
            (state, body) => {
                tracing::debug!("Unhandled {:?} from {} in state {}", body.msg_type(), self, state);
                Ok(())
            }
        }
    }

    // Handshake steps

    fn on_hello(&mut self, wire_version: u8, hello: Hello) -> Result<()> {
        let version = OfVersion::negotiate(wire_version, hello.bitmap)
            .ok_or(OfError::UnsupportedVersion(wire_version))?;
        self.version = Some(version);
        tracing::debug!("Negotiated {} with {}", version, self.remote);

        let hello_xid = self.next_handshake_xid();
        let features_xid = self.next_handshake_xid();
        self.send(vec![
            OfMessage::hello(version, hello_xid),
            OfMessage::new(version, features_xid, Body::FeaturesRequest),
        ]);
        self.set_state(ChannelState::WaitFeaturesReply);
        Ok(())
    }

    fn on_features_reply(&mut self, features: FeaturesReply) -> Result<()> {
        let dpid = Dpid(features.datapath_id);
        if !self
            .ctx
            .certificates
            .is_valid(dpid, self.peer_certificate.as_deref())
        {
            return Err(OfError::Tls(format!(
                "certificate presented by {} is not pinned for {}",
                self.remote, dpid
            )));
        }
        self.dpid = Some(dpid);
        tracing::info!(
            "Received features reply from {}: {} buffers, {} tables",
            self,
            features.n_buffers,
            features.n_tables
        );
        self.features = Some(features);

        match self.negotiated()? {
            OfVersion::Of10 => self.send_set_config(),
            version @ OfVersion::Of13 => {
                let xid = self.next_handshake_xid();
                self.send(vec![OfMessage::stats_request(version, xid, StatsType::PortDesc)]);
                self.set_state(ChannelState::WaitPortDescReply);
                Ok(())
            }
        }
    }

    fn on_port_desc(&mut self, reply: StatsReply) -> Result<()> {
        let more = reply.is_reply_more();
        let StatsBody::PortDesc(ports) = reply.body else {
            tracing::warn!(
                "Ignoring {:?} stats reply from {} while waiting for port descriptions",
                reply.stats_type,
                self
            );
            return Ok(());
        };
        self.port_desc.extend(ports);
        if more {
            tracing::debug!("Port description from {} continues", self);
            return Ok(());
        }
        self.send_set_config()
    }

    fn send_set_config(&mut self) -> Result<()> {
        let version = self.negotiated()?;
        let n_buffers = self.features.as_ref().map_or(0, |f| f.n_buffers);

        let mut msgs = Vec::with_capacity(3);
        if n_buffers > 0 {
            let xid = self.next_handshake_xid();
            msgs.push(OfMessage::new(
                version,
                xid,
                Body::SetConfig(SwitchConfig {
                    flags: 0,
                    miss_send_len: MISS_SEND_LEN_FULL,
                }),
            ));
        } else {
            tracing::debug!("{} has no packet buffers, not sending SET_CONFIG", self);
        }
        let barrier_xid = self.next_handshake_xid();
        msgs.push(OfMessage::new(version, barrier_xid, Body::BarrierRequest));
        let get_config_xid = self.next_handshake_xid();
        msgs.push(OfMessage::new(version, get_config_xid, Body::GetConfigRequest));

        self.send(msgs);
        self.set_state(ChannelState::WaitConfigReply);
        Ok(())
    }

    fn on_config_reply(&mut self, config: SwitchConfig) -> Result<()> {
        if config.miss_send_len != MISS_SEND_LEN_FULL {
            tracing::info!(
                "Config reply from {} has miss send length {}",
                self,
                config.miss_send_len
            );
        }
        self.after_config()
    }

    fn after_config(&mut self) -> Result<()> {
        match self.negotiated()? {
            version @ OfVersion::Of13 => {
                let xid = self.next_handshake_xid();
                self.send(vec![OfMessage::stats_request(version, xid, StatsType::MeterFeatures)]);
                self.set_state(ChannelState::WaitMeterFeaturesReply);
                Ok(())
            }
            OfVersion::Of10 => self.send_desc_request(),
        }
    }

    fn on_meter_features(&mut self, reply: StatsReply) -> Result<()> {
        let StatsBody::MeterFeatures(features) = reply.body else {
            return Err(OfError::IllegalStateMessage {
                state: self.state,
                msg_type: MessageType::StatsReply,
            });
        };
        tracing::debug!("{} supports {} meters", self, features.max_meter);
        self.meter_features = Some(features);
        self.send_desc_request()
    }

    fn skip_meter_features(&mut self) -> Result<()> {
        if self.state != ChannelState::WaitMeterFeaturesReply {
            return Ok(());
        }
        tracing::warn!("No meter features from {}, continuing without meter support", self);
        self.meter_features = None;
        self.send_desc_request()
    }

    fn send_desc_request(&mut self) -> Result<()> {
        let version = self.negotiated()?;
        let xid = self.next_handshake_xid();
        self.send(vec![OfMessage::stats_request(version, xid, StatsType::Desc)]);
        self.set_state(ChannelState::WaitDescriptionStatReply);
        Ok(())
    }

    fn on_description(&mut self, reply: StatsReply) -> Result<()> {
        match reply.body {
            StatsBody::Desc(desc) => self.bind_driver(desc),
            _ => {
                tracing::debug!(
                    "Ignoring {:?} stats reply from {} while waiting for description",
                    reply.stats_type,
                    self
                );
                Ok(())
            }
        }
    }

    fn bind_driver(&mut self, desc: DescStats) -> Result<()> {
        let version = self.negotiated()?;
        let dpid = self.dpid.ok_or(OfError::IllegalStateMessage {
            state: self.state,
            msg_type: MessageType::StatsReply,
        })?;
        tracing::info!(
            "Received description from {}: {} / {} / {}",
            self,
            desc.mfr_desc,
            desc.hw_desc,
            desc.sw_desc
        );

        let Some(driver) = self.ctx.drivers.driver(dpid, &desc, version) else {
            tracing::warn!(
                "No driver for {} ({} {}), waiting in {}",
                self,
                desc.mfr_desc,
                desc.hw_desc,
                self.state
            );
            return Ok(());
        };

        let features = self.features.clone().unwrap_or_default();
        let ports = match version {
            OfVersion::Of10 => features.ports.clone(),
            OfVersion::Of13 => std::mem::take(&mut self.port_desc),
        };
        let parts = SwitchParts {
            io: SwitchIo::new(self.sender.clone(), dpid, version),
            remote: self.remote.clone(),
            desc,
            features,
            ports,
            meter_features: self.meter_features,
            role_timeout: self.ctx.config.role_timeout(),
        };
        let switch = Switch::new(parts, driver, self.ctx.registry.clone());
        self.switch = Some(switch.clone());

        switch.start_driver_handshake();
        if switch.is_driver_handshake_complete() {
            self.activate(switch)
        } else {
            self.set_state(ChannelState::WaitDriverSubHandshake);
            Ok(())
        }
    }

    fn process_driver_message(&mut self, msg: OfMessage) -> Result<()> {
        let Some(switch) = self.switch.clone() else {
            return Err(OfError::IllegalStateMessage {
                state: self.state,
                msg_type: msg.msg_type(),
            });
        };

        if switch.is_driver_handshake_complete() {
            self.activate(switch)?;
            return self.route_message(msg);
        }

        match &msg.body {
            Body::EchoRequest(_) => self.on_echo_request(&msg)?,
            Body::RoleReply(_) | Body::Experimenter(_) => {
                if !switch.handle_role_message(&msg)? {
                    switch.process_driver_handshake_message(&msg);
                }
            }
            Body::Error(_) => {
                if !switch.handle_role_error(&msg)? {
                    switch.process_driver_handshake_message(&msg);
                }
            }
            _ => switch.process_driver_handshake_message(&msg),
        }

        if switch.is_driver_handshake_complete() {
            self.activate(switch)?;
        }
        Ok(())
    }

    fn activate(&mut self, switch: Arc<Switch>) -> Result<()> {
        if !switch.connect_switch() {
            self.duplicate = true;
            return Err(OfError::DuplicateIdentity(switch.dpid().to_string()));
        }
        self.replay_port_status(&switch);
        self.set_state(ChannelState::Active);
        tracing::info!("Switch {} is active", switch);
        Ok(())
    }

    /// Apply buffered port status without notifying listeners.
    fn replay_port_status(&mut self, switch: &Switch) {
        for pass in 1..=MAX_REPLAY_PASSES {
            if self.pending_port_status.is_empty() {
                return;
            }
            let batch = std::mem::take(&mut self.pending_port_status);
            tracing::debug!(
                "Replaying {} port status messages for {} (pass {})",
                batch.len(),
                switch,
                pass
            );
            for msg in batch {
                if let Body::PortStatus(status) = &msg.body {
                    switch.apply_port_status(status);
                }
            }
        }
        if !self.pending_port_status.is_empty() {
            tracing::warn!(
                "Dropping {} port status messages for {} after {} passes",
                self.pending_port_status.len(),
                switch,
                MAX_REPLAY_PASSES
            );
            self.pending_port_status.clear();
        }
    }

    // Active state

    fn handle_active(&mut self, msg: OfMessage) -> Result<()> {
        let Some(switch) = self.switch.clone() else {
            return Err(OfError::IllegalStateMessage {
                state: self.state,
                msg_type: msg.msg_type(),
            });
        };

        match &msg.body {
            Body::Error(error) => {
                let version = switch.version();
                // An error answering one of our role requests is settled by
                // role handling alone.
                let role_error = switch.handle_role_error(&msg)?;
                if role_error {
                    tracing::debug!("{} answered role request xid={} with an error", switch, msg.xid);
                } else if error.is_permission_denied(version) {
                    tracing::warn!("{} refused a request as slave, reasserting role", switch);
                    switch.reassert_role();
                } else if error.is_table_full(version) {
                    tracing::warn!("Flow table full on {}", switch);
                    switch.set_table_full(true);
                } else {
                    tracing::info!(
                        "Error from {} xid={}: type={} code={}",
                        switch,
                        msg.xid,
                        error.err_type,
                        error.code
                    );
                }
                self.queue(switch, msg);
            }
            Body::StatsReply(reply) => {
                if let StatsBody::PortDesc(ports) = &reply.body {
                    self.port_desc.extend(ports.iter().cloned());
                    if !reply.is_reply_more() {
                        switch.set_ports(std::mem::take(&mut self.port_desc));
                    }
                }
                self.queue(switch, msg);
            }
            Body::RoleReply(_) => {
                switch.handle_role_message(&msg)?;
            }
            Body::Experimenter(exp) if exp.experimenter == NICIRA_EXPERIMENTER => {
                if !switch.handle_role_message(&msg)? {
                    self.queue(switch, msg);
                }
            }
            Body::PortStatus(status) => {
                switch.apply_port_status(status);
                self.queue(switch, msg);
            }
            Body::FeaturesReply(features) => {
                switch.set_features(features.clone());
                self.queue(switch, msg);
            }
            _ => self.queue(switch, msg),
        }
        Ok(())
    }

    fn queue(&mut self, switch: Arc<Switch>, msg: OfMessage) {
        self.dispatch.push(DispatchItem { switch, msg });
    }

    // Errors and echo

    fn on_handshake_error(&mut self, xid: u32, error: ErrorMsg) -> Result<()> {
        match self.state {
            ChannelState::WaitConfigReply if error.is_bad_type() => {
                tracing::info!("{} does not support GET_CONFIG, continuing", self);
                self.after_config()
            }
            ChannelState::WaitMeterFeaturesReply => {
                tracing::info!("{} answered meter features with an error", self);
                self.skip_meter_features()
            }
            state => Err(OfError::DeviceError(format!(
                "{} in state {}: xid={} type={} code={}",
                self, state, xid, error.err_type, error.code
            ))),
        }
    }

    fn on_echo_request(&mut self, msg: &OfMessage) -> Result<()> {
        if let Some(reply) = OfMessage::echo_reply_to(msg) {
            self.send(vec![reply]);
        }
        if self.state == ChannelState::WaitMeterFeaturesReply
            && self.state_entered.elapsed() >= self.ctx.config.meter_timeout()
        {
            return self.skip_meter_features();
        }
        Ok(())
    }

    // Timers

    /// Idle tick: send an echo request, then act per state.
    pub fn process_idle(&mut self) -> Result<()> {
        if let Some(version) = self.version {
            let xid = self.sender.next_xid();
            self.send(vec![OfMessage::new(version, xid, Body::EchoRequest(Bytes::new()))]);
        }
        self.evict_expired_roles();

        match self.state {
            ChannelState::Active => {
                tracing::debug!("Idle on {}", self);
                Ok(())
            }
            ChannelState::WaitMeterFeaturesReply => self.skip_meter_features(),
            state => Err(OfError::HandshakeTimeout(state)),
        }
    }

    /// Meter features wait expired.
    pub fn process_meter_timeout(&mut self) -> Result<()> {
        self.skip_meter_features()
    }

    /// Handshake timer fired.
    pub fn check_handshake_timeout(&self) -> Result<()> {
        if self.state.is_handshake_complete() {
            tracing::debug!("Handshake timer for {} stands down in {}", self, self.state);
            return Ok(());
        }
        Err(OfError::HandshakeTimeout(self.state))
    }

    /// Drop role requests past their expiry.
    pub fn evict_expired_roles(&self) {
        if let Some(switch) = &self.switch {
            switch.evict_expired_roles();
        }
    }

    /// Connection cleanup. Only an activated, non-duplicate switch leaves
    /// the registry.
    pub fn on_disconnect(&mut self) {
        tracing::info!("Switch disconnected: {} in state {}", self, self.state);
        let Some(switch) = self.switch.take() else {
            return;
        };
        if self.state == ChannelState::Active && !self.duplicate {
            switch.disconnect_switch();
        }
    }

    // Helpers

    fn set_state(&mut self, next: ChannelState) {
        tracing::debug!("{} {} -> {}", self, self.state, next);
        self.state = next;
        self.published.store(next.as_u8(), Ordering::Release);
        self.state_entered = Instant::now();
    }

    fn next_handshake_xid(&mut self) -> u32 {
        let xid = self.handshake_xid;
        self.handshake_xid = self.handshake_xid.wrapping_sub(1);
        xid
    }

    fn negotiated(&self) -> Result<OfVersion> {
        self.version.ok_or(OfError::IllegalStateMessage {
            state: self.state,
            msg_type: MessageType::Hello,
        })
    }

    fn send(&self, msgs: Vec<OfMessage>) {
        if !self.sender.send(msgs) {
            tracing::debug!("Connection to {} already closed", self);
        }
    }
}
