//! # ofctl - OpenFlow Control Channel
//!
//! Southbound engine of an SDN controller: accepts OpenFlow 1.0 and 1.3
//! devices, runs the control-channel handshake, negotiates the controller
//! role and keeps a registry of connected switches that upstream services
//! subscribe to.
//!
//! ## Protocol Overview
//!
//! ```text
//! Device                         Controller                        Apps
//!    |                              |                                |
//!    |------ HELLO ---------------->|                                |
//!    |<----- HELLO, FEATURES_REQ ---|                                |
//!    |<====== handshake ===========>|                                |
//!    |                              |-- switch_added --------------->|
//!    |<----- ROLE_REQUEST ----------|                                |
//!    |------ ROLE_REPLY ----------->|-- role_reply_received -------->|
//!    |                              |                                |
//!    |------ PACKET_IN ------------>|-- packet listeners ----------->|
//!    |<----- FLOW_MOD --------------|<-- registry.write ------------|
//!    |                              |                                |
//!    |------ (disconnect) --------->|-- switch_removed ------------->|
//! ```
//!
//! ### Registry Classification
//!
//! | Map            | Holds                                  |
//! |----------------|----------------------------------------|
//! | connected      | every switch that finished handshaking |
//! | active master  | switches this controller is master of  |
//! | active equal   | switches held as equal or slave        |
//!
//! A switch is in at most one of the active maps at a time.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use ofctl::{Config, Controller, DefaultDriverProvider};
//!
//! let mut controller = Controller::new(Config::default().with_ports(vec![6653]));
//! controller.start(vec![], Arc::new(DefaultDriverProvider))?;
//!
//! let registry = controller.registry();
//! for dpid in registry.master_dpids() {
//!     println!("master of {}", dpid);
//! }
//!
//! controller.stop();
//! ```
//!
//! ## Modules
//!
//! - [`codec`]: OpenFlow wire format
//! - [`protocol`]: Handshake state machine
//! - [`role`]: Master/slave/equal negotiation
//! - [`switch`]: Per-device handle and vendor drivers
//! - [`registry`]: Switch registry and dispatch hub
//! - [`transport`]: Listeners, TLS and connection tasks
//! - [`config`]: Configuration management
//! - [`error`]: Error types and result aliases

pub mod codec;
pub mod config;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod role;
pub mod switch;
pub mod transport;

// Re-exports for convenience
pub use codec::{Body, MessageType, OfCodec, OfMessage, OfVersion};
pub use config::{Config, DispatchConfig, OpenFlowConfig, TlsConfig, TlsMode};
pub use error::{OfError, Result};
pub use protocol::{ChannelContext, ChannelEvent, ChannelHandler, ChannelState};
pub use registry::{
    EventListener, MessageListener, PacketClassifier, PacketListener, PendingReply,
    SwitchListener, SwitchRegistry,
};
pub use role::{RoleManager, RoleState};
pub use switch::{
    BarrierHandshakeDriver, DefaultDriver, DefaultDriverProvider, Dpid, DriverProvider, Switch,
    SwitchDriver,
};
pub use transport::{Controller, TlsSettings};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default OpenFlow listening ports
pub const DEFAULT_PORTS: [u16; 2] = config::DEFAULT_PORTS;
