//! OpenFlow control-channel handshake.
//!
//! One state machine runs per connection. It negotiates the version, learns
//! what the device is, binds a driver and registers the switch.
//!
//! ## Message Flow
//!
//! ```text
//! Device                                   Controller
//!    |-------- HELLO ---------------------->|  negotiate 1.0 / 1.3
//!    |<------- HELLO, FEATURES_REQUEST -----|
//!    |-------- FEATURES_REPLY ------------->|  dpid, buffers, tables
//!    |<------- PORT_DESC request -----------|  (1.3)
//!    |-------- PORT_DESC reply(s) --------->|
//!    |<------- [SET_CONFIG], BARRIER, ------|  SET_CONFIG only with buffers
//!    |         GET_CONFIG_REQUEST           |
//!    |-------- GET_CONFIG_REPLY ----------->|
//!    |<------- METER_FEATURES request ------|  (1.3, best effort)
//!    |-------- METER_FEATURES reply ------->|
//!    |<------- DESC request ----------------|
//!    |-------- DESC reply ----------------->|  driver chosen
//!    |<======= driver sub-handshake =======>|  optional
//!    |                                      |  ACTIVE
//! ```
//!
//! ## State Machine
//!
//! | State                          | Leaves on                       | Next                         |
//! |--------------------------------|---------------------------------|------------------------------|
//! | `INIT`                         | task start                      | `WAIT_HELLO`                 |
//! | `WAIT_HELLO`                   | HELLO                           | `WAIT_FEATURES_REPLY`        |
//! | `WAIT_FEATURES_REPLY`          | FEATURES_REPLY                  | `WAIT_PORT_DESC_REPLY` (1.3) / `WAIT_CONFIG_REPLY` (1.0) |
//! | `WAIT_PORT_DESC_REPLY`         | last PORT_DESC fragment         | `WAIT_CONFIG_REPLY`          |
//! | `WAIT_CONFIG_REPLY`            | GET_CONFIG_REPLY, BAD_TYPE      | `WAIT_METER_FEATURES_REPLY` (1.3) / `WAIT_DESCRIPTION_STAT_REPLY` (1.0) |
//! | `WAIT_METER_FEATURES_REPLY`    | reply, error, idle, timeout     | `WAIT_DESCRIPTION_STAT_REPLY`|
//! | `WAIT_DESCRIPTION_STAT_REPLY`  | DESC reply with a driver        | `WAIT_DRIVER_SUBHANDSHAKE` / `ACTIVE` |
//! | `WAIT_DRIVER_SUBHANDSHAKE`     | driver reports completion       | `ACTIVE`                     |
//! | `ACTIVE`                       | disconnect                      | (terminal)                   |
//!
//! Handshake requests use xids counting down from `0xFFFF_FFFF`; runtime
//! requests count up from 1, so the two never collide.

mod handshake;
mod state;

pub use handshake::{
    ChannelContext, ChannelEvent, ChannelHandler, DispatchItem, StateHandle,
};
pub use state::{route, ChannelState, Route};
