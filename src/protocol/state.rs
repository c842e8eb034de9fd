//! Handshake states and the per-state routing table.

use std::fmt;

use crate::codec::MessageType;

/// Connection state. Only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ChannelState {
    /// Not started
    Init = 0,
    /// Waiting for the device's HELLO
    WaitHello = 1,
    /// FEATURES_REQUEST sent
    WaitFeaturesReply = 2,
    /// PORT_DESC request sent (1.3)
    WaitPortDescReply = 3,
    /// SET_CONFIG / GET_CONFIG_REQUEST sent
    WaitConfigReply = 4,
    /// METER_FEATURES request sent (1.3), best effort
    WaitMeterFeaturesReply = 5,
    /// DESC request sent
    WaitDescriptionStatReply = 6,
    /// Driver runs its own exchange
    WaitDriverSubHandshake = 7,
    /// Normal operation
    Active = 8,
}

impl ChannelState {
    /// States in which the handshake timer stands down.
    pub fn is_handshake_complete(self) -> bool {
        matches!(
            self,
            ChannelState::WaitMeterFeaturesReply
                | ChannelState::WaitDriverSubHandshake
                | ChannelState::Active
        )
    }

    /// Wire-free numeric form, for publishing through an atomic.
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Inverse of [`ChannelState::as_u8`].
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => ChannelState::Init,
            1 => ChannelState::WaitHello,
            2 => ChannelState::WaitFeaturesReply,
            3 => ChannelState::WaitPortDescReply,
            4 => ChannelState::WaitConfigReply,
            5 => ChannelState::WaitMeterFeaturesReply,
            6 => ChannelState::WaitDescriptionStatReply,
            7 => ChannelState::WaitDriverSubHandshake,
            8 => ChannelState::Active,
            _ => return None,
        })
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Init => "INIT",
            ChannelState::WaitHello => "WAIT_HELLO",
            ChannelState::WaitFeaturesReply => "WAIT_FEATURES_REPLY",
            ChannelState::WaitPortDescReply => "WAIT_PORT_DESC_REPLY",
            ChannelState::WaitConfigReply => "WAIT_CONFIG_REPLY",
            ChannelState::WaitMeterFeaturesReply => "WAIT_METER_FEATURES_REPLY",
            ChannelState::WaitDescriptionStatReply => "WAIT_DESCRIPTION_STAT_REPLY",
            ChannelState::WaitDriverSubHandshake => "WAIT_DRIVER_SUBHANDSHAKE",
            ChannelState::Active => "ACTIVE",
        };
        f.write_str(name)
    }
}

/// Treatment of one incoming message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// State specific handler
    Handle,
    /// Stage a port status until activation
    Buffer,
    /// Answer an echo request
    Echo,
    /// Drop with a debug log
    Ignore,
    /// Disconnect
    Illegal,
    /// Driver sub-handshake decides
    Driver,
}

/// Decide what to do with a message type in a state.
///
/// ```text
///                 HELLO  ERROR  ECHO_RQ  FEAT_RP  CFG_RP  STATS_RP  PORT_ST  other
/// WAIT_HELLO      H      H      -        X        X       X         -        -
/// WAIT_FEATURES   -      H      E        H        X       X         B        -
/// WAIT_PORT_DESC  -      H      E        -        X       H         B        -
/// WAIT_CONFIG     -      H      E        X        H       X         B        -
/// WAIT_METER      -      H      E        X        X       H         B        -
/// WAIT_DESC       -      H      E        X        X       H         B        -
/// WAIT_DRIVER     -      D      D        D        D       D         B        D
/// ACTIVE          -      H      E        H        X       H         H        H*
///
/// H handle, E echo, B buffer, D driver, X illegal, - ignore
/// * packet-in, flow-removed, barrier/queue/async replies, experimenter, role reply
/// ```
///
/// Controller-to-switch types are illegal everywhere, and nothing is legal
/// in INIT.
pub fn route(state: ChannelState, msg_type: MessageType) -> Route {
    use ChannelState as S;
    use MessageType as T;

    if state == S::Init || msg_type.is_controller_to_switch() {
        return Route::Illegal;
    }

    match (state, msg_type) {
        (S::WaitHello, T::Hello) => Route::Handle,
        (_, T::Hello) => Route::Ignore,

        (S::WaitDriverSubHandshake, T::PortStatus) => Route::Buffer,
        (S::WaitDriverSubHandshake, _) => Route::Driver,

        (_, T::Error) => Route::Handle,

        (S::WaitHello, T::EchoRequest) => Route::Ignore,
        (_, T::EchoRequest) => Route::Echo,
        (_, T::EchoReply) => Route::Ignore,

        (S::WaitHello, T::PortStatus) => Route::Ignore,
        (S::Active, T::PortStatus) => Route::Handle,
        (_, T::PortStatus) => Route::Buffer,

        (S::WaitFeaturesReply | S::Active, T::FeaturesReply) => Route::Handle,
        (S::WaitPortDescReply, T::FeaturesReply) => Route::Ignore,
        (_, T::FeaturesReply) => Route::Illegal,

        (S::WaitConfigReply, T::GetConfigReply) => Route::Handle,
        (_, T::GetConfigReply) => Route::Illegal,

        (
            S::WaitPortDescReply
            | S::WaitMeterFeaturesReply
            | S::WaitDescriptionStatReply
            | S::Active,
            T::StatsReply,
        ) => Route::Handle,
        (_, T::StatsReply) => Route::Illegal,

        (
            S::Active,
            T::PacketIn
            | T::FlowRemoved
            | T::BarrierReply
            | T::QueueGetConfigReply
            | T::GetAsyncReply
            | T::Experimenter
            | T::RoleReply,
        ) => Route::Handle,

        _ => Route::Ignore,
    }
}
