//! Outbound side of a connection, as seen from outside its task.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use super::Dpid;
use crate::codec::{OfMessage, OfVersion};

/// Instruction delivered to a connection task.
#[derive(Debug)]
pub enum ChannelCommand {
    /// Write these messages in order
    Send(Vec<OfMessage>),
    /// Close the connection
    Close,
}

/// Cloneable handle that writes to one connection.
///
/// Runtime xids count up from 1 and are shared by everything that writes to
/// the connection, role requests included.
#[derive(Debug, Clone)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<ChannelCommand>,
    xids: Arc<AtomicU32>,
}

impl ChannelSender {
    /// Wrap a command channel.
    pub fn new(tx: mpsc::UnboundedSender<ChannelCommand>) -> Self {
        Self {
            tx,
            xids: Arc::new(AtomicU32::new(1)),
        }
    }

    /// Queue messages for writing. Returns false once the connection is gone.
    pub fn send(&self, msgs: Vec<OfMessage>) -> bool {
        if msgs.is_empty() {
            return true;
        }
        self.tx.send(ChannelCommand::Send(msgs)).is_ok()
    }

    /// Queue a single message.
    pub fn send_one(&self, msg: OfMessage) -> bool {
        self.send(vec![msg])
    }

    /// Ask the connection to close.
    pub fn close(&self) {
        let _ = self.tx.send(ChannelCommand::Close);
    }

    /// Whether the connection task is still receiving.
    pub fn is_open(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Allocate a runtime xid.
    pub fn next_xid(&self) -> u32 {
        self.xids.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn xid_source(&self) -> Arc<AtomicU32> {
        self.xids.clone()
    }
}

/// What a driver gets to talk to its device.
#[derive(Debug, Clone)]
pub struct SwitchIo {
    sender: ChannelSender,
    dpid: Dpid,
    version: OfVersion,
}

impl SwitchIo {
    pub(crate) fn new(sender: ChannelSender, dpid: Dpid, version: OfVersion) -> Self {
        Self {
            sender,
            dpid,
            version,
        }
    }

    /// Device identity
    pub fn dpid(&self) -> Dpid {
        self.dpid
    }

    /// Negotiated version
    pub fn version(&self) -> OfVersion {
        self.version
    }

    /// Allocate a runtime xid.
    pub fn next_xid(&self) -> u32 {
        self.sender.next_xid()
    }

    /// Queue messages for writing.
    pub fn send(&self, msgs: Vec<OfMessage>) -> bool {
        self.sender.send(msgs)
    }

    /// Queue a single message.
    pub fn send_one(&self, msg: OfMessage) -> bool {
        self.sender.send_one(msg)
    }

    /// Ask the connection to close.
    pub fn close(&self) {
        self.sender.close();
    }

    pub(crate) fn sender(&self) -> &ChannelSender {
        &self.sender
    }
}
