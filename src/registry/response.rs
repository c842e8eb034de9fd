//! Correlating replies with requests by xid.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::codec::OfMessage;
use crate::error::{OfError, Result};
use crate::switch::Dpid;

/// Resolves with the first message dispatched under the request's xid.
///
/// Resolves to [`OfError::ReplyDropped`] if the device goes away first.
/// Dropping it withdraws the request from the correlation table.
#[derive(Debug)]
pub struct PendingReply {
    dpid: Dpid,
    xid: u32,
    rx: oneshot::Receiver<OfMessage>,
    table: Weak<Waiters>,
}

impl PendingReply {
    /// Transaction id being waited on.
    pub fn xid(&self) -> u32 {
        self.xid
    }
}

impl Future for PendingReply {
    type Output = Result<OfMessage>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| OfError::ReplyDropped))
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        // Closing first marks our sender, so a newer waiter under the same
        // xid is left alone.
        self.rx.close();
        if let Some(waiters) = self.table.upgrade() {
            waiters.remove_if(&(self.dpid, self.xid), |_, tx| tx.is_closed());
        }
    }
}

type Waiters = DashMap<(Dpid, u32), oneshot::Sender<OfMessage>>;

#[derive(Debug, Default)]
pub(crate) struct ResponseTable {
    waiters: Arc<Waiters>,
}

impl ResponseTable {
    pub fn register(&self, dpid: Dpid, xid: u32) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        if self.waiters.insert((dpid, xid), tx).is_some() {
            tracing::warn!("Replaced pending reply for {} xid={}", dpid, xid);
        }
        PendingReply {
            dpid,
            xid,
            rx,
            table: Arc::downgrade(&self.waiters),
        }
    }

    /// Complete the waiter for `msg.xid`, if any. Each waiter fires once.
    pub fn complete(&self, dpid: Dpid, msg: &OfMessage) -> bool {
        match self.waiters.remove(&(dpid, msg.xid)) {
            Some((_, tx)) => {
                // The caller may have dropped its future; that is fine.
                let _ = tx.send(msg.clone());
                true
            }
            None => false,
        }
    }

    pub fn cancel(&self, dpid: Dpid, xid: u32) {
        self.waiters.remove(&(dpid, xid));
    }

    pub fn clear_device(&self, dpid: Dpid) {
        self.waiters.retain(|(d, _), _| *d != dpid);
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Body, OfVersion};

    #[tokio::test]
    async fn test_completes_once() {
        let table = ResponseTable::default();
        let pending = table.register(Dpid(1), 7);
        assert_eq!(pending.xid(), 7);

        let reply = OfMessage::new(OfVersion::Of13, 7, Body::BarrierReply);
        assert!(table.complete(Dpid(1), &reply));
        assert!(!table.complete(Dpid(1), &reply));
        assert_eq!(pending.await.unwrap(), reply);
    }

    #[tokio::test]
    async fn test_other_device_does_not_complete() {
        let table = ResponseTable::default();
        let _pending = table.register(Dpid(1), 7);
        let reply = OfMessage::new(OfVersion::Of13, 7, Body::BarrierReply);
        assert!(!table.complete(Dpid(2), &reply));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_dropped_waiter_leaves_table() {
        let table = ResponseTable::default();
        let pending = table.register(Dpid(1), 9);
        assert_eq!(table.len(), 1);
        drop(pending);
        assert_eq!(table.len(), 0);

        // A late reply finds nobody waiting.
        let reply = OfMessage::new(OfVersion::Of13, 9, Body::BarrierReply);
        assert!(!table.complete(Dpid(1), &reply));
    }

    #[tokio::test]
    async fn test_dropping_replaced_waiter_keeps_newer() {
        let table = ResponseTable::default();
        let first = table.register(Dpid(1), 4);
        let second = table.register(Dpid(1), 4);
        drop(first);
        assert_eq!(table.len(), 1);

        let reply = OfMessage::new(OfVersion::Of13, 4, Body::BarrierReply);
        assert!(table.complete(Dpid(1), &reply));
        assert_eq!(second.await.unwrap(), reply);
        assert_eq!(table.len(), 0);
    }

    #[test]
    fn test_waiter_outliving_table() {
        let table = ResponseTable::default();
        let pending = table.register(Dpid(2), 1);
        drop(table);
        drop(pending);
    }

    #[tokio::test]
    async fn test_clear_drops_reply() {
        let table = ResponseTable::default();
        let pending = table.register(Dpid(3), 1);
        table.clear_device(Dpid(3));
        assert!(matches!(pending.await, Err(OfError::ReplyDropped)));
    }
}
