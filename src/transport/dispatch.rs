//! Bounded hand-off from a connection to its dispatch consumer.
//!
//! ```text
//!   reader ──classify──► lane 0 ─┐  (priority lanes, drop when full)
//!             │          lane 1 ─┤
//!             │           ...    ├──► consumer ──► driver, registry
//!             └─push──► lane 7 ──┘  (default lane)
//!                 │        ▲
//!                 └─► backlog ─┘ reserve_owned()
//! ```
//!
//! Packet-ins a classifier claims go to that priority lane; everything else
//! takes the default lane. When the default lane is full, the item and
//! everything after it go to a local FIFO backlog and the connection stops
//! reading. The backlog drains in order as the consumer frees capacity.
//!
//! The consumer takes up to a lane's bulk size from each lane per pass,
//! lowest lane first.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc::{
    self,
    error::{SendError, TryRecvError, TrySendError},
    OwnedPermit,
};
use tokio::sync::Notify;

use crate::codec::packet_in_ethertype;
use crate::config::{DispatchConfig, DEFAULT_LANE};
use crate::protocol::DispatchItem;
use crate::registry::SwitchRegistry;

/// Sender side with an overflow backlog.
#[derive(Debug)]
pub(crate) struct DispatchQueue<T> {
    tx: mpsc::Sender<T>,
    backlog: VecDeque<T>,
}

impl<T: Send + 'static> DispatchQueue<T> {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                backlog: VecDeque::new(),
            },
            rx,
        )
    }

    /// Queue an item, keeping arrival order.
    pub fn push(&mut self, item: T) {
        if !self.backlog.is_empty() {
            self.backlog.push_back(item);
            return;
        }
        match self.tx.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                tracing::debug!("Dispatch queue full, pausing reads");
                self.backlog.push_back(item);
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!("Dispatch consumer gone, dropping message");
            }
        }
    }

    /// Whether reads should stay paused.
    pub fn is_paused(&self) -> bool {
        !self.backlog.is_empty()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Wait for capacity. The future does not borrow the queue.
    pub fn reserve(&self) -> impl Future<Output = Result<OwnedPermit<T>, SendError<()>>> {
        self.tx.clone().reserve_owned()
    }

    /// Move the oldest backlog item into reserved capacity.
    pub fn send_backlog(&mut self, permit: OwnedPermit<T>) {
        if let Some(item) = self.backlog.pop_front() {
            permit.send(item);
            if self.backlog.is_empty() {
                tracing::debug!("Dispatch backlog drained, resuming reads");
            }
        }
    }
}

/// Per-connection set of lanes, producer side.
#[derive(Debug)]
pub(crate) struct DispatchLanes<T> {
    default: DispatchQueue<T>,
    priority: Vec<Option<mpsc::Sender<T>>>,
    notify: Arc<Notify>,
}

#[derive(Debug)]
struct Lane<T> {
    id: usize,
    rx: mpsc::Receiver<T>,
    bulk: usize,
    closed: bool,
}

/// Consumer side of [`DispatchLanes`], ordered by lane id.
#[derive(Debug)]
pub(crate) struct LaneReceivers<T> {
    lanes: Vec<Lane<T>>,
    notify: Arc<Notify>,
}

impl<T: Send + 'static> DispatchLanes<T> {
    pub fn new(config: &DispatchConfig) -> (Self, LaneReceivers<T>) {
        let notify = Arc::new(Notify::new());
        let mut priority = Vec::with_capacity(DEFAULT_LANE);
        let mut lanes = Vec::new();

        for id in 0..DEFAULT_LANE {
            let capacity = config.lane_capacity(id);
            if capacity == 0 {
                priority.push(None);
                continue;
            }
            let (tx, rx) = mpsc::channel(capacity);
            priority.push(Some(tx));
            lanes.push(Lane {
                id,
                rx,
                bulk: config.bulk_size(id),
                closed: false,
            });
        }

        let (default, rx) = DispatchQueue::new(config.lane_capacity(DEFAULT_LANE));
        lanes.push(Lane {
            id: DEFAULT_LANE,
            rx,
            bulk: config.bulk_size(DEFAULT_LANE),
            closed: false,
        });

        (
            Self {
                default,
                priority,
                notify: notify.clone(),
            },
            LaneReceivers { lanes, notify },
        )
    }

    /// Queue an item on `lane`. Unconfigured lanes fall back to the default.
    pub fn push(&mut self, item: T, lane: usize) {
        let tx = match self.priority.get(lane) {
            Some(Some(tx)) => tx,
            _ => {
                self.default.push(item);
                self.notify.notify_one();
                return;
            }
        };
        match tx.try_send(item) {
            Ok(()) => self.notify.notify_one(),
            Err(TrySendError::Full(_)) => {
                tracing::debug!("Dispatch lane {} full, dropping message", lane);
            }
            Err(TrySendError::Closed(_)) => {
                tracing::warn!("Dispatch consumer gone, dropping message");
            }
        }
    }

    /// Whether reads should stay paused.
    pub fn is_paused(&self) -> bool {
        self.default.is_paused()
    }

    /// Wait for default-lane capacity.
    pub fn reserve(&self) -> impl Future<Output = Result<OwnedPermit<T>, SendError<()>>> {
        self.default.reserve()
    }

    /// Move the oldest backlog item into reserved capacity.
    pub fn send_backlog(&mut self, permit: OwnedPermit<T>) {
        self.default.send_backlog(permit);
        self.notify.notify_one();
    }
}

impl<T> Drop for DispatchLanes<T> {
    fn drop(&mut self) {
        // Wake the consumer so it sees the lanes close.
        self.notify.notify_one();
    }
}

impl<T> LaneReceivers<T> {
    /// Wait for the next batch. Returns false once every lane has closed
    /// and drained.
    pub async fn next_batch(&mut self, out: &mut Vec<T>) -> bool {
        loop {
            self.drain_into(out);
            if !out.is_empty() {
                return true;
            }
            if self.lanes.iter().all(|lane| lane.closed) {
                return false;
            }
            self.notify.notified().await;
        }
    }

    fn drain_into(&mut self, out: &mut Vec<T>) {
        for lane in &mut self.lanes {
            for _ in 0..lane.bulk {
                match lane.rx.try_recv() {
                    Ok(item) => out.push(item),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        if !lane.closed {
                            tracing::trace!("Dispatch lane {} closed", lane.id);
                        }
                        lane.closed = true;
                        break;
                    }
                }
            }
        }
    }
}

/// Lane a dispatched message travels on.
pub(crate) fn lane_for(registry: &SwitchRegistry, item: &DispatchItem) -> usize {
    match packet_in_ethertype(&item.msg) {
        Some(ethertype) => registry.packet_lane(item.switch.dpid(), ethertype),
        None => DEFAULT_LANE,
    }
}

/// Consumer: driver hook first, then the registry.
pub(crate) async fn run_consumer(
    mut lanes: LaneReceivers<DispatchItem>,
    registry: Arc<SwitchRegistry>,
) {
    let mut batch = Vec::new();
    while lanes.next_batch(&mut batch).await {
        for DispatchItem { switch, msg } in batch.drain(..) {
            switch.handle_message(&msg);
            registry.dispatch(switch.dpid(), msg);
        }
    }
}
