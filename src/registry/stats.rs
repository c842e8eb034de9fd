//! Multi-part reply assembly.

use dashmap::DashMap;

use crate::codec::{StatsReply, StatsType};
use crate::error::{OfError, Result};
use crate::switch::Dpid;

/// Default fragment cap per accumulator
pub const DEFAULT_MAX_FRAGMENTS: usize = 1024;

/// Default payload cap per accumulator
pub const DEFAULT_MAX_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug)]
struct Partial {
    xid: u32,
    reply: StatsReply,
    fragments: usize,
    bytes: usize,
}

/// Reassembles REPLY_MORE fragments per (device, kind).
///
/// A stream that overflows a cap is poisoned: its remaining fragments, up
/// to and including the terminal one, are swallowed so no part of it is
/// ever delivered.
#[derive(Debug)]
pub struct StatsAccumulator {
    partials: DashMap<(Dpid, StatsType), Partial>,
    poisoned: DashMap<(Dpid, StatsType), u32>,
    max_fragments: usize,
    max_bytes: usize,
}

impl Default for StatsAccumulator {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAGMENTS, DEFAULT_MAX_BYTES)
    }
}

impl StatsAccumulator {
    /// Create an accumulator with the given caps.
    pub fn new(max_fragments: usize, max_bytes: usize) -> Self {
        Self {
            partials: DashMap::new(),
            poisoned: DashMap::new(),
            max_fragments: max_fragments.max(1),
            max_bytes,
        }
    }

    /// Kinds that arrive as fragment streams worth reassembling.
    pub fn accumulates(stats_type: StatsType) -> bool {
        matches!(
            stats_type,
            StatsType::Flow
                | StatsType::FlowLightweight
                | StatsType::Table
                | StatsType::Group
                | StatsType::GroupDesc
                | StatsType::Queue
                | StatsType::Meter
        )
    }

    /// Add a fragment of the stream identified by `xid`.
    ///
    /// Returns the assembled reply once the terminal fragment arrives, `None`
    /// while more are expected or while an overflowed stream drains. The
    /// fragment that crosses a cap fails with [`OfError::StatsOverflow`].
    pub fn push(&self, dpid: Dpid, xid: u32, reply: StatsReply) -> Result<Option<StatsReply>> {
        let key = (dpid, reply.stats_type);
        let more = reply.is_reply_more();

        if let Some(poisoned_xid) = self.poisoned.get(&key).map(|x| *x) {
            if poisoned_xid == xid {
                if !more {
                    self.poisoned.remove(&key);
                }
                tracing::debug!(
                    "Dropping {:?} fragment of overflowed reply from {} xid={}",
                    key.1,
                    dpid,
                    xid
                );
                return Ok(None);
            }
            self.poisoned.remove(&key);
        }

        let partial = match self.partials.remove(&key) {
            Some((_, partial)) if partial.xid == xid => Some(partial),
            Some((_, stale)) => {
                tracing::warn!(
                    "Discarding unterminated {:?} reply from {} xid={}, superseded by xid={}",
                    key.1,
                    dpid,
                    stale.xid,
                    xid
                );
                None
            }
            None => None,
        };

        let Some(mut partial) = partial else {
            if !more {
                return Ok(Some(reply));
            }
            let bytes = reply.payload_len();
            self.check(dpid, xid, reply.stats_type, 1, bytes, more)?;
            self.partials.insert(
                key,
                Partial {
                    xid,
                    reply,
                    fragments: 1,
                    bytes,
                },
            );
            return Ok(None);
        };

        partial.fragments += 1;
        partial.bytes += reply.payload_len();
        self.check(dpid, xid, reply.stats_type, partial.fragments, partial.bytes, more)?;
        partial.reply.absorb(reply);

        if more {
            self.partials.insert(key, partial);
            Ok(None)
        } else {
            Ok(Some(partial.reply))
        }
    }

    fn check(
        &self,
        dpid: Dpid,
        xid: u32,
        stats_type: StatsType,
        fragments: usize,
        bytes: usize,
        more: bool,
    ) -> Result<()> {
        if fragments > self.max_fragments || bytes > self.max_bytes {
            if more {
                self.poisoned.insert((dpid, stats_type), xid);
            }
            return Err(OfError::StatsOverflow(format!(
                "{stats_type:?} reply from {dpid} xid={xid} exceeded {} fragments / {} bytes",
                self.max_fragments, self.max_bytes
            )));
        }
        Ok(())
    }

    /// Forget everything gathered for a device.
    pub fn clear_device(&self, dpid: Dpid) {
        self.partials.retain(|(d, _), _| *d != dpid);
        self.poisoned.retain(|(d, _), _| *d != dpid);
    }

    /// Replies currently being assembled.
    pub fn in_progress(&self) -> usize {
        self.partials.len()
    }

    /// Overflowed streams still waiting for their terminal fragment.
    pub fn draining(&self) -> usize {
        self.poisoned.len()
    }
}
