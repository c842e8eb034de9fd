//! Packet-in classification onto dispatch lanes.
//!
//! A classifier routes packet-ins of one ethertype from one device onto a
//! priority lane, so discovery traffic is not stuck behind bulk traffic.
//! Devices without explicit classifiers send LLDP and BDDP to lane 0.

use dashmap::DashMap;

use crate::codec::{ETH_TYPE_BDDP, ETH_TYPE_LLDP};
use crate::config::{DEFAULT_LANE, DISPATCH_LANES};
use crate::error::{OfError, Result};
use crate::switch::Dpid;

/// Routes a device's packet-ins with `ethertype` to `lane`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketClassifier {
    /// Device the rule applies to
    pub dpid: Dpid,
    /// Ethertype of the embedded frame
    pub ethertype: u16,
    /// Destination lane, `0..DISPATCH_LANES`
    pub lane: usize,
}

impl PacketClassifier {
    /// Create a classifier.
    pub fn new(dpid: Dpid, ethertype: u16, lane: usize) -> Self {
        Self {
            dpid,
            ethertype,
            lane,
        }
    }
}

fn defaults() -> Vec<(u16, usize)> {
    vec![(ETH_TYPE_LLDP, 0), (ETH_TYPE_BDDP, 0)]
}

#[derive(Debug, Default)]
pub(crate) struct ClassifierTable {
    by_device: DashMap<Dpid, Vec<(u16, usize)>>,
}

impl ClassifierTable {
    /// Add or re-target the rule for `(dpid, ethertype)`.
    pub fn add(&self, classifier: PacketClassifier) -> Result<()> {
        if classifier.lane >= DISPATCH_LANES {
            return Err(OfError::Config(format!(
                "dispatch lane {} out of range 0..{}",
                classifier.lane, DISPATCH_LANES
            )));
        }
        let mut rules = self.by_device.entry(classifier.dpid).or_insert_with(defaults);
        match rules.iter_mut().find(|(eth, _)| *eth == classifier.ethertype) {
            Some(rule) => rule.1 = classifier.lane,
            None => rules.push((classifier.ethertype, classifier.lane)),
        }
        Ok(())
    }

    /// Remove a rule. Removing a default rule leaves the device with none.
    pub fn remove(&self, classifier: &PacketClassifier) -> bool {
        let mut rules = self.by_device.entry(classifier.dpid).or_insert_with(defaults);
        let before = rules.len();
        rules.retain(|&(eth, lane)| (eth, lane) != (classifier.ethertype, classifier.lane));
        rules.len() != before
    }

    pub fn for_device(&self, dpid: Dpid) -> Vec<PacketClassifier> {
        let rules = match self.by_device.get(&dpid) {
            Some(rules) => rules.clone(),
            None => defaults(),
        };
        rules
            .into_iter()
            .map(|(ethertype, lane)| PacketClassifier::new(dpid, ethertype, lane))
            .collect()
    }

    /// Lane for a packet-in of `ethertype` from `dpid`.
    pub fn lane(&self, dpid: Dpid, ethertype: u16) -> usize {
        let find = |rules: &[(u16, usize)]| {
            rules
                .iter()
                .find(|(eth, _)| *eth == ethertype)
                .map_or(DEFAULT_LANE, |&(_, lane)| lane)
        };
        match self.by_device.get(&dpid) {
            Some(rules) => find(&rules),
            None => find(&defaults()),
        }
    }
}
