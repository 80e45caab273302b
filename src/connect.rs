//! Region connection: propagating causality across goroutines
//!
//! The events in a trace form a graph. Each event may be connected to up to
//! four others: its neighbors on the same goroutine, a `GoStart` on another
//! goroutine that it unblocked, and the event that unblocked its own start.
//! Searching that graph forward from a region's start finds everything the
//! region *caused*; searching backward from its end finds everything it
//! *benefited from*. Neither search alone tells the right story: a DNS
//! lookup's results may be shared with dials that did not cause it, a round
//! trip may reuse a pooled connection it never spoke to until the response
//! arrived, and a connection may serve several high-level operations in
//! turn, so no "reason for being" can be permanent.
//!
//! Instead the [`RegionConnector`] works in chronological order across all
//! goroutines, maintaining each goroutine's current [`RegionStack`]: its
//! explanation-of-the-moment:
//!
//! - A region starting on a goroutine layers onto that goroutine's stack:
//!   the writer loop entering "write this request" is still working on
//!   behalf of the round trip that asked for it.
//! - A wakeup edge proposes the waker's stack to the woken goroutine. The
//!   proposal is trimmed back to the target's own most recent presence in
//!   the chain, shared regions never overwrite an established explanation,
//!   and a goroutine with an active local region keeps it.
//! - A region ending is removed from its goroutine's stack, re-attaching any
//!   still-open local regions above it.
//!
//! Nodes are immutable and structurally shared, so each event's recorded
//! stack is a cheap `Arc` into the running chains.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::data::Data;
use crate::event::{EventId, EventKind};
use crate::track::{Region, RegionId, RegionStack};

/// Per-event region stacks, indexed by [`EventId`]. `None` means no region
/// explains the event.
#[derive(Debug)]
pub struct Connections {
    pub event_region_stacks: Vec<Option<Arc<RegionStack>>>,
}

/// Hook signature for overriding the connector's start-region rule.
pub type StartRegionFn = Box<
    dyn Fn(
        &Data,
        &[Region],
        EventId,
        Option<Arc<RegionStack>>,
        Option<Arc<RegionStack>>,
    ) -> Option<Arc<RegionStack>>,
>;

/// Hook signature for overriding the connector's wakeup rule.
pub type ApplyOnWakeFn = Box<
    dyn Fn(
        &Data,
        &[Region],
        EventId,
        Option<Arc<RegionStack>>,
        Option<Arc<RegionStack>>,
    ) -> Option<Arc<RegionStack>>,
>;

/// Computes the region stack in effect for every event. The two rules are
/// overridable for experiments; the defaults implement the behavior
/// described at the module level.
#[derive(Default)]
pub struct RegionConnector {
    pub start_region: Option<StartRegionFn>,
    pub apply_on_wake: Option<ApplyOnWakeFn>,
}

impl RegionConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The default start rule: newly-started regions are additional context,
    /// not replacements. Rebuilds the `starting` prefix node-by-node and
    /// attaches `existing` beneath its tail.
    pub fn default_start_region(
        _data: &Data,
        _regions: &[Region],
        _ev: EventId,
        existing: Option<Arc<RegionStack>>,
        starting: Option<Arc<RegionStack>>,
    ) -> Option<Arc<RegionStack>> {
        let prefix: Vec<(EventId, Option<RegionId>)> = crate::track::chain(starting.as_ref())
            .map(|node| (node.start, node.local))
            .collect();
        let mut head = existing;
        for &(start, local) in prefix.iter().rev() {
            head = Some(Arc::new(RegionStack {
                start,
                local,
                parent: head,
            }));
        }
        head
    }

    /// The default wakeup rule. Returns the new stack for the goroutine
    /// whose `GoStart` is `ev`'s link target.
    pub fn default_apply_on_wake(
        data: &Data,
        regions: &[Region],
        ev: EventId,
        existing: Option<Arc<RegionStack>>,
        inbound: Option<Arc<RegionStack>>,
    ) -> Option<Arc<RegionStack>> {
        let Some(inbound) = inbound else {
            return existing;
        };
        let Some(target) = data.event(ev).link else {
            return existing;
        };
        let target_g = data.event(target).g;

        let propose_head = Arc::new(RegionStack {
            start: target,
            local: None,
            parent: Some(inbound),
        });

        let mut propose: &Arc<RegionStack> = &propose_head;
        let mut cursor = Some(&propose_head);
        while let Some(node) = cursor {
            // A goroutine doing "shared" work may only apply its regions to
            // goroutines that have no other explanation for their work.
            if existing.is_some() {
                if let Some(local) = node.local {
                    if regions[local].shared() {
                        return existing;
                    }
                }
            }

            // Trim the proposal back to the target's own most recent
            // presence in the chain.
            if data.event(node.start).g == target_g {
                propose = node;
            }
            if let Some(local) = node.local {
                if data.event(regions[local].events[0]).g == target_g {
                    propose = node;
                }
            }

            cursor = node.parent.as_ref();
        }

        match &existing {
            Some(head) if head.local.is_some() => existing,
            _ => Some(propose.clone()),
        }
    }

    fn do_start_region(
        &self,
        data: &Data,
        regions: &[Region],
        ev: EventId,
        existing: Option<Arc<RegionStack>>,
        starting: Option<Arc<RegionStack>>,
    ) -> Option<Arc<RegionStack>> {
        match &self.start_region {
            Some(hook) => hook(data, regions, ev, existing, starting),
            None => Self::default_start_region(data, regions, ev, existing, starting),
        }
    }

    fn do_apply_on_wake(
        &self,
        data: &Data,
        regions: &[Region],
        ev: EventId,
        existing: Option<Arc<RegionStack>>,
        inbound: Option<Arc<RegionStack>>,
    ) -> Option<Arc<RegionStack>> {
        match &self.apply_on_wake {
            Some(hook) => hook(data, regions, ev, existing, inbound),
            None => Self::default_apply_on_wake(data, regions, ev, existing, inbound),
        }
    }

    /// Single chronological pass over all events, producing each event's
    /// region stack.
    pub fn process(&self, data: &Data, regions: &[Region]) -> Connections {
        let mut starts: HashMap<EventId, Vec<RegionId>> = HashMap::new();
        let mut ends: HashMap<EventId, Vec<RegionId>> = HashMap::new();
        for (id, region) in regions.iter().enumerate() {
            let first = *region.events.first().expect("regions hold events");
            let last = *region.events.last().expect("regions hold events");
            starts.entry(first).or_default().push(id);
            ends.entry(last).or_default().push(id);
        }

        // Regions share a goroutine and cover contiguous events, so of two
        // regions starting at the same event the smaller one ends first.
        // Sort smaller regions to the front; a round trip outranks anything
        // that starts alongside it.
        for fresh in starts.values_mut() {
            fresh.sort_by_key(|&id| {
                (
                    regions[id].events.len(),
                    regions[id].kind == "client/http_roundtrip",
                )
            });
        }

        let mut stack_now: HashMap<u64, Arc<RegionStack>> = HashMap::new();
        let mut out = Connections {
            event_region_stacks: vec![None; data.len()],
        };

        for id in 0..data.len() {
            let ev_g = data.event(id).g;
            let mut why = stack_now.get(&ev_g).cloned();

            // Newly-created regions.
            if let Some(fresh_list) = starts.get(&id) {
                let mut fresh: Option<Arc<RegionStack>> = None;
                for &region in fresh_list.iter().rev() {
                    fresh = Some(Arc::new(RegionStack {
                        start: id,
                        local: Some(region),
                        parent: fresh,
                    }));
                }
                if fresh.is_some() {
                    why = self.do_start_region(data, regions, id, why, fresh);
                }
            }

            // Apply regions to peers over the wakeup edge.
            if let Some(link) = data.event(id).link {
                let target = data.event(link);
                if target.kind == EventKind::GoStart && ev_g != target.g {
                    let applied = self.do_apply_on_wake(
                        data,
                        regions,
                        id,
                        stack_now.get(&target.g).cloned(),
                        why.clone(),
                    );
                    match applied {
                        Some(stack) => stack_now.insert(target.g, stack),
                        None => stack_now.remove(&target.g),
                    };
                }
            }

            // Remove local regions that ended at this event, keeping any
            // local regions that are still open stacked on top.
            if let Some(stale_list) = ends.get(&id) {
                let stale: HashSet<RegionId> = stale_list.iter().copied().collect();
                let ev_ts = data.event(id).ts;
                let mut active_local: Vec<RegionId> = Vec::new();
                let mut link = why.clone();
                while let Some(node) = link {
                    if let Some(local) = node.local {
                        let last = *regions[local].events.last().expect("regions hold events");
                        if data.event(node.start).g == ev_g && data.event(last).ts > ev_ts {
                            active_local.push(local);
                        }
                        if stale.contains(&local) {
                            why = node.parent.clone();
                            for &local in active_local.iter().rev() {
                                why = Some(Arc::new(RegionStack {
                                    start: regions[local].events[0],
                                    local: Some(local),
                                    parent: why,
                                }));
                            }
                        }
                    }
                    link = node.parent.clone();
                }
            }

            out.event_region_stacks[id] = why.clone();
            match why {
                Some(stack) => stack_now.insert(ev_g, stack),
                None => stack_now.remove(&ev_g),
            };
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::event::EventKind::*;
    use crate::track::chain_kinds;

    #[test]
    fn test_default_start_region_layers_on_existing() {
        // A client call starting inside a server handler keeps the server's
        // explanation beneath its own.
        let events = vec![Event::new(100, GoSysCall, 1)];
        let data = Data::new(events).unwrap();
        let regions = vec![
            Region::new("server/sdk", vec![0]),
            Region::new("server/http", vec![0]),
            Region::new("client/sdk", vec![0]),
            Region::new("client/http_roundtrip", vec![0]),
        ];

        let existing = Some(Arc::new(RegionStack {
            start: 0,
            local: Some(0),
            parent: Some(Arc::new(RegionStack {
                start: 0,
                local: Some(1),
                parent: None,
            })),
        }));
        let starting = Some(Arc::new(RegionStack {
            start: 0,
            local: Some(2),
            parent: Some(Arc::new(RegionStack {
                start: 0,
                local: Some(3),
                parent: None,
            })),
        }));

        let resulting =
            RegionConnector::default_start_region(&data, &regions, 0, existing, starting);

        assert_eq!(
            chain_kinds(resulting.as_ref(), &regions),
            vec!["client/sdk", "client/http_roundtrip", "server/sdk", "server/http"],
        );
    }

    #[test]
    fn test_wake_keeps_existing_local_region() {
        // g1 wakes g2, but g2 already has an active local region: the
        // inbound proposal loses.
        let mut unblock = Event::new(100, GoUnblock, 1);
        unblock.link = Some(1);
        let events = vec![unblock, Event::new(200, GoStart, 2)];
        let data = Data::new(events).unwrap();
        let regions = vec![Region::new("a", vec![0]), Region::new("b", vec![1])];

        let existing = Some(Arc::new(RegionStack {
            start: 1,
            local: Some(1),
            parent: None,
        }));
        let inbound = Some(Arc::new(RegionStack {
            start: 0,
            local: Some(0),
            parent: None,
        }));

        let applied = RegionConnector::default_apply_on_wake(
            &data,
            &regions,
            0,
            existing.clone(),
            inbound,
        );
        assert_eq!(chain_kinds(applied.as_ref(), &regions), vec!["b"]);
    }

    #[test]
    fn test_wake_shared_region_never_overwrites() {
        let mut unblock = Event::new(100, GoUnblock, 1);
        unblock.link = Some(1);
        let events = vec![unblock, Event::new(200, GoStart, 2)];
        let data = Data::new(events).unwrap();
        let mut shared = Region::new("client/http_dns", vec![0]);
        shared.flags = crate::track::REGION_FLAG_SHARED;
        let regions = vec![shared];

        // Existing has no local region, which would normally accept the
        // proposal; the shared flag still blocks it.
        let existing = Some(Arc::new(RegionStack {
            start: 1,
            local: None,
            parent: None,
        }));
        let inbound = Some(Arc::new(RegionStack {
            start: 0,
            local: Some(0),
            parent: None,
        }));

        let applied = RegionConnector::default_apply_on_wake(
            &data,
            &regions,
            0,
            existing.clone(),
            inbound.clone(),
        );
        assert!(Arc::ptr_eq(
            applied.as_ref().unwrap(),
            existing.as_ref().unwrap()
        ));

        // With no existing stack at all, the shared proposal is accepted.
        let applied =
            RegionConnector::default_apply_on_wake(&data, &regions, 0, None, inbound);
        assert_eq!(
            chain_kinds(applied.as_ref(), &regions),
            vec!["client/http_dns"]
        );
    }

    #[test]
    fn test_wake_with_no_inbound_keeps_existing() {
        let mut unblock = Event::new(100, GoUnblock, 1);
        unblock.link = Some(1);
        let events = vec![unblock, Event::new(200, GoStart, 2)];
        let data = Data::new(events).unwrap();
        let regions: Vec<Region> = Vec::new();

        let existing = Some(Arc::new(RegionStack {
            start: 1,
            local: None,
            parent: None,
        }));
        let applied = RegionConnector::default_apply_on_wake(
            &data,
            &regions,
            0,
            existing.clone(),
            None,
        );
        assert!(Arc::ptr_eq(
            applied.as_ref().unwrap(),
            existing.as_ref().unwrap()
        ));
    }
}
