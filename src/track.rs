//! Regions and the general region tracker
//!
//! A [`Region`] is a contiguous series of events on a single goroutine that
//! accomplish a particular goal, such as "this goroutine was performing an HTTP
//! round trip here". Recipes in [`crate::patterns`] configure a
//! [`GeneralTracker`] with predicates over single events; the tracker scans
//! one goroutine's timeline and emits the matching windows.
//!
//! A [`RegionStack`] is an immutable linked list of regions and inbound
//! communication points that explains why the program is doing a unit of
//! work: "this write happened because goroutine 55 was writing a request,
//! because goroutine 51 was in a round trip". Nodes are reference-counted
//! and share parents structurally; once published a node is never mutated.

use std::sync::Arc;

use tracing::trace;

use crate::data::Data;
use crate::event::{Event, EventId};

/// `flags` bit: the region's results may be shared with unrelated
/// goroutines, so it must not overwrite their established causality.
pub const REGION_FLAG_SHARED: u64 = 0x1;

/// A contiguous series of events on a single goroutine matching a named
/// behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub kind: String,
    pub flags: u64,
    pub events: Vec<EventId>,
}

/// Index of a region within the analysis' region list.
pub type RegionId = usize;

impl Region {
    pub fn new(kind: impl Into<String>, events: Vec<EventId>) -> Self {
        Region {
            kind: kind.into(),
            flags: 0,
            events,
        }
    }

    /// Whether the region represents work that will be shared with unrelated
    /// goroutines.
    pub fn shared(&self) -> bool {
        self.flags & REGION_FLAG_SHARED == REGION_FLAG_SHARED
    }
}

/// One link in an immutable explanation chain.
///
/// `start` marks when the goroutine acquired this explanation for its work.
/// `local` names a region on the goroutine itself; a link with no `local`
/// records only that causality arrived over a wakeup edge at `start`.
#[derive(Debug)]
pub struct RegionStack {
    pub start: EventId,
    pub local: Option<RegionId>,
    pub parent: Option<Arc<RegionStack>>,
}

/// Iterates a chain from the innermost link outwards.
pub fn chain(head: Option<&Arc<RegionStack>>) -> Chain<'_> {
    Chain { cursor: head }
}

pub struct Chain<'a> {
    cursor: Option<&'a Arc<RegionStack>>,
}

impl<'a> Iterator for Chain<'a> {
    type Item = &'a Arc<RegionStack>;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.cursor?;
        self.cursor = node.parent.as_ref();
        Some(node)
    }
}

/// The region kinds in a chain, innermost first. Handy in logs and tests.
pub fn chain_kinds(head: Option<&Arc<RegionStack>>, regions: &[Region]) -> Vec<String> {
    chain(head)
        .filter_map(|node| node.local)
        .map(|id| regions[id].kind.clone())
        .collect()
}

/// Predicate over a single event.
pub type EventPredicate = Box<dyn Fn(&Event) -> bool>;

/// A two-state machine that scans one goroutine's events and emits regions.
///
/// Configuration is by optional predicates:
///
/// - `activate`: does this event start a region?
/// - `keepalive`: may the open region continue through this event? An event
///   that fails keepalive closes the region, and may immediately open a new
///   one if it also activates.
/// - `critical`: is this event a load-bearing part of the region? Events
///   after the last critical one are trimmed from the emitted region. When
///   unset, nothing is trimmed.
/// - `reactivate`: with `critical` configured, an activating event inside an
///   open region closes it and starts a new one, so the tracker finds the
///   smallest regions instead of the largest.
/// - `allow_single`: emit one-event regions; otherwise two events is the
///   minimum.
/// - `flush_at_end`: emit the open region when the events run out instead of
///   discarding it.
pub struct GeneralTracker {
    pub activate: Option<EventPredicate>,
    pub keepalive: Option<EventPredicate>,
    pub critical: Option<EventPredicate>,
    pub reactivate: bool,
    pub allow_single: bool,
    pub flush_at_end: bool,

    active: bool,
    trim_from: usize,
    queue: Vec<EventId>,
}

impl Default for GeneralTracker {
    fn default() -> Self {
        GeneralTracker {
            activate: None,
            keepalive: None,
            critical: None,
            reactivate: false,
            allow_single: false,
            flush_at_end: false,
            active: false,
            trim_from: 0,
            queue: Vec::new(),
        }
    }
}

impl GeneralTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds `events` (one goroutine's timeline, in order) through the state
    /// machine, calling `flush` with each emitted region's events. The
    /// tracker resets itself at the end, so it can be reused for another
    /// goroutine.
    pub fn process(
        &mut self,
        data: &Data,
        events: &[EventId],
        flush: &mut dyn FnMut(&[EventId]),
    ) {
        for &id in events {
            let ev = data.event(id);
            if self.active {
                self.step_active(ev, id, flush);
            } else {
                self.step_idle(ev, id);
            }
        }
        if self.active && self.flush_at_end {
            self.flush_queue(flush);
        }
        self.active = false;
        self.trim_from = 0;
        self.queue.clear();
    }

    fn step_idle(&mut self, ev: &Event, id: EventId) {
        if self.check(&self.activate, ev) {
            trace!(event = %ev, "idle->active");
            self.queue.push(id);
            if self.check(&self.critical, ev) {
                self.trim_from = self.queue.len();
            }
            self.active = true;
        } else {
            trace!(event = %ev, "idle->idle");
        }
    }

    fn step_active(&mut self, ev: &Event, id: EventId, flush: &mut dyn FnMut(&[EventId])) {
        if !self.check(&self.keepalive, ev) {
            trace!(event = %ev, "active->idle");
            self.flush_queue(flush);
            self.active = false;
            self.step_idle(ev, id);
            return;
        }

        if self.reactivate && self.critical.is_some() && self.check(&self.activate, ev) {
            trace!(event = %ev, "reactivate");
            self.flush_queue(flush);
        }

        self.queue.push(id);
        trace!(event = %ev, "active->active");
        if self.check(&self.critical, ev) {
            self.trim_from = self.queue.len();
        }
    }

    fn check(&self, pred: &Option<EventPredicate>, ev: &Event) -> bool {
        pred.as_ref().is_some_and(|f| f(ev))
    }

    fn flush_queue(&mut self, flush: &mut dyn FnMut(&[EventId])) {
        if self.critical.is_none() {
            self.trim_from = self.queue.len();
        }
        self.queue.truncate(self.trim_from);
        if self.queue.len() >= 2 || (self.allow_single && !self.queue.is_empty()) {
            flush(&self.queue);
        }
        self.trim_from = 0;
        self.queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind::{self, *};

    fn data(kinds: &[(i64, EventKind)]) -> Data {
        let events = kinds
            .iter()
            .map(|&(ts, kind)| Event::new(ts, kind, 1))
            .collect();
        Data::new(events).unwrap()
    }

    fn collect(tracker: &mut GeneralTracker, data: &Data) -> Vec<Vec<EventId>> {
        let mut out = Vec::new();
        let ids: Vec<EventId> = (0..data.len()).collect();
        tracker.process(data, &ids, &mut |evs| out.push(evs.to_vec()));
        out
    }

    fn starts_on(kind: EventKind) -> EventPredicate {
        Box::new(move |ev: &Event| ev.kind == kind)
    }

    fn not_kind(kind: EventKind) -> EventPredicate {
        Box::new(move |ev: &Event| ev.kind != kind)
    }

    #[test]
    fn test_basic_region() {
        let data = data(&[
            (1, GoBlock),
            (2, GoStart),
            (3, GoSysCall),
            (4, GoEnd),
        ]);
        let mut t = GeneralTracker::new();
        t.activate = Some(starts_on(GoStart));
        t.keepalive = Some(not_kind(GoEnd));
        assert_eq!(collect(&mut t, &data), vec![vec![1, 2]]);
    }

    #[test]
    fn test_minimum_length_two_unless_allowed() {
        let data = data(&[(1, GoStart), (2, GoEnd)]);
        let mut t = GeneralTracker::new();
        t.activate = Some(starts_on(GoStart));
        t.keepalive = Some(not_kind(GoEnd));
        assert_eq!(collect(&mut t, &data), Vec::<Vec<EventId>>::new());

        let mut t = GeneralTracker::new();
        t.activate = Some(starts_on(GoStart));
        t.keepalive = Some(not_kind(GoEnd));
        t.allow_single = true;
        assert_eq!(collect(&mut t, &data), vec![vec![0]]);
    }

    #[test]
    fn test_critical_trims_tail() {
        let data = data(&[
            (1, GoStart),
            (2, GoSysCall),
            (3, GoSleep),
            (4, GoSleep),
            (5, GoEnd),
        ]);
        let mut t = GeneralTracker::new();
        t.activate = Some(starts_on(GoStart));
        t.keepalive = Some(not_kind(GoEnd));
        t.critical = Some(Box::new(|ev: &Event| ev.kind != GoSleep));
        assert_eq!(collect(&mut t, &data), vec![vec![0, 1]]);
    }

    #[test]
    fn test_keepalive_failure_can_reopen() {
        // The closing event activates, so it becomes the first event of the
        // next region.
        let data = data(&[
            (1, GoStart),
            (2, GoSysCall),
            (3, GoStart),
            (4, GoSysCall),
            (5, GoEnd),
        ]);
        let mut t = GeneralTracker::new();
        t.activate = Some(starts_on(GoStart));
        t.keepalive = Some(Box::new(|ev: &Event| !matches!(ev.kind, GoStart | GoEnd)));
        // The first GoStart activates but every subsequent GoStart fails
        // keepalive, splitting regions at each start.
        assert_eq!(collect(&mut t, &data), vec![vec![0, 1], vec![2, 3]]);
    }

    #[test]
    fn test_reactivate_requires_critical() {
        let data = data(&[
            (1, GoStart),
            (2, GoSysCall),
            (3, GoStart),
            (4, GoSysCall),
            (5, GoEnd),
        ]);
        let mut t = GeneralTracker::new();
        t.activate = Some(starts_on(GoStart));
        t.keepalive = Some(not_kind(GoEnd));
        t.reactivate = true;
        // Without critical, reactivate does not split.
        assert_eq!(collect(&mut t, &data), vec![vec![0, 1, 2, 3]]);

        let mut t = GeneralTracker::new();
        t.activate = Some(starts_on(GoStart));
        t.keepalive = Some(not_kind(GoEnd));
        t.reactivate = true;
        t.critical = Some(Box::new(|_: &Event| true));
        assert_eq!(collect(&mut t, &data), vec![vec![0, 1], vec![2, 3]]);
    }

    #[test]
    fn test_flush_at_end() {
        let data = data(&[(1, GoStart), (2, GoSysCall), (3, GoSysCall)]);
        let mut t = GeneralTracker::new();
        t.activate = Some(starts_on(GoStart));
        t.keepalive = Some(Box::new(|_: &Event| true));
        assert_eq!(collect(&mut t, &data), Vec::<Vec<EventId>>::new());

        let mut t = GeneralTracker::new();
        t.activate = Some(starts_on(GoStart));
        t.keepalive = Some(Box::new(|_: &Event| true));
        t.flush_at_end = true;
        assert_eq!(collect(&mut t, &data), vec![vec![0, 1, 2]]);
    }

    #[test]
    fn test_pending_region_without_critical_event_is_dropped() {
        // Critical is configured but never fires after activation, so the
        // trimmed region is empty.
        let data = data(&[(1, GoStart), (2, GoSleep), (3, GoEnd)]);
        let mut t = GeneralTracker::new();
        t.activate = Some(starts_on(GoStart));
        t.keepalive = Some(not_kind(GoEnd));
        t.critical = Some(Box::new(|ev: &Event| ev.kind == GoSysCall));
        assert_eq!(collect(&mut t, &data), Vec::<Vec<EventId>>::new());
    }

    #[test]
    fn test_shared_flag() {
        let mut region = Region::new("client/http_dns", vec![0]);
        assert!(!region.shared());
        region.flags |= REGION_FLAG_SHARED;
        assert!(region.shared());
    }
}
