//! Event graph construction
//!
//! [`Data`] is the indexed form of a raw event stream: events in chronological
//! order, per-goroutine timelines, intra-goroutine prev/next edges, and the
//! back-reference side of the wakeup graph. Every downstream pass (trackers,
//! the region connector, span extraction, the state aggregator) reads the
//! stream through this one structure. It is built once per input and never
//! mutated afterwards.
//!
//! Each event may be connected to up to four others: the events immediately
//! before and after it on the same goroutine, a `GoStart` on another
//! goroutine that it unblocked (its `link`), and the event that unblocked its
//! own `GoStart` (its backlink). Only `link` is present in the input; the
//! backlink table is derived here and must be unique per target.

use std::collections::HashMap;

use crate::event::{Event, EventId, EventKind};

/// Malformed input stream.
#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    /// Two events claim to have unblocked the same target event.
    #[error("double link on target {target_ts} g={target_g}: from {first_ts} g={first_g} and {second_ts} g={second_g}")]
    DuplicateBacklink {
        target_ts: i64,
        target_g: u64,
        first_ts: i64,
        first_g: u64,
        second_ts: i64,
        second_g: u64,
    },
    /// An event's `link` index points outside the stream.
    #[error("event {ts} g={g} links to out-of-range index {link}")]
    DanglingLink { ts: i64, g: u64, link: usize },
}

/// The event graph: all of the input events, sorted and indexed.
#[derive(Debug)]
pub struct Data {
    events: Vec<Event>,
    goroutines: Vec<u64>,
    by_goroutine: HashMap<u64, Vec<EventId>>,
    prev: Vec<Option<EventId>>,
    next: Vec<Option<EventId>>,
    backlinks: Vec<Option<EventId>>,
    runs: HashMap<EventId, Vec<EventId>>,
}

impl Data {
    /// Sorts `events` by `(ts, g)` (stable) and builds every index table.
    /// `link` fields are remapped through the sort, so they keep pointing at
    /// the same records.
    pub fn new(events: Vec<Event>) -> Result<Self, TraceError> {
        for ev in &events {
            if let Some(link) = ev.link {
                if link >= events.len() {
                    return Err(TraceError::DanglingLink {
                        ts: ev.ts,
                        g: ev.g,
                        link,
                    });
                }
            }
        }

        let mut order: Vec<usize> = (0..events.len()).collect();
        order.sort_by_key(|&i| (events[i].ts, events[i].g));
        let mut new_pos = vec![0usize; events.len()];
        for (pos, &old) in order.iter().enumerate() {
            new_pos[old] = pos;
        }

        let mut sorted: Vec<Event> = Vec::with_capacity(events.len());
        let mut by_old_pos: Vec<Option<Event>> = events.into_iter().map(Some).collect();
        for &old in &order {
            let mut ev = by_old_pos[old].take().expect("each event moved once");
            ev.link = ev.link.map(|l| new_pos[l]);
            sorted.push(ev);
        }
        let events = sorted;

        let mut by_goroutine: HashMap<u64, Vec<EventId>> = HashMap::new();
        for (id, ev) in events.iter().enumerate() {
            by_goroutine.entry(ev.g).or_default().push(id);
        }
        let mut goroutines: Vec<u64> = by_goroutine.keys().copied().collect();
        goroutines.sort_unstable();

        let mut prev = vec![None; events.len()];
        let mut next = vec![None; events.len()];
        for ids in by_goroutine.values() {
            for pair in ids.windows(2) {
                prev[pair[1]] = Some(pair[0]);
                next[pair[0]] = Some(pair[1]);
            }
        }

        let mut backlinks = vec![None; events.len()];
        for (id, ev) in events.iter().enumerate() {
            if let Some(link) = ev.link {
                if let Some(first) = backlinks[link] {
                    let first_ev: &Event = &events[first];
                    let target: &Event = &events[link];
                    return Err(TraceError::DuplicateBacklink {
                        target_ts: target.ts,
                        target_g: target.g,
                        first_ts: first_ev.ts,
                        first_g: first_ev.g,
                        second_ts: ev.ts,
                        second_g: ev.g,
                    });
                }
                backlinks[link] = Some(id);
            }
        }

        let mut runs: HashMap<EventId, Vec<EventId>> = HashMap::new();
        for &g in &goroutines {
            let mut start: Option<EventId> = None;
            for &id in &by_goroutine[&g] {
                if events[id].kind == EventKind::GoStart {
                    start = Some(id);
                }
                if let Some(start) = start {
                    runs.entry(start).or_default().push(id);
                }
            }
        }

        Ok(Data {
            events,
            goroutines,
            by_goroutine,
            prev,
            next,
            backlinks,
            runs,
        })
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn event(&self, id: EventId) -> &Event {
        &self.events[id]
    }

    /// All events in chronological order.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    /// All observed goroutine ids, ascending.
    pub fn goroutines(&self) -> &[u64] {
        &self.goroutines
    }

    /// The goroutine's events in chronological order; empty for an unknown
    /// goroutine.
    pub fn goroutine_events(&self, g: u64) -> &[EventId] {
        self.by_goroutine.get(&g).map(Vec::as_slice).unwrap_or(&[])
    }

    /// The preceding event on the same goroutine.
    pub fn prev(&self, id: EventId) -> Option<EventId> {
        self.prev[id]
    }

    /// The subsequent event on the same goroutine.
    pub fn next(&self, id: EventId) -> Option<EventId> {
        self.next[id]
    }

    /// The unique event whose `link` targets `id`, if any.
    pub fn backlink(&self, id: EventId) -> Option<EventId> {
        self.backlinks[id]
    }

    /// For a `GoStart` event, the events on that goroutine from the start
    /// until the goroutine next started (exclusive of nothing: the slice runs
    /// to the next `GoStart` or the end of the timeline).
    pub fn run(&self, start: EventId) -> &[EventId] {
        self.runs.get(&start).map(Vec::as_slice).unwrap_or(&[])
    }
}
