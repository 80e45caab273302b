//! Wall-clock extents and coverage accounting
//!
//! Quick per-goroutine timing views that don't need the full region
//! machinery: the extent of an event list, the stretches where the goroutine
//! was on-CPU or blocked on the network, and how much of a parent range its
//! children leave uncovered.

use crate::data::Data;
use crate::event::{EventId, EventKind};

/// A closed-open nanosecond range with a start and an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSpan {
    pub start: i64,
    pub end: i64,
}

impl TimeSpan {
    pub fn new(start: i64, end: i64) -> Self {
        TimeSpan { start, end }
    }

    pub fn length(&self) -> i64 {
        self.end - self.start
    }
}

/// First-to-last extent of an event list, or `None` when it is empty.
pub fn extent(data: &Data, events: &[EventId]) -> Option<TimeSpan> {
    let first = *events.first()?;
    let last = *events.last()?;
    Some(TimeSpan::new(data.event(first).ts, data.event(last).ts))
}

/// Bounding extent of a set of spans.
pub fn hull(spans: &[TimeSpan]) -> Option<TimeSpan> {
    let mut out = *spans.first()?;
    for other in &spans[1..] {
        if other.start < out.start {
            out.start = other.start;
        }
        if other.end > out.end {
            out.end = other.end;
        }
    }
    Some(out)
}

fn is_blocking(kind: EventKind) -> bool {
    matches!(
        kind,
        EventKind::GoBlock
            | EventKind::GoBlockSend
            | EventKind::GoBlockRecv
            | EventKind::GoBlockSelect
            | EventKind::GoBlockSync
            | EventKind::GoBlockCond
            | EventKind::GoBlockNet
            | EventKind::GoBlockGC
            | EventKind::GoSysBlock
    )
}

/// Ranges where the goroutine was making progress: each one runs from the
/// first event after a block (or the start of the list) to the next blocking
/// event.
pub fn running(data: &Data, events: &[EventId]) -> Vec<TimeSpan> {
    let mut out = Vec::new();
    let mut start: Option<EventId> = None;
    for &id in events {
        if start.is_none() {
            start = Some(id);
        }
        if is_blocking(data.event(id).kind) {
            if let Some(s) = start.take() {
                out.push(TimeSpan::new(data.event(s).ts, data.event(id).ts));
            }
        }
    }
    out
}

/// Ranges where the goroutine was blocked on the network: from each
/// `GoBlockNet` to the goroutine's next event.
pub fn block_net(data: &Data, events: &[EventId]) -> Vec<TimeSpan> {
    let mut out = Vec::new();
    let mut start: Option<EventId> = None;
    for &id in events {
        if let Some(s) = start.take() {
            out.push(TimeSpan::new(data.event(s).ts, data.event(id).ts));
        }
        if data.event(id).kind == EventKind::GoBlockNet {
            start = Some(id);
        }
    }
    out
}

/// How much of `parent` is covered by none of `children`.
///
/// # Example
///
/// ```
/// use tejedor::coverage::{uncovered, TimeSpan};
///
/// let parent = TimeSpan::new(30, 100);
/// let children = [TimeSpan::new(30, 40), TimeSpan::new(50, 80)];
/// assert_eq!(uncovered(parent, &children), 10 + 20);
/// ```
pub fn uncovered(parent: TimeSpan, children: &[TimeSpan]) -> i64 {
    let mut sorted = children.to_vec();
    sorted.sort_by_key(|c| c.start);

    let mut gap = 0;
    let mut now = parent.start;
    for child in sorted {
        if parent.end < now {
            // The progress marker is past the end of the parent; the list is
            // sorted, so nothing further can matter.
            break;
        }
        if parent.end < child.start {
            break;
        }
        if now <= child.start {
            gap += child.start - now;
        }
        if now <= child.end {
            now = child.end;
        }
    }
    if now < parent.end {
        gap += parent.end - now;
    }
    gap
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::event::EventKind::*;

    #[test]
    fn test_uncovered() {
        let case = |want: i64, parent: TimeSpan, children: &[TimeSpan]| {
            assert_eq!(uncovered(parent, children), want, "{parent:?} {children:?}");
        };

        case(100, TimeSpan::new(0, 100), &[]);
        case(70, TimeSpan::new(30, 100), &[]);
        case(
            20,
            TimeSpan::new(30, 100),
            &[
                TimeSpan::new(30, 40),
                TimeSpan::new(50, 80),
                TimeSpan::new(60, 70),
                TimeSpan::new(70, 90),
            ],
        );
    }

    #[test]
    fn test_running_and_block_net() {
        let events = vec![
            Event::new(100, GoStart, 1),
            Event::new(200, GoBlockNet, 1),
            Event::new(500, GoStart, 1),
            Event::new(700, GoBlock, 1),
        ];
        let data = Data::new(events).unwrap();
        let ids = data.goroutine_events(1);

        assert_eq!(
            running(&data, ids),
            vec![TimeSpan::new(100, 200), TimeSpan::new(500, 700)]
        );
        assert_eq!(block_net(&data, ids), vec![TimeSpan::new(200, 500)]);
        assert_eq!(extent(&data, ids), Some(TimeSpan::new(100, 700)));
    }

    #[test]
    fn test_hull() {
        assert_eq!(hull(&[]), None);
        assert_eq!(
            hull(&[TimeSpan::new(5, 10), TimeSpan::new(1, 7), TimeSpan::new(6, 20)]),
            Some(TimeSpan::new(1, 20))
        );
    }
}
