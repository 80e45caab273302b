//! Inbound-HTTP recipes
//!
//! The server side of a connection lives on one `conn.serve` goroutine, so
//! its phases show up as alternating windows on a single timeline: read the
//! request headers, run the handler, finish the response, repeat. The read
//! and write phases match on their stacks; the handler phase is the negative
//! space between a read's last event and the next write's first event.

use crate::data::Data;
use crate::event::{Event, EventId, EventKind};
use crate::matcher;
use crate::track::{GeneralTracker, Region};

fn read_request_tracker() -> GeneralTracker {
    // Header reads show up under conn.readRequest, or as the buffered peek
    // between requests.
    let on_stack = |ev: &Event| {
        matcher::has_stack(
            &ev.stack,
            &[
                r"^net/http\.\(\*conn\)\.serve$",
                r"^net/http\.\(\*conn\)\.readRequest$",
                "**",
            ],
        ) || matcher::has_stack(
            &ev.stack,
            &[
                r"^net/http\.\(\*conn\)\.serve$",
                r"^bufio\.\(\*Reader\)\.Peek$",
                "**",
            ],
        )
    };

    let mut t = GeneralTracker::new();
    t.allow_single = true;
    t.activate = Some(Box::new(on_stack));
    t.keepalive = Some(Box::new(move |ev: &Event| !ev.has_stack() || on_stack(ev)));
    t.critical = Some(Box::new(|ev: &Event| ev.has_stack()));
    t
}

fn write_response_tracker() -> GeneralTracker {
    let on_stack = |ev: &Event| {
        matcher::has_stack(
            &ev.stack,
            &[
                r"^net/http\.\(\*conn\)\.serve$",
                r"^net/http\.\(\*response\)\.finishRequest$",
                "**",
            ],
        )
    };

    let mut t = GeneralTracker::new();
    t.allow_single = true;
    t.activate = Some(Box::new(on_stack));
    t.keepalive = Some(Box::new(move |ev: &Event| !ev.has_stack() || on_stack(ev)));
    // A blocked response write resumes with a bare GoStart; keep it.
    t.critical = Some(Box::new(|ev: &Event| {
        ev.has_stack() || ev.kind == EventKind::GoStart
    }));
    t
}

/// Finds `server/http_read`, `server/http_write`, and `server/http` regions
/// on one goroutine's events.
pub fn track_http_server(data: &Data, events: &[EventId]) -> Vec<Region> {
    let mut reads = Vec::new();
    {
        let mut tracker = read_request_tracker();
        tracker.process(data, events, &mut |evs| {
            reads.push(Region::new("server/http_read", evs.to_vec()));
        });
    }

    let mut writes = Vec::new();
    {
        let mut tracker = write_response_tracker();
        tracker.process(data, events, &mut |evs| {
            writes.push(Region::new("server/http_write", evs.to_vec()));
        });
    }

    let serves: Vec<Region> = negative_space(data, events, &reads, &writes)
        .into_iter()
        .map(|evs| Region::new("server/http", evs))
        .collect();

    let mut regions = reads;
    regions.extend(writes);
    regions.extend(serves);
    regions
}

/// Builds event windows from the negative (empty) space between two region
/// lists. The inputs must be start-sorted and internally non-overlapping,
/// though they may share single events at their boundaries.
///
/// Each returned window begins at the last event of a `starts` region and
/// ends at the first event of an `ends` region; none of its other events
/// appear in any input region. A candidate that overlaps an `ends` region's
/// interior is discarded and the scan resets.
fn negative_space(
    data: &Data,
    events: &[EventId],
    starts: &[Region],
    ends: &[Region],
) -> Vec<Vec<EventId>> {
    let mut starts: &[Region] = starts;
    let mut ends: &[Region] = ends;
    let mut out: Vec<Vec<EventId>> = Vec::new();
    let mut open = false;
    let mut queue: Vec<EventId> = Vec::new();

    for &id in events {
        queue.push(id);

        for (i, region) in starts.iter().enumerate() {
            let last = *region.events.last().expect("regions hold events");
            if last == id {
                // This region is the most recent one before the current
                // event: its last event opens a candidate window.
                starts = &starts[i + 1..];
                open = true;
                queue = vec![id];
                break;
            }
            if data.event(last).ts > data.event(id).ts {
                break;
            }
        }

        while let Some(end_region) = ends.first() {
            let first = *end_region.events.first().expect("regions hold events");
            let last = *end_region.events.last().expect("regions hold events");
            let ts = data.event(id).ts;

            if data.event(last).ts < ts {
                // Fully older than the current event; discard it.
                ends = &ends[1..];
                continue;
            }
            if data.event(first).ts < ts {
                // Overlaps the current event; discard it and reset.
                ends = &ends[1..];
                open = false;
                queue.clear();
                continue;
            }
            if first == id {
                if open {
                    out.push(std::mem::take(&mut queue));
                    open = false;
                }
                queue.clear();
            }
            break;
        }
    }

    out
}
