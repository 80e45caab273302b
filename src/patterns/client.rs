//! Outbound-HTTP recipes
//!
//! Five trackers that recognize the goroutines a `Transport.RoundTrip` call
//! fans out to: the round trip itself, the writer and reader loops of the
//! persistent connection, the dial, and the DNS lookup. The DNS region is
//! flagged shared, since the resolver's singleflight result may satisfy
//! other concurrent dials.

use crate::data::Data;
use crate::event::{Event, EventId, EventKind};
use crate::matcher;
use crate::track::{GeneralTracker, Region, REGION_FLAG_SHARED};

fn roundtrip_tracker() -> GeneralTracker {
    // A round trip spans every event whose stack passes through
    // Transport.RoundTrip. Stackless events (scheduling churn) keep the
    // region alive, and starts count as load-bearing so a trailing wakeup is
    // kept while other stackless noise is trimmed.
    let on_stack =
        |ev: &Event| matcher::has_stack(&ev.stack, &["**", r"^net/http\.\(\*Transport\)\.RoundTrip$", "**"]);

    let mut t = GeneralTracker::new();
    t.activate = Some(Box::new(on_stack));
    t.keepalive = Some(Box::new(move |ev: &Event| !ev.has_stack() || on_stack(ev)));
    t.critical = Some(Box::new(move |ev: &Event| {
        ev.kind == EventKind::GoStart || on_stack(ev)
    }));
    t
}

/// Finds `client/http_roundtrip` regions on one goroutine's events.
pub fn track_http_roundtrip(data: &Data, events: &[EventId]) -> Vec<Region> {
    let mut regions = Vec::new();
    let mut tracker = roundtrip_tracker();
    tracker.process(data, events, &mut |evs| {
        regions.push(Region::new("client/http_roundtrip", evs.to_vec()));
    });
    regions
}

fn writer_tracker() -> GeneralTracker {
    // The writer loop can have arbitrary interactions while obtaining the
    // request body; as long as Request.write is on the stack the region
    // continues. GoEnd terminates it even without a stack.
    let on_stack = |ev: &Event| {
        matcher::has_stack(
            &ev.stack,
            &[
                r"^net/http\.\(\*persistConn\)\.writeLoop$",
                r"^net/http\.\(\*Request\)\.write$",
                "**",
            ],
        ) || matcher::has_stack(
            &ev.stack,
            &[
                r"^net/http\.\(\*persistConn\)\.writeLoop$",
                "**",
                r"^net/http\.persistConnWriter\.Write$",
                "**",
            ],
        )
    };

    let mut t = GeneralTracker::new();
    t.allow_single = true;
    t.activate = Some(Box::new(on_stack));
    t.keepalive = Some(Box::new(move |ev: &Event| {
        if ev.kind == EventKind::GoEnd {
            return false;
        }
        !ev.has_stack() || on_stack(ev)
    }));
    t
}

/// Finds `client/http_write` regions on one goroutine's events.
pub fn track_http_write(data: &Data, events: &[EventId]) -> Vec<Region> {
    let mut regions = Vec::new();
    let mut tracker = writer_tracker();
    tracker.process(data, events, &mut |evs| {
        regions.push(Region::new("client/http_write", evs.to_vec()));
    });
    regions
}

fn reader_tracker() -> GeneralTracker {
    let on_stack = |ev: &Event| {
        matcher::has_stack(
            &ev.stack,
            &[
                r"^net/http\.\(\*persistConn\)\.readLoop$",
                "**",
                r"^net/http\.\(\*persistConn\)\.Read$",
                "**",
            ],
        )
    };

    let mut t = GeneralTracker::new();
    t.allow_single = true;
    t.activate = Some(Box::new(on_stack));
    t.keepalive = Some(Box::new(move |ev: &Event| !ev.has_stack() || on_stack(ev)));
    t
}

/// Finds `client/http_read` regions on one goroutine's events.
pub fn track_http_read(data: &Data, events: &[EventId]) -> Vec<Region> {
    let mut regions = Vec::new();
    let mut tracker = reader_tracker();
    tracker.process(data, events, &mut |evs| {
        regions.push(Region::new("client/http_read", evs.to_vec()));
    });
    regions
}

fn dialer_tracker() -> GeneralTracker {
    // dialConnFor runs the dial goroutine from creation to handoff; the
    // goroutine often ends without another stack, so flush at end of stream.
    let on_stack = |ev: &Event| {
        matcher::has_stack(&ev.stack, &[r"^net/http\.\(\*Transport\)\.dialConnFor$", "**"])
    };

    let mut t = GeneralTracker::new();
    t.flush_at_end = true;
    t.activate = Some(Box::new(on_stack));
    t.keepalive = Some(Box::new(move |ev: &Event| !ev.has_stack() || on_stack(ev)));
    t
}

/// Finds `client/http_dial` regions on one goroutine's events.
pub fn track_http_dial(data: &Data, events: &[EventId]) -> Vec<Region> {
    let mut regions = Vec::new();
    let mut tracker = dialer_tracker();
    tracker.process(data, events, &mut |evs| {
        regions.push(Region::new("client/http_dial", evs.to_vec()));
    });
    regions
}

fn dns_tracker() -> GeneralTracker {
    let on_stack = |ev: &Event| {
        matcher::has_stack(
            &ev.stack,
            &[".*", r"^net\.\(\*Resolver\)\.lookupIPAddr\.func1$", "**"],
        )
    };

    let mut t = GeneralTracker::new();
    t.flush_at_end = true;
    t.activate = Some(Box::new(on_stack));
    t.keepalive = Some(Box::new(|_: &Event| true));
    t
}

/// Finds `client/http_dns` regions on one goroutine's events. The regions
/// are flagged shared: a lookup's result may be reused by dials the lookup
/// did not belong to.
pub fn track_http_dns(data: &Data, events: &[EventId]) -> Vec<Region> {
    let mut regions = Vec::new();
    let mut tracker = dns_tracker();
    tracker.process(data, events, &mut |evs| {
        regions.push(Region {
            kind: "client/http_dns".to_string(),
            flags: REGION_FLAG_SHARED,
            events: evs.to_vec(),
        });
    });
    regions
}
