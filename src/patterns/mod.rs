//! Region recipe library
//!
//! Concrete [`GeneralTracker`](crate::track::GeneralTracker) configurations
//! that recognize the well-known goroutine behaviors of the net/http stack,
//! each emitting regions under a fixed kind string:
//!
//! | kind | behavior |
//! |---|---|
//! | `client/http_roundtrip` | an outbound request inside `Transport.RoundTrip` |
//! | `client/http_write` | the writer loop sending a request |
//! | `client/http_read` | the reader loop receiving a response |
//! | `client/http_dial` | `dialConnFor` establishing a connection |
//! | `client/http_dns` | a resolver lookup (shared with other dials) |
//! | `server/http_read` | reading an inbound request's headers |
//! | `server/http_write` | finishing an inbound request's response |
//! | `server/http` | the handler work between a read and the next write |

mod client;
mod server;

pub use client::{
    track_http_dial, track_http_dns, track_http_read, track_http_roundtrip, track_http_write,
};
pub use server::track_http_server;

use crate::data::Data;
use crate::event::EventId;
use crate::track::Region;

/// Runs every recipe over one goroutine's events.
pub fn track_all(data: &Data, events: &[EventId]) -> Vec<Region> {
    let mut regions = Vec::new();
    for track in [
        track_http_write,
        track_http_read,
        track_http_roundtrip,
        track_http_dial,
        track_http_dns,
        track_http_server,
    ] {
        regions.extend(track(data, events));
    }
    regions
}

/// Applies a per-goroutine recipe to every goroutine in the trace.
pub fn find_all(
    data: &Data,
    track: impl Fn(&Data, &[EventId]) -> Vec<Region>,
) -> Vec<Region> {
    let mut regions = Vec::new();
    for &g in data.goroutines() {
        regions.extend(track(data, data.goroutine_events(g)));
    }
    regions
}
