// Shared helpers for the integration suites.
#![allow(dead_code)]

use tejedor::data::Data;
use tejedor::event::EventId;
use tejedor::exectext;
use tejedor::track::Region;

/// Parses and indexes a text fixture.
pub fn load(text: &str) -> Data {
    let events = exectext::parse_events(text).expect("fixture parses");
    Data::new(events).expect("fixture is well-formed")
}

/// Finds the event with the given timestamp and goroutine.
pub fn event_at(data: &Data, ts: i64, g: u64) -> EventId {
    (0..data.len())
        .find(|&id| data.event(id).ts == ts && data.event(id).g == g)
        .unwrap_or_else(|| panic!("no event at ts {ts} on g{g}"))
}

/// Asserts that the regions of `kind` are exactly the given
/// (goroutine, start, end) triples, in order.
pub fn check_regions(data: &Data, regions: &[Region], kind: &str, want: &[(u64, i64, i64)]) {
    let found: Vec<(u64, i64, i64)> = regions
        .iter()
        .filter(|region| region.kind == kind)
        .map(|region| {
            let first = *region.events.first().expect("regions hold events");
            let last = *region.events.last().expect("regions hold events");
            (
                data.event(first).g,
                data.event(first).ts,
                data.event(last).ts,
            )
        })
        .collect();
    assert_eq!(found, want, "regions of kind {kind:?}");
}
