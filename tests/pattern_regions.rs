//! Recipe coverage over the HTTP fixtures: each tracker finds exactly the
//! regions its behavior describes, with the expected bounds.

mod utils;

use tejedor::patterns;
use utils::{check_regions, load};

const CLIENT: &str = include_str!("fixtures/http_client.txt");
const SERVER: &str = include_str!("fixtures/http_server.txt");

#[test]
fn test_client_roundtrip_regions() {
    let data = load(CLIENT);
    let regions = patterns::find_all(&data, patterns::track_http_roundtrip);
    check_regions(&data, &regions, "client/http_roundtrip", &[(51, 1100, 9000)]);
}

#[test]
fn test_client_write_regions() {
    let data = load(CLIENT);
    let regions = patterns::find_all(&data, patterns::track_http_write);
    check_regions(&data, &regions, "client/http_write", &[(55, 3800, 9400)]);
}

#[test]
fn test_client_read_regions() {
    let data = load(CLIENT);
    let regions = patterns::find_all(&data, patterns::track_http_read);
    check_regions(&data, &regions, "client/http_read", &[(54, 3700, 8900)]);
}

#[test]
fn test_client_dial_regions() {
    let data = load(CLIENT);
    let regions = patterns::find_all(&data, patterns::track_http_dial);
    check_regions(&data, &regions, "client/http_dial", &[(52, 1600, 3400)]);
}

#[test]
fn test_client_dns_regions_are_shared() {
    let data = load(CLIENT);
    let regions = patterns::find_all(&data, patterns::track_http_dns);
    check_regions(&data, &regions, "client/http_dns", &[(53, 2100, 2950)]);
    assert!(regions.iter().all(|region| region.shared()));
}

#[test]
fn test_track_all_finds_every_client_region() {
    let data = load(CLIENT);
    let regions = patterns::find_all(&data, patterns::track_all);
    assert_eq!(regions.len(), 5);
    for kind in [
        "client/http_roundtrip",
        "client/http_write",
        "client/http_read",
        "client/http_dial",
        "client/http_dns",
    ] {
        assert_eq!(
            regions.iter().filter(|r| r.kind == kind).count(),
            1,
            "kind {kind:?}"
        );
    }
}

#[test]
fn test_server_regions_interleave() {
    let data = load(SERVER);
    let regions = patterns::find_all(&data, patterns::track_http_server);

    check_regions(
        &data,
        &regions,
        "server/http_read",
        &[(70, 200, 1100), (70, 3900, 3900)],
    );
    check_regions(
        &data,
        &regions,
        "server/http_write",
        &[(70, 3100, 3800), (70, 5900, 5900)],
    );
    // The handler phases are the negative space from each read's last event
    // to the next write's first event. The final (partial) read at 6100 is
    // discarded.
    check_regions(
        &data,
        &regions,
        "server/http",
        &[(70, 1100, 3100), (70, 3900, 5900)],
    );
}

#[test]
fn test_client_patterns_ignore_server_trace() {
    let data = load(SERVER);
    let regions = patterns::find_all(&data, |data, events| {
        let mut out = patterns::track_http_roundtrip(data, events);
        out.extend(patterns::track_http_dial(data, events));
        out.extend(patterns::track_http_dns(data, events));
        out
    });
    assert!(regions.is_empty());
}
