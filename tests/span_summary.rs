//! End-to-end span extraction and summarization over the client fixture:
//! one causal tree rooted at the round trip, spanning the dial fan-out, with
//! flat attribution that exactly tiles the root's window.

mod utils;

use std::collections::HashMap;

use tejedor::cluster::{extract_spans, summarize, Span};
use tejedor::patterns;
use utils::load;

const CLIENT: &str = include_str!("fixtures/http_client.txt");

fn shape(span: &Span) -> (u64, &str, i64, i64) {
    (span.g, span.kind.as_str(), span.start_ns, span.length_ns)
}

#[test]
fn test_client_span_tree_shape() {
    let data = load(CLIENT);
    let spans = extract_spans(&data, patterns::track_all);

    assert_eq!(spans.len(), 1);
    let root = &spans[0];
    assert_eq!(shape(root), (51, "client/http_roundtrip", 1100, 7900));

    // The round trip caused the dial goroutine (one wake edge, so one
    // nameless propagation span wrapping the dial region).
    assert_eq!(root.caused.len(), 1);
    let dial_g = &root.caused[0];
    assert_eq!(
        shape(dial_g),
        (52, "net/http.(*Transport).dialConnFor", 1500, 1900)
    );
    // The dial goroutine was scheduled 400ns after the round trip created it.
    assert_eq!(dial_g.start_wait["cpu"], vec![-400]);

    assert_eq!(dial_g.caused.len(), 1);
    let dial = &dial_g.caused[0];
    assert_eq!(shape(dial), (52, "client/http_dial", 1600, 1800));

    // The dial caused the DNS lookup and the connection's reader and writer.
    assert_eq!(dial.caused.len(), 3);
    let dns_g = &dial.caused[0];
    assert_eq!(
        shape(dns_g),
        (53, "internal/singleflight.(*Group).doCall", 2000, 950)
    );
    assert_eq!(dns_g.caused.len(), 1);
    assert_eq!(shape(&dns_g.caused[0]), (53, "client/http_dns", 2100, 850));

    let read_g = &dial.caused[1];
    assert_eq!(
        shape(read_g),
        (54, "net/http.(*persistConn).readLoop", 3500, 5800)
    );
    assert_eq!(read_g.caused.len(), 1);
    assert_eq!(shape(&read_g.caused[0]), (54, "client/http_read", 3700, 5200));

    let write_g = &dial.caused[2];
    assert_eq!(
        shape(write_g),
        (55, "net/http.(*persistConn).writeLoop", 3600, 5900)
    );
    assert_eq!(write_g.caused.len(), 1);
    assert_eq!(
        shape(&write_g.caused[0]),
        (55, "client/http_write", 3800, 5600)
    );
}

#[test]
fn test_client_summary_tiles_the_window() {
    let data = load(CLIENT);
    let spans = extract_spans(&data, patterns::track_all);
    let summary = summarize(&spans[0]);

    assert_eq!(summary.length_ns, 7900);

    // Each goroutine's own on-CPU time, summed.
    assert_eq!(summary.total_run_ns, 2150);
    // The flattened timeline overlaps g54's and g55's startup.
    assert_eq!(summary.flat_run_ns, 2050);

    assert!(summary.total_assist_ns.is_empty());
    assert!(summary.flat_assist_ns.is_empty());

    let mut want = HashMap::new();
    want.insert("cpu".to_string(), 700i64);
    want.insert("net".to_string(), 5100);
    want.insert("select".to_string(), 50);
    assert_eq!(summary.flat_wait_ns, want);

    // Flat run plus flat waits exactly account for the window.
    let wait_total: i64 = summary.flat_wait_ns.values().sum();
    assert_eq!(summary.flat_run_ns + wait_total, summary.length_ns);

    // The flat span mirrors the summary's window.
    assert_eq!(summary.flat.start_ns, 1100);
    assert_eq!(summary.flat.length_ns, 7900);
    assert!(!summary.flat.start_run.is_empty());
}
