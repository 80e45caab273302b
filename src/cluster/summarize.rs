//! Flat wall-clock attribution over a span tree
//!
//! The window is the root span's own extent. Each goroutine's contributions
//! are merged first, so work that shows up in multiple spans is counted
//! once. A goroutine that is assisting is also running; the flat view first
//! removes the time when any goroutine was running its own code, then lets
//! each assist reason, then each wait reason, consume what remains in
//! precedence order. The precedence is load-bearing: it decides how
//! overlapping concurrent blocks are attributed, and must not be reordered.

use std::collections::HashMap;

use tracing::warn;

use crate::interval::{collapse, magnitude, not, subtract, Range};

use super::span::{running, Span, TreeSummary};
use super::visit;

const ASSIST_PRECEDENCE: [&str; 2] = ["gc", "other"];
const WAIT_PRECEDENCE: [&str; 11] = [
    "cpu", "gc", "net", "syscall", "select", "recv", "send", "cond", "sync", "block", "other",
];

fn sorted_keys<V>(map: &HashMap<String, V>) -> Vec<String> {
    let mut keys: Vec<String> = map.keys().cloned().collect();
    keys.sort();
    keys
}

/// Summarizes a span tree over the window of its root. Spans whose
/// schedules fail to derive (blank or duplicated reasons) are skipped; the
/// rest of the tree still contributes.
pub fn summarize(root: &Span) -> TreeSummary {
    let window: Range = [root.start_ns, root.start_ns + root.length_ns];

    // Per-goroutine absolute ranges, merged across all the spans each
    // goroutine appears in.
    let mut g_runs: HashMap<u64, Vec<Range>> = HashMap::new();
    let mut g_assists: HashMap<u64, HashMap<String, Vec<Range>>> = HashMap::new();
    let mut g_waits: HashMap<u64, HashMap<String, Vec<Range>>> = HashMap::new();

    visit(root, &mut |span| {
        let ranges = match running(span) {
            Ok(ranges) => ranges,
            Err(err) => {
                warn!(g = span.g, kind = %span.kind, %err, "skipping span with invalid schedules");
                return;
            }
        };

        let shift = |ranges: &[Range]| -> Vec<Range> {
            ranges
                .iter()
                .map(|v| [v[0] + span.start_ns, v[1] + span.start_ns])
                .collect()
        };

        g_runs
            .entry(span.g)
            .or_default()
            .extend(shift(&ranges.running));
        let assists = g_assists.entry(span.g).or_default();
        for (reason, ranges) in &ranges.assisting {
            assists
                .entry(reason.clone())
                .or_default()
                .extend(shift(ranges));
        }
        let waits = g_waits.entry(span.g).or_default();
        for (reason, ranges) in &ranges.waiting {
            waits
                .entry(reason.clone())
                .or_default()
                .extend(shift(ranges));
        }
    });

    let mut summary = TreeSummary {
        length_ns: root.length_ns,
        total_run_ns: 0,
        total_assist_ns: HashMap::new(),
        flat_run_ns: 0,
        flat_assist_ns: HashMap::new(),
        flat_wait_ns: HashMap::new(),
        flat: Span {
            g: root.g,
            kind: root.kind.clone(),
            start_ns: root.start_ns,
            length_ns: root.length_ns,
            ..Span::default()
        },
        root: root.clone(),
    };

    // Collapse each goroutine's running time into the window, and separate
    // the portion spent running its own (non-assist) code.
    let mut goroutines: Vec<u64> = g_runs.keys().copied().collect();
    goroutines.sort_unstable();

    let mut all_runs: Vec<Range> = Vec::new();
    let mut non_assist_runs: Vec<Range> = Vec::new();
    for &g in &goroutines {
        let ranges = collapse(&g_runs[&g], window);
        summary.total_run_ns += magnitude(&ranges);
        all_runs.extend_from_slice(&ranges);

        let mut non_assist = ranges;
        if let Some(assists) = g_assists.get(&g) {
            for reason in sorted_keys(assists) {
                non_assist = subtract(&non_assist, &assists[&reason]);
            }
        }
        non_assist_runs.extend(non_assist);
    }
    let all_runs = collapse(&all_runs, window);
    let non_assist_runs = collapse(&non_assist_runs, window);

    // Merge assist and wait ranges across goroutines, folding reasons
    // outside the precedence lists into "other".
    let mut all_assists: HashMap<String, Vec<Range>> = HashMap::new();
    for &g in &goroutines {
        let assists = &g_assists[&g];
        for reason in sorted_keys(assists) {
            let ranges = collapse(&assists[&reason], window);
            let bucket = if ASSIST_PRECEDENCE.contains(&reason.as_str()) {
                reason
            } else {
                "other".to_string()
            };
            *summary.total_assist_ns.entry(bucket.clone()).or_default() += magnitude(&ranges);
            all_assists.entry(bucket).or_default().extend(ranges);
        }
    }
    for ranges in all_assists.values_mut() {
        *ranges = collapse(ranges, window);
    }

    let mut all_waits: HashMap<String, Vec<Range>> = HashMap::new();
    for &g in &goroutines {
        let waits = &g_waits[&g];
        for reason in sorted_keys(waits) {
            let ranges = collapse(&waits[&reason], window);
            let bucket = if WAIT_PRECEDENCE.contains(&reason.as_str()) {
                reason
            } else {
                "other".to_string()
            };
            all_waits.entry(bucket).or_default().extend(ranges);
        }
    }
    for ranges in all_waits.values_mut() {
        *ranges = collapse(ranges, window);
    }

    summary.flat_run_ns = magnitude(&all_runs);
    for v in &all_runs {
        summary.flat.start_run.push(v[0] - root.start_ns);
    }

    // Whatever no goroutine's own code covers is up for grabs: assist
    // reasons consume it first, then wait reasons, each in precedence order.
    let mut remainder = subtract(&[window], &non_assist_runs);
    let mut unaccounted = magnitude(&remainder);

    for reason in ASSIST_PRECEDENCE {
        let ranges = all_assists.remove(reason).unwrap_or_default();

        for v in subtract(&ranges, &not(&remainder, window)) {
            summary
                .flat
                .start_assist
                .entry(reason.to_string())
                .or_default()
                .push(v[0] - root.start_ns);
        }

        remainder = subtract(&remainder, &ranges);
        let after = magnitude(&remainder);
        summary
            .flat_assist_ns
            .insert(reason.to_string(), unaccounted - after);
        unaccounted = after;
    }

    for reason in WAIT_PRECEDENCE {
        let ranges = all_waits.remove(reason).unwrap_or_default();

        for v in subtract(&ranges, &not(&remainder, window)) {
            summary
                .flat
                .start_wait
                .entry(reason.to_string())
                .or_default()
                .push(v[0] - root.start_ns);
        }

        remainder = subtract(&remainder, &ranges);
        let after = magnitude(&remainder);
        summary
            .flat_wait_ns
            .insert(reason.to_string(), unaccounted - after);
        unaccounted = after;
    }

    summary.total_assist_ns.retain(|_, v| *v != 0);
    summary.flat_assist_ns.retain(|_, v| *v != 0);
    summary.flat_wait_ns.retain(|_, v| *v != 0);

    summary
}
