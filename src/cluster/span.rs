//! Span and summary records
//!
//! A [`Span`] is one goroutine's contribution to a unit of useful work. Its
//! schedules are start-offset lists relative to `start_ns`: `start_run`
//! holds the moments the goroutine came on-CPU, `start_assist` the moments
//! it started running non-application work (keyed by reason), `start_wait`
//! the moments it started waiting (keyed by reason). A negative `cpu` wait
//! start records scheduling delay that predates the span itself.
//!
//! The field names are normative for the JSON these records serialize to.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::interval::{collapse, Range};

/// A single goroutine's contribution of a unit of useful work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// Id of the goroutine that executed this span.
    pub g: u64,
    /// Name for this type of span: a region kind, or the goroutine's root
    /// function when no region applies.
    pub kind: String,
    /// Start time in nanoseconds.
    pub start_ns: i64,
    /// Duration in nanoseconds.
    pub length_ns: i64,
    /// Moments the goroutine started running, relative to `start_ns`.
    pub start_run: Vec<i64>,
    /// Moments the goroutine started assist work, by reason.
    pub start_assist: HashMap<String, Vec<i64>>,
    /// Moments the goroutine started waiting, by reason. An entry under
    /// `"cpu"` means the goroutine was runnable but not yet running.
    pub start_wait: HashMap<String, Vec<i64>>,
    /// Spans this span caused to exist, by start time.
    pub caused: Vec<Span>,
}

/// Overall behavior of a tree of spans.
///
/// The `total_*` fields sum each goroutine's own time. The `flat_*` fields
/// collapse all the goroutines' timelines into one: a moment counts as run
/// time if any span was on-CPU, as assist time if additionally some span was
/// assisting, and as wait time only when every span was waiting, with the
/// reason chosen by fixed precedence. For assists the order is `gc` then
/// `other`; for waits `cpu` leads (it is withheld CPU time), then `gc`,
/// then the out-of-process reasons `net` and `syscall`, then in-process
/// synchronization: `select`, `recv`, `send`, `cond`, `sync`, `block`,
/// `other`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeSummary {
    pub length_ns: i64,
    pub total_run_ns: i64,
    pub total_assist_ns: HashMap<String, i64>,
    pub flat_run_ns: i64,
    pub flat_assist_ns: HashMap<String, i64>,
    pub flat_wait_ns: HashMap<String, i64>,
    /// A synthetic span whose schedules reflect the flattened timeline,
    /// relative to the root's start.
    pub flat: Span,
    pub root: Span,
}

/// Ranges derived from one span's schedules, relative to its start.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ranges {
    pub running: Vec<Range>,
    pub assisting: HashMap<String, Vec<Range>>,
    pub waiting: HashMap<String, Vec<Range>>,
}

/// A span's schedules violated an accounting invariant. The summarizer
/// skips the offending span and keeps the rest of the tree.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    #[error("blank assist reason")]
    BlankAssistReason,
    #[error("blank wait reason")]
    BlankWaitReason,
    #[error("duplicate assist reasons {first:?} and {second:?} at {at}")]
    DuplicateAssistReason { first: String, second: String, at: i64 },
    #[error("duplicate wait reasons {first:?} and {second:?} at {at}")]
    DuplicateWaitReason { first: String, second: String, at: i64 },
}

/// Converts a span's start-offset schedules into contiguous ranges: each
/// start runs until the next change of state, or the span's end. A leading
/// negative `cpu` wait widens the clip window below zero so pre-span
/// scheduling delay survives.
///
/// # Example
///
/// ```
/// use tejedor::cluster::{running, Span};
/// use std::collections::HashMap;
///
/// let mut start_wait = HashMap::new();
/// start_wait.insert("net".to_string(), vec![35]);
/// start_wait.insert("cpu".to_string(), vec![42]);
/// let span = Span {
///     start_ns: 1000,
///     length_ns: 50,
///     start_run: vec![10, 40, 49],
///     start_wait,
///     ..Span::default()
/// };
/// let ranges = running(&span).unwrap();
/// assert_eq!(ranges.running, vec![[10, 35], [40, 42], [49, 50]]);
/// assert_eq!(ranges.waiting["net"], vec![[35, 40]]);
/// ```
pub fn running(span: &Span) -> Result<Ranges, ClusterError> {
    #[derive(Debug)]
    struct Change<'a> {
        ts: i64,
        wait: Option<&'a str>,
        assist: Option<&'a str>,
    }

    let mut changes: Vec<Change<'_>> = Vec::new();
    for &ts in &span.start_run {
        changes.push(Change {
            ts,
            wait: None,
            assist: None,
        });
    }

    let mut assist_reasons: Vec<&String> = span.start_assist.keys().collect();
    assist_reasons.sort();
    let mut assists: HashMap<i64, &str> = HashMap::new();
    for reason in assist_reasons {
        if reason.is_empty() {
            return Err(ClusterError::BlankAssistReason);
        }
        for &ts in &span.start_assist[reason] {
            if let Some(prev) = assists.insert(ts, reason.as_str()) {
                return Err(ClusterError::DuplicateAssistReason {
                    first: prev.to_string(),
                    second: reason.clone(),
                    at: ts,
                });
            }
            changes.push(Change {
                ts,
                wait: None,
                assist: Some(reason.as_str()),
            });
        }
    }

    let mut wait_reasons: Vec<&String> = span.start_wait.keys().collect();
    wait_reasons.sort();
    let mut waits: HashMap<i64, &str> = HashMap::new();
    for reason in wait_reasons {
        if reason.is_empty() {
            return Err(ClusterError::BlankWaitReason);
        }
        for &ts in &span.start_wait[reason] {
            if let Some(prev) = waits.insert(ts, reason.as_str()) {
                return Err(ClusterError::DuplicateWaitReason {
                    first: prev.to_string(),
                    second: reason.clone(),
                    at: ts,
                });
            }
            changes.push(Change {
                ts,
                wait: Some(reason.as_str()),
                assist: None,
            });
        }
    }

    changes.sort_by_key(|c| c.ts);

    let mut out = Ranges::default();
    for (i, change) in changes.iter().enumerate() {
        let end = match changes.get(i + 1) {
            Some(next) => next.ts,
            None => span.length_ns,
        };
        let v = [change.ts, end];

        if let Some(reason) = change.assist {
            // Assisting time is also running time.
            out.running.push(v);
            out.assisting.entry(reason.to_string()).or_default().push(v);
            continue;
        }
        if let Some(reason) = change.wait {
            out.waiting.entry(reason.to_string()).or_default().push(v);
            continue;
        }
        out.running.push(v);
    }

    let mut window = [0, span.length_ns];
    if let Some(cpu) = span.start_wait.get("cpu") {
        if let Some(&first) = cpu.first() {
            if first < 0 {
                window[0] = first;
            }
        }
    }
    out.running = collapse(&out.running, window);
    for ranges in out.assisting.values_mut() {
        *ranges = collapse(ranges, window);
    }
    for ranges in out.waiting.values_mut() {
        *ranges = collapse(ranges, window);
    }

    Ok(out)
}
