//! Span extraction from per-event region stacks
//!
//! Runs the region connector, then groups the distinct [`RegionStack`]
//! chains into trees: a chain whose outermost link has no parent is a root,
//! and every other chain attaches beneath its nearest ancestor with a
//! distinct start (links sharing the exact start moment are the same tree
//! position, not a parent/child pair). Each tree node becomes a [`Span`]
//! covering the node's events on its own goroutine, with run, assist, and
//! wait starts classified by event kind.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::connect::{Connections, RegionConnector};
use crate::data::Data;
use crate::event::{EventId, EventKind};
use crate::track::{chain, Region, RegionStack};

use super::Span;

fn ptr(stack: &Arc<RegionStack>) -> usize {
    Arc::as_ptr(stack) as usize
}

fn is_run_start(kind: EventKind) -> bool {
    matches!(kind, EventKind::GoStart | EventKind::GCMarkAssistDone)
}

fn assist_reason(kind: EventKind) -> Option<&'static str> {
    match kind {
        EventKind::GCMarkAssistStart => Some("gc"),
        _ => None,
    }
}

fn wait_reason(kind: EventKind) -> Option<&'static str> {
    match kind {
        EventKind::GoPreempt => Some("cpu"),
        EventKind::GoBlock => Some("block"),
        EventKind::GoBlockCond => Some("cond"),
        EventKind::GoBlockGC => Some("gc"),
        EventKind::GoBlockNet => Some("net"),
        EventKind::GoBlockRecv => Some("recv"),
        EventKind::GoBlockSelect => Some("select"),
        EventKind::GoBlockSend => Some("send"),
        EventKind::GoBlockSync => Some("sync"),
        EventKind::GoSysBlock => Some("syscall"),
        _ => None,
    }
}

struct TreeNode {
    stack: Arc<RegionStack>,
    children: Vec<usize>,
}

/// Extracts the causal span trees of a trace. `find_regions` is applied to
/// each goroutine's events; the resulting regions are connected with the
/// default [`RegionConnector`] rules, and every root chain that explains at
/// least one other chain becomes a tree.
pub fn extract_spans(
    data: &Data,
    find_regions: impl Fn(&Data, &[EventId]) -> Vec<Region>,
) -> Vec<Span> {
    // Fallback span names: the root function of each goroutine's first
    // stack. A one-frame starting stack is sometimes a wrapper function, so
    // keep scanning until a stack of two or more frames appears.
    let mut root_func: HashMap<u64, String> = HashMap::new();
    for &g in data.goroutines() {
        let mut name = String::new();
        for &id in data.goroutine_events(g) {
            let stack = &data.event(id).stack;
            if let Some(root) = stack.last() {
                name = root.func.clone();
                if stack.len() >= 2 {
                    break;
                }
            }
        }
        root_func.insert(g, name);
    }

    let mut regions: Vec<Region> = Vec::new();
    for &g in data.goroutines() {
        regions.extend(find_regions(data, data.goroutine_events(g)));
    }

    let conn = RegionConnector::new().process(data, &regions);

    // Distinct chains, in first-seen order.
    let mut seen: HashSet<usize> = HashSet::new();
    let mut stacks: Vec<Arc<RegionStack>> = Vec::new();
    for id in 0..data.len() {
        if let Some(stack) = &conn.event_region_stacks[id] {
            if seen.insert(ptr(stack)) {
                stacks.push(stack.clone());
            }
        }
    }

    // Root chain per chain, memoized.
    let mut root_of: HashMap<usize, Arc<RegionStack>> = HashMap::new();
    for stack in &stacks {
        let mut cur = stack.clone();
        loop {
            if let Some(root) = root_of.get(&ptr(&cur)) {
                cur = root.clone();
            }
            if cur.parent.is_none() {
                root_of.insert(ptr(stack), cur);
                break;
            }
            let parent = cur.parent.clone().expect("checked above");
            cur = parent;
        }
    }

    // Group chains under their roots; a root with no descendants yields no
    // tree.
    let mut roots: Vec<Arc<RegionStack>> = Vec::new();
    let mut children_of: HashMap<usize, Vec<Arc<RegionStack>>> = HashMap::new();
    for stack in &stacks {
        let root = root_of[&ptr(stack)].clone();
        if ptr(stack) != ptr(&root) {
            if !children_of.contains_key(&ptr(&root)) {
                roots.push(root.clone());
            }
            children_of.entry(ptr(&root)).or_default().push(stack.clone());
        }
    }

    let mut nodes: HashMap<usize, TreeNode> = HashMap::new();
    let mut node_order: Vec<usize> = Vec::new();
    for root in &roots {
        nodes.insert(
            ptr(root),
            TreeNode {
                stack: root.clone(),
                children: Vec::new(),
            },
        );
        node_order.push(ptr(root));
        for child in &children_of[&ptr(root)] {
            nodes.insert(
                ptr(child),
                TreeNode {
                    stack: child.clone(),
                    children: Vec::new(),
                },
            );
            node_order.push(ptr(child));
        }
    }

    // Attach each node beneath its nearest ancestor with a distinct start;
    // exactly-overlapping links are the same position, not a parent.
    for &key in &node_order {
        let stack = nodes[&key].stack.clone();
        let mut parent: Option<usize> = None;
        for link in chain(stack.parent.as_ref()) {
            if link.start != stack.start {
                if nodes.contains_key(&ptr(link)) {
                    parent = Some(ptr(link));
                }
                break;
            }
        }
        if let Some(parent) = parent {
            nodes
                .get_mut(&parent)
                .expect("parent key comes from the node table")
                .children
                .push(key);
        }
    }

    for &key in &node_order {
        let mut children = std::mem::take(
            &mut nodes
                .get_mut(&key)
                .expect("node key comes from the node table")
                .children,
        );
        children.sort_by_key(|child| data.event(nodes[child].stack.start).ts);
        nodes
            .get_mut(&key)
            .expect("node key comes from the node table")
            .children = children;
    }

    roots.sort_by_key(|root| data.event(root.start).ts);

    roots
        .iter()
        .map(|root| build_span(ptr(root), &nodes, data, &conn, &regions, &root_func))
        .collect()
}

fn build_span(
    key: usize,
    nodes: &HashMap<usize, TreeNode>,
    data: &Data,
    conn: &Connections,
    regions: &[Region],
    root_func: &HashMap<u64, String>,
) -> Span {
    let node = &nodes[&key];
    let stack = &node.stack;
    let start = stack.start;
    let g = data.event(start).g;
    let kind = match stack.local {
        Some(region) => regions[region].kind.clone(),
        None => root_func.get(&g).cloned().unwrap_or_default(),
    };
    let mut span = Span {
        g,
        kind,
        start_ns: data.event(start).ts,
        ..Span::default()
    };

    // The node's events: forward from the start while the chain still
    // explains the event. The final event of a region no longer carries the
    // chain; include that one last event before stopping.
    let mut events: Vec<EventId> = Vec::new();
    let mut cur = Some(start);
    while let Some(id) = cur {
        let explained = chain(conn.event_region_stacks[id].as_ref()).any(|n| ptr(n) == key);
        events.push(id);
        if !explained {
            break;
        }
        cur = data.next(id);
    }

    let mut change_ev: Vec<EventId> = Vec::new();
    for &id in &events {
        let kind = data.event(id).kind;
        if is_run_start(kind)
            || assist_reason(kind).is_some()
            || wait_reason(kind).is_some()
            || change_ev.is_empty()
        {
            change_ev.push(id);
        }
    }

    for (i, &id) in change_ev.iter().enumerate() {
        let ev = data.event(id);
        let next = change_ev.get(i + 1).map(|&n| data.event(n));

        // When a non-root span begins with a GoStart, the time it took to
        // schedule that goroutine was delay for the root span. Count it as
        // "cpu" wait before the span's zero time.
        if i == 0 && ev.kind == EventKind::GoStart {
            if let Some(from) = data.backlink(id) {
                let wait = span.start_ns - data.event(from).ts;
                if wait > 0 {
                    span.start_wait
                        .entry("cpu".to_string())
                        .or_default()
                        .push(-wait);
                }
            }
        }

        if let Some(reason) = assist_reason(ev.kind) {
            span.start_assist
                .entry(reason.to_string())
                .or_default()
                .push(ev.ts - span.start_ns);
            continue;
        }
        if let Some(reason) = wait_reason(ev.kind) {
            span.start_wait
                .entry(reason.to_string())
                .or_default()
                .push(ev.ts - span.start_ns);
            // If the wake-up arrived before the goroutine ran again, the gap
            // from wake to run was spent runnable: count it under "cpu".
            if let (Some(link), Some(next)) = (ev.link, next) {
                let woke = data.event(link).ts;
                if ev.ts < woke && woke < next.ts {
                    span.start_wait
                        .entry("cpu".to_string())
                        .or_default()
                        .push(woke - span.start_ns);
                }
            }
            continue;
        }
        span.start_run.push(ev.ts - span.start_ns);
    }

    let last = *events.last().expect("a span covers at least its start event");
    span.length_ns = data.event(last).ts - span.start_ns;

    for &child in &node.children {
        span.caused
            .push(build_span(child, nodes, data, conn, regions, root_func));
    }
    span.caused.sort_by_key(|child| child.start_ns);

    span
}
