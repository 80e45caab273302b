//! Per-goroutine state-machine aggregation
//!
//! Watching a goroutine throughout its lifecycle as the functions on its
//! stack change builds a view of its behavior as a state machine: nodes are
//! (call stack, scheduler state) pairs, edges are the transitions observed
//! between them, weighted by count. This pass consumes the trace's
//! state-transition events in parallel with the region pipeline.
//!
//! Not every transition is useful signal. Paired preemption events say only
//! that the scheduler wanted the P back; stacks containing `runtime.mallocgc`
//! describe allocation sampling rather than synchronization points; stacks
//! with a zero line number are known-truncated. All three are filtered from
//! the state machine (but stay in the trace for every other pass).
//! Transitions observed without a stack land in a short `via` ring on the
//! next recorded edge instead of becoming nodes of their own.

use std::collections::HashMap;

use crate::data::Data;
use crate::event::{
    EventId, Frame, GoState, ResourceKind, StackId, StackSet, NO_GOROUTINE, NO_STACK,
};

/// Capacity of the `via` ring: intermediate states observed without stacks,
/// newest at index 0.
pub const VIA_LEN: usize = 8;

/// A (call stack, scheduler state) node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StackState {
    pub stack: StackId,
    pub state: GoState,
}

/// A directed edge between two nodes, annotated with the stackless states
/// observed in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub from: StackState,
    pub to: StackState,
    pub via: [GoState; VIA_LEN],
}

/// An edge with its `via` annotations ignored, for folded reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SimpleEdge {
    pub from: StackState,
    pub to: StackState,
}

/// Earliest observed example per node and per edge, for tooltips.
#[derive(Debug, Default)]
pub struct Examples {
    stack_state: HashMap<StackState, (EventId, i64)>,
    edge_to: HashMap<Edge, (EventId, i64)>,
}

impl Examples {
    fn offer_stack_state(&mut self, key: StackState, ev: EventId, ts: i64) {
        match self.stack_state.get(&key) {
            Some(&(_, prev_ts)) if ts > prev_ts => {}
            _ => {
                self.stack_state.insert(key, (ev, ts));
            }
        }
    }

    fn offer_edge(&mut self, key: Edge, ev: EventId, ts: i64) {
        match self.edge_to.get(&key) {
            Some(&(_, prev_ts)) if ts > prev_ts => {}
            _ => {
                self.edge_to.insert(key, (ev, ts));
            }
        }
    }

    pub fn stack_state(&self, key: StackState) -> Option<EventId> {
        self.stack_state.get(&key).map(|&(ev, _)| ev)
    }

    pub fn edge(&self, key: &Edge) -> Option<EventId> {
        self.edge_to.get(key).map(|&(ev, _)| ev)
    }
}

/// The evolving state machine of one goroutine.
#[derive(Debug, Default)]
pub struct Behaviors {
    edges: HashMap<Edge, u64>,
    prev_state: StackState,
    via: [GoState; VIA_LEN],
    current: GoState,
    preempted: bool,
}

struct TransitionInfo {
    ev: EventId,
    ts: i64,
    from: GoState,
    to: GoState,
    preemption: bool,
    async_preemption: bool,
}

fn stack_is_malloc(frames: &[Frame]) -> bool {
    frames.iter().any(|f| f.func == "runtime.mallocgc")
}

fn stack_is_buggy(frames: &[Frame]) -> bool {
    frames.iter().any(|f| f.line == 0)
}

fn unreliable(info: &TransitionInfo, frames: &[Frame]) -> bool {
    info.async_preemption || stack_is_malloc(frames) || stack_is_buggy(frames)
}

impl Behaviors {
    /// Observed edges with their counts.
    pub fn edges(&self) -> &HashMap<Edge, u64> {
        &self.edges
    }

    /// Edge counts folded over `via`.
    pub fn simple_edges(&self) -> HashMap<SimpleEdge, u64> {
        let mut out: HashMap<SimpleEdge, u64> = HashMap::new();
        for (edge, count) in &self.edges {
            *out.entry(SimpleEdge {
                from: edge.from,
                to: edge.to,
            })
            .or_default() += count;
        }
        out
    }

    /// This goroutine caused a transition on some other resource.
    fn transition_origin(
        &mut self,
        info: &TransitionInfo,
        stack: StackId,
        frames: &[Frame],
        examples: &mut Examples,
    ) {
        if self.current == GoState::Undetermined {
            // It is causing other resources to change state, so it must be
            // running.
            self.current = GoState::Running;
        }

        if stack == NO_STACK {
            // An interesting stack is the only reason to be here.
            return;
        }

        self.notice(info, stack, frames, self.current, examples);

        if !unreliable(info, frames) {
            self.prev_state = StackState {
                stack,
                state: self.current,
            };
        }
    }

    /// A transition affected this goroutine.
    fn transition_target(
        &mut self,
        info: &TransitionInfo,
        stack: StackId,
        frames: &[Frame],
        examples: &mut Examples,
    ) {
        if info.from == GoState::NotExist {
            self.prev_state = StackState {
                stack,
                state: info.from,
            };
        }

        self.notice(info, stack, frames, info.to, examples);
        self.current = info.to;
    }

    fn notice(
        &mut self,
        info: &TransitionInfo,
        stack: StackId,
        frames: &[Frame],
        to: GoState,
        examples: &mut Examples,
    ) {
        // Ignore pairs of preemption events: the Running->Runnable sets the
        // flag, the matching Runnable->Running is swallowed.
        if self.preempted {
            if to == GoState::Running {
                return;
            }
            self.preempted = false;
        }
        if info.preemption {
            self.preempted = true;
        }

        if unreliable(info, frames) {
            return;
        }

        if stack == NO_STACK && to != GoState::NotExist {
            for i in (1..self.via.len()).rev() {
                self.via[i] = self.via[i - 1];
            }
            self.via[0] = to;
            return;
        }

        let next = StackState { stack, state: to };
        let edge = Edge {
            from: self.prev_state,
            to: next,
            via: self.via,
        };
        *self.edges.entry(edge).or_default() += 1;
        examples.offer_edge(edge, info.ev, info.ts);
        examples.offer_stack_state(next, info.ev, info.ts);
        self.prev_state = next;
        self.via = [GoState::Undetermined; VIA_LEN];
    }
}

/// Builds each goroutine's state machine from a trace's state-transition
/// events.
#[derive(Debug, Default)]
pub struct GoroutineStates {
    goroutines: HashMap<u64, Behaviors>,
    stacks: StackSet,
    examples: Examples,
}

impl GoroutineStates {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds every state-transition event of the trace through the
    /// aggregator, in order.
    pub fn process(&mut self, data: &Data) {
        for id in 0..data.len() {
            self.process_event(data, id);
        }
    }

    /// Feeds one event. Non-transition events and transitions of resources
    /// other than goroutines are ignored.
    pub fn process_event(&mut self, data: &Data, id: EventId) {
        let ev = data.event(id);
        let Some(tr) = &ev.transition else {
            return;
        };
        if tr.resource != ResourceKind::Goroutine {
            return;
        }

        let src = ev.g;
        let dst = tr.goroutine;
        let src_stack = self.stacks.canonical(&ev.stack);
        let dst_stack = self.stacks.canonical(&tr.stack);

        let info = TransitionInfo {
            ev: id,
            ts: ev.ts,
            from: tr.from,
            to: tr.to,
            preemption: tr.from == GoState::Running && tr.to == GoState::Runnable,
            async_preemption: tr.from == GoState::Running
                && tr.to == GoState::Runnable
                && !ev.stack.iter().any(|f| f.func == "runtime.Gosched"),
        };

        if src != dst {
            if src != NO_GOROUTINE {
                let b = self.goroutines.entry(src).or_default();
                b.transition_origin(&info, src_stack, &ev.stack, &mut self.examples);
            }
            if dst != NO_GOROUTINE {
                let b = self.goroutines.entry(dst).or_default();
                b.transition_target(&info, dst_stack, &tr.stack, &mut self.examples);
            }
        } else if src != NO_GOROUTINE {
            let b = self.goroutines.entry(src).or_default();
            b.transition_target(&info, src_stack, &ev.stack, &mut self.examples);
        }
    }

    pub fn goroutines(&self) -> &HashMap<u64, Behaviors> {
        &self.goroutines
    }

    pub fn stacks(&self) -> &StackSet {
        &self.stacks
    }

    pub fn examples(&self) -> &Examples {
        &self.examples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventKind, StateTransition};

    fn frame(func: &str, line: u32) -> Frame {
        Frame {
            pc: 0x4000,
            func: func.to_string(),
            file: "x.go".to_string(),
            line,
        }
    }

    fn transition(
        ts: i64,
        g: u64,
        target: u64,
        from: GoState,
        to: GoState,
        own_stack: &[Frame],
        target_stack: &[Frame],
    ) -> Event {
        let mut ev = Event::new(ts, EventKind::StateTransition, g);
        ev.stack = own_stack.to_vec();
        ev.transition = Some(StateTransition {
            resource: ResourceKind::Goroutine,
            goroutine: target,
            from,
            to,
            stack: target_stack.to_vec(),
        });
        ev
    }

    fn run(events: Vec<Event>) -> GoroutineStates {
        let data = Data::new(events).unwrap();
        let mut states = GoroutineStates::new();
        states.process(&data);
        states
    }

    #[test]
    fn test_self_transitions_build_edges() {
        let work = [frame("main.worker", 10), frame("main.main", 3)];
        let park = [frame("main.wait", 22), frame("main.main", 3)];
        let states = run(vec![
            transition(100, 7, 7, GoState::Running, GoState::Waiting, &work, &[]),
            transition(200, 7, 7, GoState::Waiting, GoState::Running, &park, &[]),
            transition(300, 7, 7, GoState::Running, GoState::Waiting, &work, &[]),
            transition(400, 7, 7, GoState::Waiting, GoState::Running, &park, &[]),
        ]);

        let b = &states.goroutines()[&7];
        // First edge from (no stack, Undetermined) into the work/park cycle;
        // the Waiting->Running leg repeats and accumulates.
        assert_eq!(b.edges().len(), 3);
        let simple = b.simple_edges();
        assert_eq!(simple.len(), 3);
        assert_eq!(simple.values().copied().max(), Some(2));
    }

    #[test]
    fn test_preemption_pair_is_dropped() {
        let work = [frame("main.worker", 10), frame("main.main", 3)];
        // An async preemption (no runtime.Gosched frame) and its resume must
        // contribute no edges.
        let states = run(vec![
            transition(100, 7, 7, GoState::Running, GoState::Runnable, &work, &[]),
            transition(200, 7, 7, GoState::Runnable, GoState::Running, &work, &[]),
        ]);
        assert!(states.goroutines()[&7].edges().is_empty());
    }

    #[test]
    fn test_voluntary_gosched_is_recorded() {
        let yield_stack = [frame("runtime.Gosched", 1), frame("main.loop", 9)];
        let states = run(vec![
            transition(100, 7, 7, GoState::Running, GoState::Runnable, &yield_stack, &[]),
        ]);
        // Not async (Gosched on stack), so the edge is kept; the paired
        // resume would still be swallowed by the preempted flag.
        assert_eq!(states.goroutines()[&7].edges().len(), 1);
    }

    #[test]
    fn test_malloc_and_buggy_stacks_are_filtered() {
        let malloc = [frame("runtime.mallocgc", 5), frame("main.alloc", 12)];
        let truncated = [frame("main.worker", 0)];
        let states = run(vec![
            transition(100, 7, 7, GoState::Running, GoState::Waiting, &malloc, &[]),
            transition(200, 7, 7, GoState::Waiting, GoState::Running, &truncated, &[]),
        ]);
        assert!(states.goroutines()[&7].edges().is_empty());
    }

    #[test]
    fn test_stackless_states_land_in_via_ring() {
        let work = [frame("main.worker", 10), frame("main.main", 3)];
        let states = run(vec![
            transition(100, 7, 7, GoState::Running, GoState::Waiting, &[], &[]),
            transition(200, 7, 7, GoState::Waiting, GoState::Runnable, &[], &[]),
            transition(300, 7, 7, GoState::Runnable, GoState::Running, &work, &[]),
        ]);

        let b = &states.goroutines()[&7];
        assert_eq!(b.edges().len(), 1);
        let edge = b.edges().keys().next().unwrap();
        // Newest first.
        assert_eq!(edge.via[0], GoState::Runnable);
        assert_eq!(edge.via[1], GoState::Waiting);
        assert_eq!(edge.via[2], GoState::Undetermined);
        assert_eq!(edge.to.state, GoState::Running);
    }

    #[test]
    fn test_cross_goroutine_wake_uses_target_stack() {
        let waker = [frame("main.notify", 17), frame("main.main", 3)];
        let sleeper = [frame("main.wait", 22), frame("main.run", 8)];
        let states = run(vec![transition(
            100,
            1,
            2,
            GoState::Waiting,
            GoState::Runnable,
            &waker,
            &sleeper,
        )]);

        // The origin must be running to act; the target records the
        // transition with its own stack.
        let target = &states.goroutines()[&2];
        assert_eq!(target.edges().len(), 1);
        let edge = target.edges().keys().next().unwrap();
        assert_eq!(edge.to.state, GoState::Runnable);
        let frames = states.stacks().frames(edge.to.stack);
        assert_eq!(frames[0].func, "main.wait");

        // The origin recorded an edge into (waker stack, Running).
        let origin = &states.goroutines()[&1];
        assert_eq!(origin.edges().len(), 1);
        let edge = origin.edges().keys().next().unwrap();
        assert_eq!(edge.to.state, GoState::Running);
    }

    #[test]
    fn test_examples_keep_earliest_event() {
        let work = [frame("main.worker", 10), frame("main.main", 3)];
        let states = run(vec![
            transition(100, 7, 7, GoState::Running, GoState::Waiting, &work, &[]),
            transition(200, 7, 7, GoState::Waiting, GoState::Running, &work, &[]),
            transition(300, 7, 7, GoState::Running, GoState::Waiting, &work, &[]),
        ]);

        let b = &states.goroutines()[&7];
        for edge in b.edges().keys() {
            let example = states.examples().edge(edge).unwrap();
            // Each edge's example is its first occurrence.
            if edge.from.state == GoState::Undetermined {
                assert_eq!(example, 0);
            }
            if edge.from.state == GoState::Running {
                assert_eq!(example, 2);
            }
        }
    }
}
