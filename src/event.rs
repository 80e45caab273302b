//! Event model for recorded scheduler traces
//!
//! A trace is a finite stream of [`Event`] records, each owned by a goroutine
//! and stamped with a monotonic nanosecond timestamp. Events optionally carry
//! a call stack (leaf-first), a link to a later event they unblocked, and a
//! state-transition payload describing a resource changing state.
//!
//! Stacks that compare byte-equal intern to a single [`StackId`] through
//! [`StackSet`], so downstream passes can use cheap equality on handles
//! instead of comparing frame lists.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Index of an event within its owning [`crate::data::Data`], assigned in
/// chronological order.
pub type EventId = usize;

/// Goroutine id reserved for "no goroutine" (events raised by the runtime
/// itself, or transition sources outside any goroutine).
pub const NO_GOROUTINE: u64 = u64::MAX;

/// The scheduler interaction a single trace record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    GoCreate,
    GoStart,
    GoEnd,
    GoStop,
    GoSched,
    GoPreempt,
    GoSleep,
    GoBlock,
    GoBlockSend,
    GoBlockRecv,
    GoBlockSelect,
    GoBlockSync,
    GoBlockCond,
    GoBlockNet,
    GoBlockGC,
    GoSysCall,
    GoSysExit,
    GoSysBlock,
    GoUnblock,
    GCStart,
    GCDone,
    GCMarkAssistStart,
    GCMarkAssistDone,
    StateTransition,
}

impl EventKind {
    /// All kinds, in wire-name order. Used by the name lookup in `FromStr`
    /// and by the `filter` module's kind validation.
    pub const ALL: [EventKind; 24] = [
        EventKind::GoCreate,
        EventKind::GoStart,
        EventKind::GoEnd,
        EventKind::GoStop,
        EventKind::GoSched,
        EventKind::GoPreempt,
        EventKind::GoSleep,
        EventKind::GoBlock,
        EventKind::GoBlockSend,
        EventKind::GoBlockRecv,
        EventKind::GoBlockSelect,
        EventKind::GoBlockSync,
        EventKind::GoBlockCond,
        EventKind::GoBlockNet,
        EventKind::GoBlockGC,
        EventKind::GoSysCall,
        EventKind::GoSysExit,
        EventKind::GoSysBlock,
        EventKind::GoUnblock,
        EventKind::GCStart,
        EventKind::GCDone,
        EventKind::GCMarkAssistStart,
        EventKind::GCMarkAssistDone,
        EventKind::StateTransition,
    ];

    /// The kind's wire name, as it appears in the text trace format.
    pub fn name(self) -> &'static str {
        match self {
            EventKind::GoCreate => "GoCreate",
            EventKind::GoStart => "GoStart",
            EventKind::GoEnd => "GoEnd",
            EventKind::GoStop => "GoStop",
            EventKind::GoSched => "GoSched",
            EventKind::GoPreempt => "GoPreempt",
            EventKind::GoSleep => "GoSleep",
            EventKind::GoBlock => "GoBlock",
            EventKind::GoBlockSend => "GoBlockSend",
            EventKind::GoBlockRecv => "GoBlockRecv",
            EventKind::GoBlockSelect => "GoBlockSelect",
            EventKind::GoBlockSync => "GoBlockSync",
            EventKind::GoBlockCond => "GoBlockCond",
            EventKind::GoBlockNet => "GoBlockNet",
            EventKind::GoBlockGC => "GoBlockGC",
            EventKind::GoSysCall => "GoSysCall",
            EventKind::GoSysExit => "GoSysExit",
            EventKind::GoSysBlock => "GoSysBlock",
            EventKind::GoUnblock => "GoUnblock",
            EventKind::GCStart => "GCStart",
            EventKind::GCDone => "GCDone",
            EventKind::GCMarkAssistStart => "GCMarkAssistStart",
            EventKind::GCMarkAssistDone => "GCMarkAssistDone",
            EventKind::StateTransition => "StateTransition",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for EventKind {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| UnknownName(s.to_string()))
    }
}

/// Scheduler state of a goroutine, as reported by state-transition events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GoState {
    /// Observed mid-life without a prior origin.
    Undetermined,
    NotExist,
    Runnable,
    Running,
    Waiting,
    Syscall,
}

impl Default for GoState {
    fn default() -> Self {
        GoState::Undetermined
    }
}

impl GoState {
    pub fn name(self) -> &'static str {
        match self {
            GoState::Undetermined => "Undetermined",
            GoState::NotExist => "NotExist",
            GoState::Runnable => "Runnable",
            GoState::Running => "Running",
            GoState::Waiting => "Waiting",
            GoState::Syscall => "Syscall",
        }
    }
}

impl fmt::Display for GoState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for GoState {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Undetermined" => Ok(GoState::Undetermined),
            "NotExist" => Ok(GoState::NotExist),
            "Runnable" => Ok(GoState::Runnable),
            "Running" => Ok(GoState::Running),
            "Waiting" => Ok(GoState::Waiting),
            "Syscall" => Ok(GoState::Syscall),
            other => Err(UnknownName(other.to_string())),
        }
    }
}

/// Error for a name that matches no known kind or state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown name {0:?}")]
pub struct UnknownName(pub String);

/// One call-stack frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Frame {
    pub pc: u64,
    pub func: String,
    pub file: String,
    pub line: u32,
}

/// The resource affected by a state-transition event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceKind {
    Goroutine,
    Proc,
    Thread,
}

/// Payload of a [`EventKind::StateTransition`] event.
///
/// `stack` is the call stack of the resource being transitioned, which for
/// cross-goroutine wakes differs from the stack of the event's own goroutine.
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    pub resource: ResourceKind,
    pub goroutine: u64,
    pub from: GoState,
    pub to: GoState,
    pub stack: Vec<Frame>,
}

/// One record from the trace stream.
///
/// `link` points at a later event this one unblocked, as an index into the
/// owning event list; the analyses only honor it when the target is a
/// `GoStart` on a different goroutine. An empty `stack` means the record
/// carried no stack.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub ts: i64,
    pub kind: EventKind,
    pub p: i32,
    pub g: u64,
    pub link: Option<EventId>,
    pub transition: Option<StateTransition>,
    pub stack: Vec<Frame>,
}

impl Event {
    pub fn new(ts: i64, kind: EventKind, g: u64) -> Self {
        Event {
            ts,
            kind,
            p: 0,
            g,
            link: None,
            transition: None,
            stack: Vec::new(),
        }
    }

    pub fn has_stack(&self) -> bool {
        !self.stack.is_empty()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} p={} g={}", self.ts, self.kind, self.p, self.g)
    }
}

/// Canonical handle for an interned stack. Two stacks with byte-equal frames
/// share one id; [`NO_STACK`] is the empty stack.
pub type StackId = usize;

/// The interned id of the empty stack.
pub const NO_STACK: StackId = 0;

/// Two-way interning table between stacks and canonical handles.
///
/// The canonical form is one line per frame, leaf-first:
/// `function@pc file:line`. Interning makes stack equality O(1) for the
/// state-machine aggregator and keeps memory linear in distinct stacks.
///
/// # Example
///
/// ```
/// use tejedor::event::{Frame, StackSet, NO_STACK};
///
/// let mut set = StackSet::new();
/// let frame = Frame { pc: 0x40ab00, func: "main.run".into(), file: "main.go".into(), line: 10 };
/// let a = set.canonical(&[frame.clone()]);
/// let b = set.canonical(&[frame]);
/// assert_eq!(a, b);
/// assert_eq!(set.canonical(&[]), NO_STACK);
/// ```
#[derive(Debug)]
pub struct StackSet {
    ids: HashMap<String, StackId>,
    frames: Vec<Vec<Frame>>,
}

impl StackSet {
    pub fn new() -> Self {
        let mut set = StackSet {
            ids: HashMap::new(),
            frames: Vec::new(),
        };
        set.ids.insert(String::new(), NO_STACK);
        set.frames.push(Vec::new());
        set
    }

    /// Interns `stack` and returns its canonical handle.
    pub fn canonical(&mut self, stack: &[Frame]) -> StackId {
        let key = Self::format(stack);
        if let Some(&id) = self.ids.get(&key) {
            return id;
        }
        let id = self.frames.len();
        self.frames.push(stack.to_vec());
        self.ids.insert(key, id);
        id
    }

    /// The frames behind a handle, leaf-first.
    pub fn frames(&self, id: StackId) -> &[Frame] {
        &self.frames[id]
    }

    /// Canonical string form: `function@pc file:line`, one frame per line,
    /// leaf-first.
    pub fn format(stack: &[Frame]) -> String {
        use std::fmt::Write as _;
        let mut buf = String::new();
        for f in stack {
            let _ = writeln!(buf, "{}@{:#x} {}:{}", f.func, f.pc, f.file, f.line);
        }
        buf
    }

    /// Compact root-first rendering, `function:line` per frame. Used for
    /// report labels.
    pub fn format_short(&self, id: StackId) -> String {
        use std::fmt::Write as _;
        let mut buf = String::new();
        for f in self.frames[id].iter().rev() {
            let _ = writeln!(buf, "{}:{}", f.func, f.line);
        }
        buf
    }
}

impl Default for StackSet {
    fn default() -> Self {
        Self::new()
    }
}
