//! Frame-sequence stack matching
//!
//! Answers "does this call stack look like X?" for the region trackers and
//! the event filter. A match specification is a sequence of tokens applied to
//! the stack root-first: the literal `**` matches zero or more frames of any
//! function, and every other token is a regular expression searched against
//! the frame's function name after `/vendor/` trimming. Submatch queries
//! additionally report where each capture group landed, as
//! (frame, byte-start, byte-end) triples against the untrimmed name.
//!
//! Compiled expressions and vendor-trim results are memoized in a
//! process-wide table, so recipes can pass spec strings on every event
//! without recompiling. The table is safe to share across independent
//! analyses.
//!
//! # Example
//!
//! ```
//! use tejedor::event::Frame;
//! use tejedor::matcher;
//!
//! let frame = |func: &str| Frame {
//!     pc: 0, func: func.into(), file: "f.go".into(), line: 1,
//! };
//! // Stacks are leaf-first; specs read root-first.
//! let stack = [frame("net/http.(*conn).readRequest"), frame("net/http.(*conn).serve")];
//! assert!(matcher::has_stack(&stack, &[r"^net/http\.\(\*conn\)\.serve$", "**"]));
//! assert!(!matcher::has_stack(&stack, &["**", "main.main", "**"]));
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use regex::Regex;

use crate::event::Frame;

/// A match specification failed to compile.
#[derive(Debug, Clone, thiserror::Error)]
#[error("could not compile pattern {spec:?}: {source}")]
pub struct MatchError {
    pub spec: String,
    #[source]
    pub source: regex::Error,
}

/// Where one capture group matched: `frame` counts leaf frames skipped
/// before the matching frame, `start`/`end` are byte offsets within that
/// frame's (untrimmed) function name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submatch {
    pub frame: usize,
    pub start: usize,
    pub end: usize,
}

/// Reports whether `stack` matches `specs`.
///
/// An empty stack matches exactly when the specs reduce to nothing or to a
/// single `**` (consecutive `**` collapse).
///
/// # Panics
///
/// Panics if a spec fails to compile. Validate user-supplied specs with
/// [`validate`] first; recipe literals are exercised by their own tests.
pub fn has_stack(stack: &[Frame], specs: &[&str]) -> bool {
    match matches(stack, specs) {
        Ok(found) => found.is_some(),
        Err(err) => panic!("{err}"),
    }
}

/// Searches `stack` for the capture groups in `specs` and returns their
/// locations, in spec order. `Some(vec![])` means the stack matched but no
/// group captured; `None` means no match.
///
/// # Panics
///
/// Panics if a spec fails to compile, like [`has_stack`].
pub fn find_submatches(stack: &[Frame], specs: &[&str]) -> Option<Vec<Submatch>> {
    match matches(stack, specs) {
        Ok(found) => found,
        Err(err) => panic!("{err}"),
    }
}

/// Non-panicking form of [`find_submatches`]: compile errors surface as
/// `Err`, a non-match as `Ok(None)`.
pub fn matches(stack: &[Frame], specs: &[&str]) -> Result<Option<Vec<Submatch>>, MatchError> {
    program().matches(stack, specs)
}

/// Compiles every spec, memoizing the results. This is the Set-time check
/// for user-supplied patterns: after `validate` succeeds, matching with the
/// same specs cannot fail.
pub fn validate<S: AsRef<str>>(specs: &[S]) -> Result<(), MatchError> {
    let p = program();
    for spec in specs {
        let spec = spec.as_ref();
        if spec != "**" {
            p.compile(spec)?;
        }
    }
    Ok(())
}

/// Removes everything up to and including the last `/vendor/`, and a leading
/// `vendor/`, from a function name. Memoized.
pub fn trim_vendor(func: &str) -> String {
    program().trim_vendor(func)
}

fn program() -> &'static Program {
    static PROGRAM: OnceLock<Program> = OnceLock::new();
    PROGRAM.get_or_init(Program::default)
}

#[derive(Default)]
struct Program {
    re: Mutex<HashMap<String, Result<Arc<Regex>, regex::Error>>>,
    trim: Mutex<HashMap<String, String>>,
}

enum CompiledSpec {
    /// `**`: zero or more frames, any function.
    Any,
    Re(Arc<Regex>),
}

impl Program {
    fn trim_vendor(&self, func: &str) -> String {
        let mut cache = self.trim.lock().expect("trim cache poisoned");
        if let Some(saved) = cache.get(func) {
            return saved.clone();
        }
        let mut saved = func;
        if let Some(i) = saved.rfind("/vendor/") {
            saved = &saved[i + "/vendor/".len()..];
        }
        saved = saved.strip_prefix("vendor/").unwrap_or(saved);
        let saved = saved.to_string();
        cache.insert(func.to_string(), saved.clone());
        saved
    }

    fn compile(&self, spec: &str) -> Result<Arc<Regex>, MatchError> {
        let mut cache = self.re.lock().expect("regex cache poisoned");
        let entry = cache
            .entry(spec.to_string())
            .or_insert_with(|| Regex::new(spec).map(Arc::new));
        entry.clone().map_err(|source| MatchError {
            spec: spec.to_string(),
            source,
        })
    }

    fn compile_specs(&self, specs: &[&str]) -> Result<Vec<CompiledSpec>, MatchError> {
        let mut res = Vec::with_capacity(specs.len());
        for &spec in specs {
            if spec == "**" {
                // Collapse runs of ** into one.
                if !matches!(res.last(), Some(CompiledSpec::Any)) {
                    res.push(CompiledSpec::Any);
                }
            } else {
                res.push(CompiledSpec::Re(self.compile(spec)?));
            }
        }
        Ok(res)
    }

    fn matches(
        &self,
        stack: &[Frame],
        specs: &[&str],
    ) -> Result<Option<Vec<Submatch>>, MatchError> {
        let res = self.compile_specs(specs)?;

        if stack.is_empty() && (res.is_empty() || (res.len() == 1 && matches!(res[0], CompiledSpec::Any))) {
            return Ok(Some(Vec::new()));
        }

        // NFA states: (parent, frame index, specs consumed). A state appears
        // in the frontier at most once per consumed-count; the first one
        // added wins.
        let mut arena: Vec<(Option<usize>, usize, usize)> = vec![(None, 0, 0)];
        let mut frontier: Vec<usize> = vec![0];

        fn add(arena: &[(Option<usize>, usize, usize)], next: &mut Vec<usize>, state: usize) {
            if next.last().map_or(true, |&last| arena[last].2 != arena[state].2) {
                next.push(state);
            }
        }

        // Walk the stack starting at the root.
        for i in (0..stack.len()).rev() {
            let func = self.trim_vendor(&stack[i].func);
            let mut next: Vec<usize> = Vec::new();
            for &state in &frontier {
                let consumed = arena[state].2;
                if consumed >= res.len() {
                    continue;
                }
                // A ** may consume this frame in place, or be skipped so the
                // following spec can try the same frame.
                let mut j = consumed;
                while j <= consumed + 1 && j < res.len() {
                    match &res[j] {
                        CompiledSpec::Any => {
                            add(&arena, &mut next, state);
                            arena.push((Some(state), i, consumed + 1));
                            let advanced = arena.len() - 1;
                            add(&arena, &mut next, advanced);
                        }
                        CompiledSpec::Re(re) => {
                            if re.is_match(&func) {
                                arena.push((Some(state), i, consumed + 1));
                                let mut v = arena.len() - 1;
                                if j > consumed {
                                    // Also consumed the zero-width ** at
                                    // position `consumed`.
                                    let length = arena[v].2;
                                    arena.push((Some(v), i, length + 1));
                                    v = arena.len() - 1;
                                }
                                add(&arena, &mut next, v);
                            }
                            break;
                        }
                    }
                    j += 1;
                }
            }
            frontier = next;
        }

        for &state in &frontier {
            if arena[state].2 != res.len() {
                continue;
            }
            // Collect capture positions walking leaf-ward to root-ward, then
            // reverse so triples come out in spec order.
            let mut match_sets: Vec<Vec<Submatch>> = Vec::new();
            let mut node = state;
            while let Some(parent) = arena[node].0 {
                let (_, frame_idx, length) = arena[node];
                if let CompiledSpec::Re(re) = &res[length - 1] {
                    // Submatch offsets are reported against the raw name,
                    // not the vendor-trimmed one used for matching.
                    let raw = &stack[frame_idx].func;
                    let mut found = Vec::new();
                    if let Some(caps) = re.captures(raw) {
                        for group in 1..caps.len() {
                            if let Some(m) = caps.get(group) {
                                found.push(Submatch {
                                    frame: frame_idx,
                                    start: m.start(),
                                    end: m.end(),
                                });
                            }
                        }
                    }
                    if !found.is_empty() {
                        match_sets.push(found);
                    }
                }
                node = parent;
            }

            let mut all = Vec::new();
            for set in match_sets.into_iter().rev() {
                all.extend(set);
            }
            return Ok(Some(all));
        }

        Ok(None)
    }
}
