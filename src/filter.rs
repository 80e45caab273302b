//! Event/stack filter expressions
//!
//! The spec language for selecting events, on the command line and in the
//! library: whitespace-separated tokens, where the first token names an
//! event kind (`Any` matches every kind) and each remaining token is a
//! double-quoted stack spec, either `**` or a regular expression, handed to
//! [`crate::matcher`]. Regular expressions are validated when the filter is
//! parsed, so matching can no longer fail at scan time.
//!
//! ```text
//! Any "**"
//! GoBlockNet "^net/http\.\(\*conn\)\.serve$" "**"
//! ```

use std::fmt;
use std::str::FromStr;

use crate::event::{Event, EventKind};
use crate::matcher::{self, MatchError};

/// A parse or validation failure for a filter expression.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("empty filter expression")]
    Empty,
    #[error("invalid trace event name {0:?}")]
    UnknownEvent(String),
    #[error("malformed quoted spec at {0:?}")]
    BadQuoting(String),
    #[error("unsupported escape \\{0} in quoted spec")]
    BadEscape(char),
    #[error("invalid stack matcher: {0}")]
    Match(#[from] MatchError),
}

/// A compiled filter: an optional event kind plus stack specs.
///
/// # Example
///
/// ```
/// use tejedor::filter::EventFilter;
///
/// let filter: EventFilter = r#"GoBlockNet "**" "serve" "**""#.parse().unwrap();
/// assert_eq!(filter.to_string(), r#"GoBlockNet "**" "serve" "**""#);
/// assert!(r#"Bogus "**""#.parse::<EventFilter>().is_err());
/// ```
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// `None` means `Any`: match every kind.
    pub kind: Option<EventKind>,
    pub specs: Vec<String>,
}

impl EventFilter {
    pub fn kind_matches(&self, kind: EventKind) -> bool {
        self.kind.map_or(true, |k| k == kind)
    }

    /// Whether the event's kind and stack both match. With no specs, only
    /// stackless events match.
    pub fn event_matches(&self, ev: &Event) -> bool {
        if !self.kind_matches(ev.kind) {
            return false;
        }
        let specs: Vec<&str> = self.specs.iter().map(String::as_str).collect();
        matcher::has_stack(&ev.stack, &specs)
    }
}

impl FromStr for EventFilter {
    type Err = FilterError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(FilterError::Empty);
        }
        let (name, rest) = match s.split_once(' ') {
            Some((name, rest)) => (name, rest.trim_start()),
            None => (s, ""),
        };

        let kind = if name == "Any" {
            None
        } else {
            Some(
                name.parse::<EventKind>()
                    .map_err(|_| FilterError::UnknownEvent(name.to_string()))?,
            )
        };

        let specs = scan_quoted(rest)?;
        matcher::validate(&specs)?;

        Ok(EventFilter { kind, specs })
    }
}

impl fmt::Display for EventFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            Some(kind) => write!(f, "{kind}")?,
            None => f.write_str("Any")?,
        }
        for spec in &self.specs {
            write!(f, " \"{}\"", escape(spec))?;
        }
        if self.specs.is_empty() {
            f.write_str(" **")?;
        }
        Ok(())
    }
}

/// Scans a run of double-quoted tokens, honoring `\\` and `\"` escapes.
fn scan_quoted(s: &str) -> Result<Vec<String>, FilterError> {
    let mut specs = Vec::new();
    let mut chars = s.char_indices().peekable();

    loop {
        // Skip whitespace between tokens.
        while matches!(chars.peek(), Some((_, c)) if c.is_whitespace()) {
            chars.next();
        }
        let Some(&(start, open)) = chars.peek() else {
            return Ok(specs);
        };
        if open != '"' {
            return Err(FilterError::BadQuoting(s[start..].to_string()));
        }
        chars.next();

        let mut spec = String::new();
        loop {
            match chars.next() {
                Some((_, '"')) => break,
                Some((_, '\\')) => match chars.next() {
                    Some((_, '\\')) => spec.push('\\'),
                    Some((_, '"')) => spec.push('"'),
                    Some((_, other)) => return Err(FilterError::BadEscape(other)),
                    None => return Err(FilterError::BadQuoting(s[start..].to_string())),
                },
                Some((_, c)) => spec.push(c),
                None => return Err(FilterError::BadQuoting(s[start..].to_string())),
            }
        }
        specs.push(spec);
    }
}

fn escape(spec: &str) -> String {
    spec.replace('\\', "\\\\").replace('"', "\\\"")
}
