//! Text serialization of event streams
//!
//! The analyses in this crate consume recorded event streams; decoding the
//! runtime's binary wire format is someone else's job. This module defines
//! the crate's concrete interchange format: a line-oriented text rendering
//! that is easy to write by hand, diff, and keep in fixtures.
//!
//! One event per title line:
//!
//! ```text
//! 695730843 GoCreate p=2 g=51 (to 695758811/g52)
//!   40ab00 net/http.(*Transport).RoundTrip net/http/transport.go:511
//!   40cd00 main.fetch main.go:31
//! ```
//!
//! Stack frames follow the title, indented by two spaces, leaf-first:
//! `pc-hex function file:line`. The optional `(to <ts>/g<g>)` suffix names
//! the event this one unblocked; links are resolved by `(ts, goroutine)`
//! after the whole stream is read, so forward references are fine. A
//! `StateTransition` title carries `goroutine=<id> from=<State> to=<State>`
//! arguments before the link suffix.

use std::collections::HashMap;
use std::fmt::Write as _;

use crate::event::{Event, EventKind, Frame, GoState, ResourceKind, StateTransition};

/// Failure while reading a text event stream.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("event {0:?}: need at least `ts Kind p=N g=N`")]
    ShortTitle(String),
    #[error("event {title:?}: unknown event kind {kind:?}")]
    UnknownKind { title: String, kind: String },
    #[error("event {title:?}: bad field {field:?}")]
    BadField { title: String, field: String },
    #[error("event {title:?}: unexpected argument {arg:?}")]
    UnexpectedArg { title: String, arg: String },
    #[error("event {title:?}: bad link suffix {link:?}")]
    BadLink { title: String, link: String },
    #[error("frame {0:?}: need `pc function file:line` indented by two spaces")]
    BadFrame(String),
    #[error("stack frame before any event title")]
    OrphanFrame,
}

/// Parses a text event stream. Events keep their input order; `link` fields
/// are resolved to indexes into the returned vector. A link whose
/// `(ts, goroutine)` target does not appear in the stream is left unset.
pub fn parse_events(input: &str) -> Result<Vec<Event>, ParseError> {
    let mut events: Vec<Event> = Vec::new();
    let mut links: Vec<(usize, (i64, u64))> = Vec::new();
    let mut index: HashMap<(i64, u64), usize> = HashMap::new();

    for line in input.lines() {
        if line.is_empty() {
            continue;
        }
        if let Some(frame_line) = line.strip_prefix("  ") {
            let ev = events.last_mut().ok_or(ParseError::OrphanFrame)?;
            ev.stack.push(parse_frame(frame_line)?);
            continue;
        }
        let (ev, to) = parse_title(line)?;
        if let Some(target) = to {
            links.push((events.len(), target));
        }
        index.entry((ev.ts, ev.g)).or_insert(events.len());
        events.push(ev);
    }

    for (from, target) in links {
        events[from].link = index.get(&target).copied();
    }

    Ok(events)
}

fn parse_title(line: &str) -> Result<(Event, Option<(i64, u64)>), ParseError> {
    let short = || ParseError::ShortTitle(line.to_string());
    let bad_field = |field: &str| ParseError::BadField {
        title: line.to_string(),
        field: field.to_string(),
    };

    // Split off a trailing "(to ...)" suffix before tokenizing.
    let (head, to) = match line.find(" (to ") {
        Some(i) => {
            let suffix = &line[i + 1..];
            let inner = suffix
                .strip_prefix("(to ")
                .and_then(|s| s.strip_suffix(')'))
                .ok_or_else(|| ParseError::BadLink {
                    title: line.to_string(),
                    link: suffix.to_string(),
                })?;
            (&line[..i], Some(parse_link(line, inner)?))
        }
        None => (line, None),
    };

    let mut parts = head.split_whitespace();
    let ts: i64 = parts
        .next()
        .ok_or_else(short)?
        .parse()
        .map_err(|_| bad_field("ts"))?;
    let kind_name = parts.next().ok_or_else(short)?;
    let kind: EventKind = kind_name.parse().map_err(|_| ParseError::UnknownKind {
        title: line.to_string(),
        kind: kind_name.to_string(),
    })?;
    let p: i32 = parts
        .next()
        .and_then(|s| s.strip_prefix("p="))
        .ok_or_else(short)?
        .parse()
        .map_err(|_| bad_field("p"))?;
    let g: u64 = parts
        .next()
        .and_then(|s| s.strip_prefix("g="))
        .ok_or_else(short)?
        .parse()
        .map_err(|_| bad_field("g"))?;

    let mut ev = Event::new(ts, kind, g);
    ev.p = p;

    let mut transition: Option<StateTransition> = None;
    for arg in parts {
        let (key, value) = arg.split_once('=').ok_or_else(|| ParseError::UnexpectedArg {
            title: line.to_string(),
            arg: arg.to_string(),
        })?;
        let tr = transition.get_or_insert_with(|| StateTransition {
            resource: ResourceKind::Goroutine,
            goroutine: 0,
            from: GoState::Undetermined,
            to: GoState::Undetermined,
            stack: Vec::new(),
        });
        match key {
            "goroutine" => tr.goroutine = value.parse().map_err(|_| bad_field(key))?,
            "from" => tr.from = value.parse::<GoState>().map_err(|_| bad_field(key))?,
            "to" => tr.to = value.parse::<GoState>().map_err(|_| bad_field(key))?,
            _ => {
                return Err(ParseError::UnexpectedArg {
                    title: line.to_string(),
                    arg: arg.to_string(),
                })
            }
        }
    }
    ev.transition = transition;

    Ok((ev, to))
}

fn parse_link(title: &str, inner: &str) -> Result<(i64, u64), ParseError> {
    let bad = || ParseError::BadLink {
        title: title.to_string(),
        link: inner.to_string(),
    };
    let (ts, g) = inner.split_once("/g").ok_or_else(bad)?;
    Ok((ts.parse().map_err(|_| bad())?, g.parse().map_err(|_| bad())?))
}

fn parse_frame(line: &str) -> Result<Frame, ParseError> {
    let bad = || ParseError::BadFrame(line.to_string());
    let mut parts = line.splitn(3, ' ');
    let pc = u64::from_str_radix(parts.next().ok_or_else(bad)?, 16).map_err(|_| bad())?;
    let func = parts.next().ok_or_else(bad)?.to_string();
    let loc = parts.next().ok_or_else(bad)?;
    let colon = loc.rfind(':').ok_or_else(bad)?;
    let line_no: u32 = loc[colon + 1..].parse().map_err(|_| bad())?;
    Ok(Frame {
        pc,
        func,
        file: loc[..colon].to_string(),
        line: line_no,
    })
}

/// Formats a single event. `events` is the list the event's `link` indexes
/// into; pass `stacks` to include the frame lines.
pub fn format_event(events: &[Event], idx: usize, stacks: bool) -> String {
    let ev = &events[idx];
    let mut buf = String::new();
    let _ = write!(buf, "{ev}");
    if let Some(tr) = &ev.transition {
        let _ = write!(
            buf,
            " goroutine={} from={} to={}",
            tr.goroutine, tr.from, tr.to
        );
    }
    if let Some(link) = ev.link {
        let target = &events[link];
        let _ = write!(buf, " (to {}/g{})", target.ts, target.g);
    }
    buf.push('\n');
    if stacks {
        for f in &ev.stack {
            let _ = writeln!(buf, "  {:x} {} {}:{}", f.pc, f.func, f.file, f.line);
        }
    }
    buf
}

/// Formats a whole event stream in the text format accepted by
/// [`parse_events`].
pub fn format_events(events: &[Event], stacks: bool) -> String {
    let mut buf = String::new();
    for idx in 0..events.len() {
        buf.push_str(&format_event(events, idx, stacks));
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_title_and_stack() {
        let text = "\
1000 GoCreate p=2 g=51 (to 1500/g52)
  40ab00 net/http.(*Transport).RoundTrip net/http/transport.go:511
  40cd00 main.fetch main.go:31
1500 GoStart p=0 g=52
";
        let events = parse_events(text).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].ts, 1000);
        assert_eq!(events[0].kind, EventKind::GoCreate);
        assert_eq!(events[0].p, 2);
        assert_eq!(events[0].g, 51);
        assert_eq!(events[0].link, Some(1));
        assert_eq!(events[0].stack.len(), 2);
        assert_eq!(events[0].stack[0].func, "net/http.(*Transport).RoundTrip");
        assert_eq!(events[0].stack[0].pc, 0x40ab00);
        assert_eq!(events[0].stack[1].line, 31);
        assert!(events[1].stack.is_empty());
    }

    #[test]
    fn test_parse_forward_and_missing_links() {
        let text = "\
100 GoUnblock p=0 g=1 (to 200/g2)
150 GoBlock p=0 g=1 (to 9999/g9)
200 GoStart p=0 g=2
";
        let events = parse_events(text).unwrap();
        assert_eq!(events[0].link, Some(2));
        assert_eq!(events[1].link, None);
    }

    #[test]
    fn test_parse_state_transition_args() {
        let text = "500 StateTransition p=1 g=7 goroutine=9 from=Waiting to=Runnable\n";
        let events = parse_events(text).unwrap();
        let tr = events[0].transition.as_ref().unwrap();
        assert_eq!(tr.goroutine, 9);
        assert_eq!(tr.from, GoState::Waiting);
        assert_eq!(tr.to, GoState::Runnable);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(matches!(
            parse_events("12 Bogus p=0 g=1\n"),
            Err(ParseError::UnknownKind { .. })
        ));
        assert!(matches!(
            parse_events("12 GoStart g=1\n"),
            Err(ParseError::ShortTitle(_))
        ));
        assert!(matches!(
            parse_events("  40ab00 main.main main.go:1\n"),
            Err(ParseError::OrphanFrame)
        ));
        assert!(matches!(
            parse_events("12 GoStart p=0 g=1\n  zz main.main main.go:1\n"),
            Err(ParseError::BadFrame(_))
        ));
    }

    #[test]
    fn test_format_round_trips() {
        let text = "\
1000 GoCreate p=2 g=51 (to 1500/g52)
  40ab00 net/http.(*Transport).RoundTrip net/http/transport.go:511
1500 GoStart p=0 g=52
2000 StateTransition p=1 g=7 goroutine=9 from=Waiting to=Runnable
";
        let events = parse_events(text).unwrap();
        let formatted = format_events(&events, true);
        assert_eq!(formatted, text);
        let reparsed = parse_events(&formatted).unwrap();
        assert_eq!(reparsed, events);
    }
}
