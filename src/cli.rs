//! CLI argument parsing and driver
//!
//! One binary covers the common workflows over a recorded trace: grep events
//! by kind/stack/goroutine/time, list the regions the built-in recipes find,
//! dump causal span trees and their summaries, and dump per-goroutine
//! state-machine edges. Graph rendering and profile encoding live in
//! downstream tooling.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing::info;

use crate::cluster;
use crate::data::Data;
use crate::event::GoState;
use crate::exectext;
use crate::filter::EventFilter;
use crate::patterns;
use crate::states::GoroutineStates;

/// Output format for analysis results.
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text (default)
    Text,
    /// JSON for machine parsing
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "tejedor")]
#[command(version)]
#[command(about = "Execution trace analyzer that reconstructs cross-goroutine causality", long_about = None)]
pub struct Cli {
    /// Path to a text-format execution trace
    #[arg(long, value_name = "PATH")]
    pub input: PathBuf,

    /// Print events matching an expression like 'Any "**"'
    #[arg(long = "match", value_name = "EXPR", value_parser = parse_filter)]
    pub matcher: Option<EventFilter>,

    /// Restrict matched events to a single goroutine
    #[arg(long, value_name = "G")]
    pub goroutine: Option<u64>,

    /// Restrict matched events to a specific timestamp
    #[arg(long, value_name = "NS")]
    pub time: Option<i64>,

    /// Show full stacks of matched events
    #[arg(long)]
    pub stacks: bool,

    /// Print the regions found by the built-in recipes
    #[arg(long = "show-regions")]
    pub show_regions: bool,

    /// Print causal span trees
    #[arg(long)]
    pub spans: bool,

    /// Print a summary per span tree
    #[arg(long)]
    pub summarize: bool,

    /// Print per-goroutine state-machine edges
    #[arg(long)]
    pub states: bool,

    /// Output format for regions, spans, summaries, and states
    #[arg(long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

fn parse_filter(s: &str) -> std::result::Result<EventFilter, String> {
    s.parse::<EventFilter>().map_err(|err| err.to_string())
}

pub fn run(cli: &Cli) -> Result<()> {
    let text = fs::read_to_string(&cli.input)
        .with_context(|| format!("read {}", cli.input.display()))?;
    let events = exectext::parse_events(&text).context("parse trace")?;
    let data = Data::new(events).context("index trace")?;
    info!(
        events = data.len(),
        goroutines = data.goroutines().len(),
        "loaded trace"
    );

    if let Some(filter) = &cli.matcher {
        grep_events(cli, &data, filter);
    }
    if cli.show_regions {
        show_regions(cli, &data)?;
    }
    if cli.spans || cli.summarize {
        show_spans(cli, &data)?;
    }
    if cli.states {
        show_states(cli, &data)?;
    }

    Ok(())
}

fn grep_events(cli: &Cli, data: &Data, filter: &EventFilter) {
    for id in 0..data.len() {
        let ev = data.event(id);
        if let Some(g) = cli.goroutine {
            if ev.g != g {
                continue;
            }
        }
        if let Some(ts) = cli.time {
            if ev.ts != ts {
                continue;
            }
        }
        if !filter.event_matches(ev) {
            continue;
        }
        print!("{}", exectext::format_event(data.events(), id, cli.stacks));
    }
}

#[derive(Debug, Serialize)]
struct RegionLine {
    g: u64,
    kind: String,
    start_ns: i64,
    end_ns: i64,
}

fn show_regions(cli: &Cli, data: &Data) -> Result<()> {
    let regions = patterns::find_all(data, patterns::track_all);
    let mut lines: Vec<RegionLine> = regions
        .iter()
        .map(|region| {
            let first = *region.events.first().expect("regions hold events");
            let last = *region.events.last().expect("regions hold events");
            RegionLine {
                g: data.event(first).g,
                kind: region.kind.clone(),
                start_ns: data.event(first).ts,
                end_ns: data.event(last).ts,
            }
        })
        .collect();
    lines.sort_by_key(|line| (line.start_ns, line.g));

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&lines)?),
        OutputFormat::Text => {
            for line in lines {
                println!(
                    "g {} kind {:?} start {} end {} dur {}ns",
                    line.g,
                    line.kind,
                    line.start_ns,
                    line.end_ns,
                    line.end_ns - line.start_ns,
                );
            }
        }
    }
    Ok(())
}

fn show_spans(cli: &Cli, data: &Data) -> Result<()> {
    let spans = cluster::extract_spans(data, patterns::track_all);

    if cli.summarize {
        let summaries: Vec<_> = spans.iter().map(cluster::summarize).collect();
        match cli.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summaries)?),
            OutputFormat::Text => {
                for summary in &summaries {
                    println!(
                        "root g {} kind {:?} length {}ns run {}ns flat-run {}ns",
                        summary.root.g,
                        summary.root.kind,
                        summary.length_ns,
                        summary.total_run_ns,
                        summary.flat_run_ns,
                    );
                    let mut reasons: Vec<_> = summary.flat_wait_ns.iter().collect();
                    reasons.sort_by_key(|(reason, _)| reason.clone());
                    for (reason, ns) in reasons {
                        println!("  wait {reason:?} {ns}ns");
                    }
                }
            }
        }
    } else {
        match cli.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&spans)?),
            OutputFormat::Text => {
                for span in &spans {
                    print_span_tree(span, 0);
                }
            }
        }
    }
    Ok(())
}

fn print_span_tree(span: &cluster::Span, depth: usize) {
    println!(
        "{:indent$}g {} kind {:?} start {} length {}ns",
        "",
        span.g,
        span.kind,
        span.start_ns,
        span.length_ns,
        indent = depth * 2,
    );
    for child in &span.caused {
        print_span_tree(child, depth + 1);
    }
}

#[derive(Debug, Serialize)]
struct EdgeLine {
    g: u64,
    from_state: GoState,
    from_stack: String,
    to_state: GoState,
    to_stack: String,
    count: u64,
}

fn show_states(cli: &Cli, data: &Data) -> Result<()> {
    let mut states = GoroutineStates::new();
    states.process(data);

    let mut goroutines: Vec<u64> = states.goroutines().keys().copied().collect();
    goroutines.sort_unstable();

    let mut lines: Vec<EdgeLine> = Vec::new();
    for g in goroutines {
        let behaviors = &states.goroutines()[&g];
        let mut edges: Vec<_> = behaviors.simple_edges().into_iter().collect();
        edges.sort_by(|a, b| b.1.cmp(&a.1));
        for (edge, count) in edges {
            lines.push(EdgeLine {
                g,
                from_state: edge.from.state,
                from_stack: states.stacks().format_short(edge.from.stack),
                to_state: edge.to.state,
                to_stack: states.stacks().format_short(edge.to.stack),
                count,
            });
        }
    }

    match cli.format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&lines)?),
        OutputFormat::Text => {
            for line in &lines {
                println!(
                    "g {} {} [{}] -> {} [{}] x{}",
                    line.g,
                    line.from_state,
                    line.from_stack.replace('\n', " "),
                    line.to_state,
                    line.to_stack.replace('\n', " "),
                    line.count,
                );
            }
        }
    }
    Ok(())
}
