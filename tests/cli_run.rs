//! Driver smoke tests: the CLI loads a text trace and runs every analysis
//! without error, and rejects malformed input with context.

use std::io::Write as _;

use tejedor::cli::{Cli, OutputFormat};
use tempfile::NamedTempFile;

const CLIENT: &str = include_str!("fixtures/http_client.txt");

fn write_trace(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp trace");
    file.write_all(text.as_bytes()).expect("write temp trace");
    file
}

fn cli_for(file: &NamedTempFile) -> Cli {
    Cli {
        input: file.path().to_path_buf(),
        matcher: None,
        goroutine: None,
        time: None,
        stacks: false,
        show_regions: false,
        spans: false,
        summarize: false,
        states: false,
        format: OutputFormat::Json,
    }
}

#[test]
fn test_run_all_analyses() {
    let file = write_trace(CLIENT);

    let mut cli = cli_for(&file);
    cli.matcher = Some(r#"Any "**""#.parse().expect("filter parses"));
    cli.show_regions = true;
    cli.spans = true;
    cli.states = true;
    tejedor::cli::run(&cli).expect("analyses succeed");

    let mut cli = cli_for(&file);
    cli.summarize = true;
    cli.format = OutputFormat::Text;
    tejedor::cli::run(&cli).expect("summaries succeed");
}

#[test]
fn test_run_rejects_malformed_trace() {
    let file = write_trace("12 Bogus p=0 g=1\n");
    let err = tejedor::cli::run(&cli_for(&file)).unwrap_err();
    assert!(err.to_string().contains("parse trace"));
}

#[test]
fn test_run_rejects_missing_file() {
    let mut cli = cli_for(&write_trace(""));
    cli.input = std::path::PathBuf::from("/nonexistent/trace.txt");
    assert!(tejedor::cli::run(&cli).is_err());
}
