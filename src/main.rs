use clap::{Parser, ValueEnum};
use sfi::{
    Delimiters, Expander, Result, SfiError, Source, TemplateConfig, WriteSink, find_directives,
    read_source,
};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

const LONG_HELP: &str = r#"
Syntax:
  {{file.txt}}   - Replaced by the expansion of file.txt (recursively)
  \{ and \}      - Literal { and }, e.g. \{{ never opens a directive

Names are used verbatim (no trimming) and resolved against the working
directory, or --base-dir when given. An empty directive {{}} reads stdin.

Examples:
  # Expand a document
  sfi page.txt
  # Expand standard input
  echo 'Header: {{header.txt}}' | sfi
  # Use different delimiters
  sfi page.txt --open '<%' --close '%>'
  # Stop runaway self-imports
  sfi page.txt --max-depth 32
  # List directives of the top-level document as JSON
  sfi page.txt --list=json
"#;

/// Simple file importer: recursively inline {{file}} directives.
#[derive(Parser, Debug)]
#[command(
    name = "sfi",
    version,
    about = "Simple file importer: recursively inline {{file}} directives.",
    after_long_help = LONG_HELP
)]
struct Cli {
    /// Document to expand. Reads stdin when absent or '-'.
    #[arg(value_name = "FILE")]
    input: Option<PathBuf>,

    /// Output file (defaults to stdout)
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Base directory for resolving imported file names
    #[arg(short, long, value_name = "DIR", env = "SFI_BASE_DIR")]
    base_dir: Option<PathBuf>,

    /// Token opening a directive
    #[arg(long, value_name = "TOKEN", env = "SFI_OPEN", default_value = "{{")]
    open: String,

    /// Token closing a directive
    #[arg(long, value_name = "TOKEN", env = "SFI_CLOSE", default_value = "}}")]
    close: String,

    /// Maximum import nesting depth (unbounded by default)
    #[arg(short = 'd', long, value_name = "DEPTH")]
    max_depth: Option<usize>,

    /// List directives of the input instead of expanding (optionally with format: plain, json)
    #[arg(long, value_name = "FORMAT", num_args = 0..=1, default_missing_value = "plain")]
    list: Option<ListFormat>,

    /// Increase verbosity (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq)]
enum ListFormat {
    /// One directive name per line
    Plain,
    /// JSON output for scripting
    Json,
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli);

    if let Err(e) = run(&cli) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn init_logging(cli: &Cli) {
    let level = match (cli.quiet, cli.verbose) {
        (true, _) => LevelFilter::ERROR,
        (false, 0) => LevelFilter::WARN,
        (false, 1) => LevelFilter::INFO,
        (false, 2) => LevelFilter::DEBUG,
        (false, _) => LevelFilter::TRACE,
    };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: &Cli) -> Result<()> {
    let config = TemplateConfig {
        delimiters: Delimiters::new(cli.open.as_str(), cli.close.as_str())?,
        base_dir: cli.base_dir.clone(),
        max_depth: cli.max_depth,
        ..TemplateConfig::default()
    };
    let source = Source::from_name(cli.input.as_deref());

    if let Some(format) = cli.list {
        return list_directives(&source, format, &config);
    }

    let writer: Box<dyn Write> = match &cli.output {
        Some(path) => {
            info!("Writing output to {}", path.display());
            let file = File::create(path).map_err(|e| SfiError::Open {
                path: path.clone(),
                source: e,
            })?;
            Box::new(file)
        }
        None => Box::new(io::stdout().lock()),
    };

    let mut sink = WriteSink::new(BufWriter::new(writer));
    let result = Expander::new(config).expand_source(&source, &mut sink);
    // whatever was expanded before a failure still reaches the output
    let flushed = sink.flush();
    result?;
    flushed?;

    info!("Expansion of {source} complete");
    Ok(())
}

fn list_directives(source: &Source, format: ListFormat, config: &TemplateConfig) -> Result<()> {
    let buffer = read_source(source)?;
    let directives = find_directives(buffer.as_bytes(), &config.delimiters);
    info!("{} directives found in {source}", directives.len());

    match format {
        ListFormat::Plain => {
            for directive in &directives {
                println!("{}", directive.name);
            }
        }
        ListFormat::Json => {
            let json = serde_json::to_string_pretty(&directives)?;
            println!("{json}");
        }
    }

    Ok(())
}
