use std::fs;
use std::path::PathBuf;

use clap::Parser;
use flexi_logger::Logger;
use log::info;
use serde::{Deserialize, Serialize};

use sdcore::cluster::region::Candidates;
use sdmask::{InMemoryTable, MaskLine, MaskLineConfig, MaskLineResult};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Parser, Debug)]
#[command(name = "sdmask")]
#[command(about = "Validate spectral-line candidates of a single-dish map and write per-sample line masks")]
#[command(version)]
struct Cli {
    /// Job description (JSON): `config`, `candidates` and an optional prior `table`.
    job: PathBuf,

    /// Where to write the result (JSON); stdout when omitted.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Log level or flexi_logger filter, e.g. `debug` or `info, sdcore=debug`.
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Pretty-print the JSON output.
    #[arg(long)]
    pretty: bool,
}

#[derive(Deserialize)]
struct Job {
    #[serde(default)]
    config: MaskLineConfig,
    #[serde(default)]
    candidates: Candidates,
    /// Masks from the previous iteration, for NOCHANGE bookkeeping.
    #[serde(default)]
    table: InMemoryTable,
}

#[derive(Serialize)]
struct Output<'a> {
    result: &'a MaskLineResult,
    table: &'a InMemoryTable,
}

fn main() -> CliResult<()> {
    let cli = Cli::parse();
    let _logger = Logger::try_with_str(&cli.log_level)?.start()?;

    let text = fs::read_to_string(&cli.job)?;
    let mut job: Job = serde_json::from_str(&text)?;
    info!(
        "job {}: {} sample(s), iteration {}",
        cli.job.display(),
        job.candidates.len(),
        job.config.iteration
    );

    let result = MaskLine::new(&job.config).run(&job.candidates, &mut job.table)?;
    info!("{:?}: {} cluster(s), {} mask(s) rewritten", result.source, result.ncluster, result.changed);

    let output = Output { result: &result, table: &job.table };
    let json = if cli.pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    match cli.out {
        Some(path) => fs::write(path, json)?,
        None => println!("{}", json),
    }
    Ok(())
}
