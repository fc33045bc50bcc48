//! `coatseq`: operator CLI for the coating sequencer.
//!
//! ```bash
//! coatseq check
//! coatseq list
//! coatseq run stop_feeder
//! ```
//!
//! `run` drives the simulated stage through a polled tag store refreshed at
//! `tag_poll_interval`; Ctrl-C stops the run.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use coating_sequencer::documents::FileDocumentStore;
use coating_sequencer::tags::{PolledTagStore, SimulatedTagStore};
use coating_sequencer::{
    config::DEFAULT_SETTINGS_PATH, load_definitions, logging, Definitions, EngineSettings,
    RunStatus, SequenceRunner,
};

#[derive(Parser)]
#[command(name = "coatseq", about = "Coating process sequencer", version)]
struct Cli {
    /// Settings file.
    #[arg(long, default_value = DEFAULT_SETTINGS_PATH)]
    settings: PathBuf,

    /// Definition document, overriding the settings file.
    #[arg(long)]
    definitions: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load settings and definitions and report the first problem found.
    Check,

    /// List sequences and action groups.
    List,

    /// Run one sequence against the simulated stage.
    Run {
        /// Sequence id.
        sequence: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut settings = EngineSettings::load_from(&cli.settings)
        .with_context(|| format!("loading settings from {}", cli.settings.display()))?;
    if let Some(path) = cli.definitions {
        settings.definitions_path = path;
    }
    logging::init_tracing(&settings)?;

    let defs = load_definitions(&settings.definitions_path).with_context(|| {
        format!(
            "loading definitions from {}",
            settings.definitions_path.display()
        )
    })?;

    match cli.command {
        Command::Check => {
            println!(
                "OK: {} sequences, {} action groups, {} state rules",
                defs.sequences.len(),
                defs.groups.len(),
                defs.rules.len()
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::List => {
            print_listing(&defs);
            Ok(ExitCode::SUCCESS)
        }
        Command::Run { sequence } => run_sequence(defs, &settings, &sequence).await,
    }
}

fn print_listing(defs: &Definitions) {
    let mut sequences: Vec<_> = defs.sequences.values().collect();
    sequences.sort_by(|a, b| a.id.cmp(&b.id));
    println!("Sequences:");
    for seq in sequences {
        println!("  {:<24} {}", seq.id, seq.description);
        println!("  {:<24} groups: {}", "", seq.action_groups.join(", "));
    }

    let mut groups: Vec<_> = defs.groups.values().collect();
    groups.sort_by(|a, b| a.name.cmp(&b.name));
    println!("\nAction groups:");
    for group in groups {
        println!("  {:<24} {}", group.name, group.description);
    }
}

async fn run_sequence(defs: Definitions, settings: &EngineSettings, sequence: &str) -> Result<ExitCode> {
    let stage = Arc::new(SimulatedTagStore::with_standard_physics(Arc::clone(
        &defs.tags,
    )));
    let tags = Arc::new(PolledTagStore::spawn(
        stage,
        Arc::clone(&defs.tags),
        settings.tag_poll_interval,
    ));
    let documents = Arc::new(FileDocumentStore::new(&settings.documents_dir));
    let runner = SequenceRunner::new(Arc::new(defs), tags.clone(), documents, settings);

    let run_uid = runner.start(sequence).await?;
    info!(sequence, %run_uid, "run started, Ctrl-C to stop");

    let finished = tokio::select! {
        finished = runner.wait(sequence) => finished,
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for Ctrl-C")?;
            warn!(sequence, "stop requested from terminal");
            runner.stop(sequence).await?;
            runner.wait(sequence).await
        }
    };
    tags.shutdown().await;
    let finished = finished?;

    println!("{}", serde_json::to_string_pretty(&finished)?);
    Ok(match finished.status {
        RunStatus::Completed => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}
