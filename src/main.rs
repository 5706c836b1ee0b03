//! forkpool - fork-based worker pool demo

mod cli;
mod demo;
mod output;

use anyhow::Result;
use clap::{Parser, ValueEnum};
use forkpool::dispatch::run_ordered;
use forkpool::logging::{self, LogConfig};
use forkpool::metrics;
use forkpool::worker::{JobRegistry, WorkerContext, WorkerPoolConfig, make};
use owo_colors::{OwoColorize, Stream::Stderr};
use tracing::debug;

use cli::{Cli, Commands, DemoJob, RunArgs};
use demo::DemoJobs;
use output::{JobOutcome, Outcome};

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }
    logging::init(LogConfig::from_verbosity(cli.verbose).with_env_overrides());

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(args),
        Commands::Jobs => {
            cmd_jobs();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Fork a pool, run `args.count` jobs through it and print the outcomes.
fn cmd_run(args: &RunArgs) -> Result<()> {
    let mut registry = JobRegistry::new();
    let jobs = DemoJobs::register(&mut registry);

    let config = match args.workers {
        Some(count) => WorkerPoolConfig::default().with_worker_count(count),
        None => WorkerPoolConfig::default().with_env_overrides(),
    };

    let workers = make(
        &config,
        &registry,
        |context: &WorkerContext<'_, ()>| {
            debug!(worker_id = context.worker_id, "Worker ready");
            Ok(())
        },
        &(),
    )?;

    let kind = jobs.kind(args.job);
    let results = run_ordered(&workers, (0..args.count).map(|input| kind.job(input)));
    for worker in &workers {
        worker.kill();
    }

    let outcomes: Vec<JobOutcome> = results?
        .into_iter()
        .enumerate()
        .map(|(index, result)| JobOutcome {
            index,
            input: index as u64,
            result: match result {
                Ok(value) => Outcome::Value(value),
                Err(e) => Outcome::Error(e.to_string()),
            },
        })
        .collect();

    output::print(args.format, &outcomes, &metrics::global().snapshot());
    Ok(())
}

fn cmd_jobs() {
    for job in DemoJob::value_variants() {
        if let Some(name) = job.to_possible_value() {
            println!("{:<8} {}", name.get_name(), demo::describe(*job));
        }
    }
}
