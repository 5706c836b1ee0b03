//! Rendering of job outcomes for the command-line demo.

use comfy_table::{Cell, Color, ContentArrangement, Table, presets::UTF8_FULL};
use forkpool::metrics::MetricsSnapshot;
use owo_colors::{OwoColorize, Stream::Stdout};
use serde::Serialize;

use crate::cli::OutputFormat;

/// Outcome of one submitted job.
#[derive(Debug, Clone, Serialize)]
pub struct JobOutcome {
    pub index: usize,
    pub input: u64,
    #[serde(flatten)]
    pub result: Outcome,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Value(u64),
    Error(String),
}

#[derive(Serialize)]
struct Report<'a> {
    jobs: &'a [JobOutcome],
    metrics: &'a MetricsSnapshot,
}

/// Print outcomes followed by the metrics summary.
pub fn print(format: OutputFormat, outcomes: &[JobOutcome], metrics: &MetricsSnapshot) {
    match format {
        OutputFormat::Table => print_table(outcomes, metrics),
        OutputFormat::Plain => print_plain(outcomes, metrics),
        OutputFormat::Json => print_json(outcomes, metrics),
    }
}

fn print_table(outcomes: &[JobOutcome], metrics: &MetricsSnapshot) {
    if outcomes.is_empty() {
        println!("No jobs submitted.");
    } else {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["Job", "Input", "Outcome"]);

        for outcome in outcomes {
            let result = match &outcome.result {
                Outcome::Value(value) => Cell::new(value).fg(Color::Green),
                Outcome::Error(error) => Cell::new(error).fg(Color::Red),
            };
            table.add_row(vec![
                Cell::new(outcome.index),
                Cell::new(outcome.input).fg(Color::Cyan),
                result,
            ]);
        }
        println!("{table}");
    }

    println!(
        "{} {} succeeded, {} failed, avg wall {:?}, total cpu {:?}, peak rss {} KiB",
        "Metrics:".if_supports_color(Stdout, |t| t.bold()),
        metrics.jobs_succeeded,
        metrics.jobs_failed,
        metrics.average_wall(),
        metrics.total_cpu,
        metrics.peak_rss_kib,
    );
}

fn print_plain(outcomes: &[JobOutcome], metrics: &MetricsSnapshot) {
    for outcome in outcomes {
        match &outcome.result {
            Outcome::Value(value) => println!("{}\t{}\tok\t{}", outcome.index, outcome.input, value),
            Outcome::Error(error) => {
                println!("{}\t{}\terror\t{}", outcome.index, outcome.input, error)
            }
        }
    }
    println!(
        "succeeded={}\tfailed={}\tpeak_rss_kib={}",
        metrics.jobs_succeeded, metrics.jobs_failed, metrics.peak_rss_kib
    );
}

fn print_json(outcomes: &[JobOutcome], metrics: &MetricsSnapshot) {
    let report = Report {
        jobs: outcomes,
        metrics,
    };
    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("Failed to serialize report: {}", e),
    }
}
