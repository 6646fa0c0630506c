use std::io;

use anyhow::{Context, Result};
use ascii_table::AsciiTable;
use clap::Parser;
use dbload::config::prompt_row_count;
use dbload::{backend, Config, StageResult, StageRunner};
use env_logger::Env;
use log::info;
use num_format::{Locale, ToFormattedString};

fn create_ascii_table() -> AsciiTable {
    /// Reported metrics (per stage) for the run.
    const RESULT_COLUMNS: [&str; 5] = ["Stage", "Rows", "Elapsed", "Mean latency", "Rows/s"];

    let mut ascii_table = AsciiTable::default();
    ascii_table.set_max_width(120);

    for (idx, column_name) in RESULT_COLUMNS.into_iter().enumerate() {
        ascii_table.column(idx).set_header(column_name);
    }

    ascii_table
}

fn summary_row(result: &StageResult) -> Vec<String> {
    vec![
        result.stage.to_string(),
        result.rows.to_formatted_string(&Locale::en),
        format!("{:#.3?}", result.elapsed),
        result
            .mean_latency_ms
            .map(|mean| format!("{mean:.3} ms"))
            .unwrap_or_else(|| "-".to_string()),
        (result.rows_per_second() as u64).to_formatted_string(&Locale::en),
    ]
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let mut config = Config::parse();

    if config.rows.is_none() && !config.large_preset {
        config.rows = Some(prompt_row_count(io::stdin().lock(), io::stdout())?);
    }
    let run_config = config.run_config()?;

    let store = backend::open(&config.backend)
        .with_context(|| format!("failed to open the {} backend", config.backend.backend))?;
    info!(
        "Loading {} with {} workers",
        store.name(),
        run_config.workers
    );

    let runner = StageRunner::new(store.as_ref(), run_config);
    let results = runner.run()?;

    create_ascii_table().print(results.iter().map(summary_row));
    Ok(())
}
