use std::path::PathBuf;

use clap::Parser;
use poe2_ggpk::dat::batch::{self, BatchOptions, BatchProgress};
use poe2_ggpk::dat::{self, Schema};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// A .datc64 file or a directory of them
    input: PathBuf,

    /// Output directory (default: alongside the input)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Schema file
    #[arg(short, long, default_value = "./schema.min.json")]
    schema: PathBuf,

    /// Only decode files whose name contains this
    #[arg(short, long)]
    filter: Option<String>,

    /// Decode at most this many tables
    #[arg(short, long)]
    limit: Option<usize>,

    /// Worker count (default: cpu count - 1)
    #[arg(short, long)]
    threads: Option<usize>,

    /// Re-decode even when the JSON output is up to date
    #[arg(long, default_value = "false")]
    no_cache: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    if args.input.is_file() {
        let schema = Schema::load(&args.schema)?;
        let outcome = dat::decode_file(&schema, &args.input)?;
        if let Some(error) = &outcome.error {
            anyhow::bail!("{}: {error}", args.input.display());
        }
        if let Some(warning) = &outcome.warning {
            eprintln!("warning: {warning}");
        }

        let output = args.output.unwrap_or_else(|| {
            args.input.parent().map(PathBuf::from).unwrap_or_default()
        });
        std::fs::create_dir_all(&output)?;
        let path = output.join(format!("{}.json", outcome.table_name));
        dat::write_rows_json(&outcome, &path)?;
        println!("{} rows -> {}", outcome.rows.len(), path.display());
        return Ok(());
    }

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| args.input.join("json"));
    let options = BatchOptions {
        filter: args.filter,
        limit: args.limit,
        concurrency: args.threads,
        use_cache: !args.no_cache,
    };

    let mut on_progress = |p: &BatchProgress| {
        let slow = p
            .slow
            .as_deref()
            .map(|f| format!(" SLOW: {f}"))
            .unwrap_or_default();
        eprint!("\r{}/{} tables{slow}    ", p.completed, p.total);
    };
    let summary = batch::decode_directory(
        &args.input,
        &output,
        &args.schema,
        &options,
        Some(&mut on_progress),
    )?;
    eprintln!();

    println!(
        "{} decoded ({} cached), {} skipped, {} failed in {:.1?}",
        summary.succeeded(),
        summary.cached(),
        summary.skipped(),
        summary.failed(),
        summary.elapsed
    );
    for result in summary.results.iter().filter(|r| r.error.is_some()) {
        eprintln!(
            "  {}: {}",
            result.file.display(),
            result.error.as_deref().unwrap_or("unknown")
        );
    }
    Ok(())
}
