use std::path::PathBuf;

use clap::Parser;
use poe2_ggpk::pipeline::{self, PipelineEvent, PipelineOptions};
use poe2_ggpk::Config;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Extraction pattern (regex over logical paths)
    pattern: Option<String>,

    /// Use a named preset instead of a pattern
    #[arg(short = 'P', long, conflicts_with = "pattern")]
    preset: Option<String>,

    /// Config file
    #[arg(short, long, default_value = "./config.json")]
    config: PathBuf,

    /// Keep localised duplicates
    #[arg(long, default_value = "false")]
    include_languages: bool,

    /// Leave DDS files unconverted
    #[arg(long, default_value = "false")]
    skip_images: bool,

    /// Leave table files binary
    #[arg(long, default_value = "false")]
    skip_tables: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let config = Config::load(&args.config)?;
    let pattern = match (&args.pattern, &args.preset) {
        (Some(p), _) => p.clone(),
        (None, Some(preset)) => pipeline::preset_pattern(preset)
            .ok_or_else(|| anyhow::anyhow!("unknown preset '{preset}'"))?
            .to_string(),
        (None, None) => anyhow::bail!("either a pattern or --preset is required"),
    };

    let progress = parking_lot::Mutex::new(pbr::ProgressBar::new(0));
    progress.lock().show_speed = false;
    let on_event = |event: PipelineEvent| {
        let mut bar = progress.lock();
        match event {
            PipelineEvent::Extracting { completed, path } => {
                bar.message(&format!("extract {path} "));
                bar.total = completed.max(bar.total);
                bar.set(completed);
            }
            PipelineEvent::ConvertingImages { completed, total } => {
                bar.message("convert ");
                bar.total = total;
                bar.set(completed);
            }
            PipelineEvent::DecodingTables { completed, total } => {
                bar.message("decode ");
                bar.total = total;
                bar.set(completed);
            }
        }
    };

    let options = PipelineOptions {
        exclude_languages: !args.include_languages,
        convert_images: !args.skip_images,
        decode_tables: !args.skip_tables,
    };
    let metrics = pipeline::run(&config, &pattern, &options, Some(&on_event))?;
    progress.lock().finish();

    println!(
        "\n{} extracted, {} images converted ({} failed), {} tables parsed ({} failed) in {} ms",
        metrics.extracted,
        metrics.images.converted,
        metrics.images.failed,
        metrics.data.parsed,
        metrics.data.failed,
        metrics.elapsed_ms
    );
    Ok(())
}
