use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use lazy_static::lazy_static;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::bundle::BundleClient;
use crate::config::Config;
use crate::dat::{self, Schema};
use crate::error::ToolError;

/// Budget for one image conversion.
pub const IMAGE_CONVERT_TIMEOUT: Duration = Duration::from_secs(15);

lazy_static! {
    /// Named extraction patterns offered by the CLI and the backend.
    pub static ref PRESETS: FxHashMap<&'static str, &'static str> = [
        ("all", r".*"),
        ("data", r".*\.datc?64$"),
        ("textures", r".*\.dds$"),
        ("audio", r".*\.(ogg|wav)$"),
        ("ui", r"^art/2dart/.*"),
        ("items", r"^art/2ditems/.*"),
        ("skills", r"^art/2dart/skillicons/.*"),
        ("passives", r"^art/2dart/skillicons/passives/.*"),
    ]
    .into_iter()
    .collect();
}

pub fn preset_pattern(name: &str) -> Option<&'static str> {
    PRESETS.get(name).copied()
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub exclude_languages: bool,
    pub convert_images: bool,
    pub decode_tables: bool,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        PipelineOptions {
            exclude_languages: true,
            convert_images: true,
            decode_tables: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ConversionStats {
    pub converted: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ParseStats {
    pub parsed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineMetrics {
    pub extracted: u64,
    pub images: ConversionStats,
    pub data: ParseStats,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub enum PipelineEvent {
    Extracting { completed: u64, path: String },
    ConvertingImages { completed: u64, total: u64 },
    DecodingTables { completed: u64, total: u64 },
}

/// Pattern-matched extraction, then per-file post-processing. Stage
/// failures are counted, never fatal to the run.
pub fn run(
    config: &Config,
    pattern: &str,
    options: &PipelineOptions,
    on_event: Option<&(dyn Fn(PipelineEvent) + Sync)>,
) -> anyhow::Result<PipelineMetrics> {
    let started = Instant::now();
    let client = BundleClient::new(config.bundle_tool());

    let mut progress = |count: u64, path: &str| {
        if let Some(cb) = on_event {
            cb(PipelineEvent::Extracting {
                completed: count,
                path: path.to_string(),
            });
        }
    };
    let stats = client.extract_by_pattern(
        &config.archive_path(),
        &config.output_dir,
        pattern,
        options.exclude_languages,
        Some(&mut progress),
    )?;

    let (images, tables) = scan_outputs(&config.output_dir);
    info!(
        "extracted {} files ({} images, {} tables)",
        stats.extracted,
        images.len(),
        tables.len()
    );

    let image_stats = if options.convert_images {
        convert_images(config, &images, on_event)
    } else {
        ConversionStats::default()
    };

    let data_stats = if options.decode_tables {
        decode_tables(config, &tables, on_event)
    } else {
        ParseStats::default()
    };

    Ok(PipelineMetrics {
        extracted: stats.extracted,
        images: image_stats,
        data: data_stats,
        elapsed_ms: started.elapsed().as_millis() as u64,
    })
}

fn scan_outputs(dir: &Path) -> (Vec<PathBuf>, Vec<PathBuf>) {
    let mut images = Vec::new();
    let mut tables = Vec::new();
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        if has_extension(path, "dds") {
            images.push(path.to_path_buf());
        } else if dat::is_table_file(path) {
            tables.push(path.to_path_buf());
        }
    }
    images.sort();
    tables.sort();
    (images, tables)
}

fn convert_images(
    config: &Config,
    images: &[PathBuf],
    on_event: Option<&(dyn Fn(PipelineEvent) + Sync)>,
) -> ConversionStats {
    let tool = config.image_tool();
    let dds = &config.conversion.dds;
    let converted = AtomicU64::new(0);
    let failed = AtomicU64::new(0);
    let done = AtomicU64::new(0);
    let total = images.len() as u64;

    images.par_iter().for_each(|input| {
        let output = input.with_extension(dds.format.extension());
        match convert_dds(&tool, input, &output, dds.quality, IMAGE_CONVERT_TIMEOUT) {
            Ok(()) => {
                converted.fetch_add(1, Ordering::Relaxed);
                if !dds.preserve_originals {
                    std::fs::remove_file(input).ok();
                }
            }
            Err(e) => {
                warn!("converting {}: {e}", input.display());
                failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        let completed = done.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(cb) = on_event {
            cb(PipelineEvent::ConvertingImages { completed, total });
        }
    });

    ConversionStats {
        converted: converted.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
    }
}

fn decode_tables(
    config: &Config,
    tables: &[PathBuf],
    on_event: Option<&(dyn Fn(PipelineEvent) + Sync)>,
) -> ParseStats {
    if tables.is_empty() {
        return ParseStats::default();
    }

    let schema = match Schema::load(&config.schema_path) {
        Ok(s) => s,
        Err(e) => {
            warn!("schema unavailable, leaving {} tables binary: {e:#}", tables.len());
            return ParseStats {
                parsed: 0,
                failed: tables.len() as u64,
            };
        }
    };

    let parsed = AtomicU64::new(0);
    let failed = AtomicU64::new(0);
    let done = AtomicU64::new(0);
    let total = tables.len() as u64;

    tables.par_iter().for_each(|input| {
        match decode_one(&schema, input) {
            Ok(true) => {
                parsed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => {} // no schema entry; not this product's table
            Err(e) => {
                warn!("decoding {}: {e:#}", input.display());
                failed.fetch_add(1, Ordering::Relaxed);
            }
        }
        let completed = done.fetch_add(1, Ordering::Relaxed) + 1;
        if let Some(cb) = on_event {
            cb(PipelineEvent::DecodingTables { completed, total });
        }
    });

    ParseStats {
        parsed: parsed.load(Ordering::Relaxed),
        failed: failed.load(Ordering::Relaxed),
    }
}

/// Decodes one table next to its source and removes the binary on
/// success. `Ok(false)` means the schema has no entry for it.
fn decode_one(schema: &Schema, input: &Path) -> anyhow::Result<bool> {
    let Some(table) = dat::table_name_from_path(input) else {
        return Ok(false);
    };
    if schema.table(&table).is_none() {
        return Ok(false);
    }

    let outcome = dat::decode_file(schema, input)?;
    if let Some(error) = &outcome.error {
        anyhow::bail!("{error}");
    }
    if let Some(warning) = &outcome.warning {
        warn!("{}: {warning}", input.display());
    }

    dat::write_rows_json(&outcome, &input.with_extension("json"))?;
    std::fs::remove_file(input)
        .with_context(|| format!("removing {}", input.display()))?;
    Ok(true)
}

/// Runs the external image converter with a hard deadline.
pub fn convert_dds(
    tool: &Path,
    input: &Path,
    output: &Path,
    quality: u32,
    timeout: Duration,
) -> Result<(), ToolError> {
    let mut child = Command::new(tool)
        .arg(input)
        .arg("-quality")
        .arg(quality.to_string())
        .arg(output)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    let stderr = child.stderr.take();
    let stderr_thread = stderr.map(|s| {
        thread::spawn(move || {
            let mut buf = String::new();
            std::io::Read::read_to_string(&mut std::io::BufReader::new(s), &mut buf).ok();
            buf
        })
    });

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None => {
                if Instant::now() >= deadline {
                    child.kill().ok();
                    child.wait().ok();
                    return Err(ToolError::Timeout(
                        timeout,
                        format!("converting {}", input.display()),
                    ));
                }
                thread::sleep(Duration::from_millis(25));
            }
        }
    };

    if !status.success() {
        let stderr_text = stderr_thread
            .and_then(|t| t.join().ok())
            .unwrap_or_default();
        return Err(ToolError::ExternalTool(format!(
            "{} exited with {status}: {}",
            tool.display(),
            stderr_text.trim()
        )));
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct CleanupStats {
    pub removed_images: u64,
    pub removed_tables: u64,
}

/// Deletes binaries whose converted sibling already exists: `.dds` next
/// to a `.webp`, table files next to a `.json`.
pub fn cleanup_dir(dir: &Path) -> anyhow::Result<CleanupStats> {
    let mut stats = CleanupStats::default();
    for entry in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        let path = entry.path();
        if !entry.file_type().is_file() {
            continue;
        }
        if has_extension(path, "dds") && path.with_extension("webp").exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("removing {}", path.display()))?;
            stats.removed_images += 1;
        } else if dat::is_table_file(path) && path.with_extension("json").exists() {
            std::fs::remove_file(path)
                .with_context(|| format!("removing {}", path.display()))?;
            stats.removed_tables += 1;
        }
    }
    Ok(stats)
}

fn has_extension(path: &Path, wanted: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case(wanted))
        .unwrap_or(false)
}
