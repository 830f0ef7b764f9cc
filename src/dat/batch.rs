use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use serde::Serialize;
use tracing::{info, warn};

use super::{table_name_from_path, Schema};

/// Inputs above this are skipped rather than decoded.
pub const MAX_INPUT_SIZE: u64 = 100 * 1024 * 1024;

/// How long the completed count may sit still before the in-flight file
/// is flagged as slow.
const STALL_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Case-insensitive substring filter on file names.
    pub filter: Option<String>,
    pub limit: Option<usize>,
    pub concurrency: Option<usize>,
    pub use_cache: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        BatchOptions {
            filter: None,
            limit: None,
            concurrency: None,
            use_cache: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub file: PathBuf,
    pub table: String,
    pub success: bool,
    pub cached: bool,
    pub rows: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug)]
pub struct BatchSummary {
    pub results: Vec<TaskResult>,
    pub elapsed: Duration,
}

impl BatchSummary {
    pub fn succeeded(&self) -> usize {
        self.results.iter().filter(|r| r.success).count()
    }

    pub fn cached(&self) -> usize {
        self.results.iter().filter(|r| r.cached).count()
    }

    pub fn skipped(&self) -> usize {
        self.results.iter().filter(|r| r.skipped.is_some()).count()
    }

    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| !r.success && r.skipped.is_none())
            .count()
    }
}

#[derive(Debug, Clone)]
pub struct BatchProgress {
    pub completed: usize,
    pub total: usize,
    /// Tables currently being decoded, one per busy worker.
    pub in_flight: Vec<String>,
    /// File whose decode has not advanced the completed count for a
    /// while.
    pub slow: Option<String>,
}

#[derive(Debug, Clone)]
struct Task {
    input: PathBuf,
    output: PathBuf,
    table: String,
}

enum WorkerRequest {
    Init { schema_path: PathBuf },
    Batch { tasks: Vec<Task>, check_cache: bool },
}

enum WorkerEvent {
    Ready {
        worker: usize,
    },
    /// Sent once when a task starts (with its table) and once when it
    /// finishes (without).
    Progress {
        worker: usize,
        completed: usize,
        current: Option<String>,
    },
    BatchResult {
        worker: usize,
        results: Vec<TaskResult>,
    },
    Failed {
        worker: usize,
        error: String,
    },
}

/// Decodes every recognised table file in `input_dir` into
/// `<output_dir>/<table>.json` across a pool of worker threads.
pub fn decode_directory(
    input_dir: &Path,
    output_dir: &Path,
    schema_path: &Path,
    options: &BatchOptions,
    mut on_progress: Option<&mut dyn FnMut(&BatchProgress)>,
) -> anyhow::Result<BatchSummary> {
    let started = Instant::now();
    let tasks = collect_tasks(input_dir, output_dir, options)?;
    let total = tasks.len();
    if tasks.is_empty() {
        return Ok(BatchSummary {
            results: Vec::new(),
            elapsed: started.elapsed(),
        });
    }

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;

    let concurrency = options.concurrency.unwrap_or_else(default_concurrency);
    let batches = concurrency.max(1).min(tasks.len());
    let chunk_size = (tasks.len() + batches - 1) / batches;

    info!(
        "decoding {} tables across {batches} workers ({chunk_size} per batch)",
        tasks.len()
    );

    let (event_tx, event_rx) = mpsc::channel::<WorkerEvent>();
    let mut request_txs = Vec::with_capacity(batches);
    let mut handles = Vec::with_capacity(batches);

    for worker in 0..batches {
        let (req_tx, req_rx) = mpsc::channel::<WorkerRequest>();
        let events = event_tx.clone();
        handles.push(
            thread::Builder::new()
                .name(format!("dat-worker-{worker}"))
                .spawn(move || worker_main(worker, req_rx, events))
                .context("spawning decode worker")?,
        );
        request_txs.push(req_tx);
    }
    drop(event_tx);

    // Workers load the schema on their own before any task is handed
    // out.
    for tx in &request_txs {
        let _ = tx.send(WorkerRequest::Init {
            schema_path: schema_path.to_path_buf(),
        });
    }
    let mut ready = 0;
    while ready < batches {
        match event_rx.recv().context("worker pool died during init")? {
            WorkerEvent::Ready { .. } => ready += 1,
            WorkerEvent::Failed { worker, error } => {
                bail!("worker {worker} failed to initialise: {error}")
            }
            _ => {}
        }
    }

    // Ceiling division can leave trailing workers without a batch; they
    // just exit when their request channel drops.
    let chunks: Vec<Vec<Task>> = tasks.chunks(chunk_size).map(|c| c.to_vec()).collect();
    let dispatched = chunks.len();
    for (tx, chunk) in request_txs.iter().zip(chunks) {
        let _ = tx.send(WorkerRequest::Batch {
            tasks: chunk,
            check_cache: options.use_cache,
        });
    }
    drop(request_txs);

    let mut results: Vec<TaskResult> = Vec::with_capacity(total);
    let mut per_worker_completed = vec![0usize; batches];
    let mut in_flight: Vec<Option<(String, Instant)>> = vec![None; batches];
    let mut finished = 0;
    let mut last_advance = Instant::now();
    let mut worker_error: Option<String> = None;

    while finished < dispatched {
        let event = match event_rx.recv_timeout(Duration::from_millis(250)) {
            Ok(e) => e,
            Err(RecvTimeoutError::Timeout) => {
                emit_progress(
                    &mut on_progress,
                    &per_worker_completed,
                    total,
                    &in_flight,
                    last_advance,
                );
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => {
                worker_error.get_or_insert_with(|| "worker pool died".to_string());
                break;
            }
        };

        match event {
            WorkerEvent::Progress {
                worker,
                completed,
                current,
            } => {
                if completed > per_worker_completed[worker] {
                    per_worker_completed[worker] = completed;
                    last_advance = Instant::now();
                }
                in_flight[worker] = current.map(|t| (t, Instant::now()));
                emit_progress(
                    &mut on_progress,
                    &per_worker_completed,
                    total,
                    &in_flight,
                    last_advance,
                );
            }
            WorkerEvent::BatchResult {
                worker,
                results: mut batch,
            } => {
                in_flight[worker] = None;
                results.append(&mut batch);
                finished += 1;
            }
            WorkerEvent::Failed { worker, error } => {
                in_flight[worker] = None;
                worker_error.get_or_insert(format!("worker {worker}: {error}"));
                finished += 1;
            }
            WorkerEvent::Ready { .. } => {}
        }
    }

    for handle in handles {
        if handle.join().is_err() {
            worker_error.get_or_insert_with(|| "worker thread panicked".to_string());
        }
    }
    if let Some(error) = worker_error {
        bail!("batch decode aborted: {error}");
    }

    Ok(BatchSummary {
        results,
        elapsed: started.elapsed(),
    })
}

/// In-process fallback: same task semantics, no worker pool.
pub fn decode_directory_sequential(
    input_dir: &Path,
    output_dir: &Path,
    schema_path: &Path,
    options: &BatchOptions,
    mut on_progress: Option<&mut dyn FnMut(&BatchProgress)>,
) -> anyhow::Result<BatchSummary> {
    let started = Instant::now();
    let tasks = collect_tasks(input_dir, output_dir, options)?;
    let total = tasks.len();
    if !tasks.is_empty() {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("creating {}", output_dir.display()))?;
    }

    let schema = Schema::load(schema_path)?;
    let mut results = Vec::with_capacity(total);
    for (i, task) in tasks.iter().enumerate() {
        if let Some(cb) = on_progress.as_deref_mut() {
            cb(&BatchProgress {
                completed: i,
                total,
                in_flight: vec![task.table.clone()],
                slow: None,
            });
        }
        results.push(run_task(&schema, task, options.use_cache));
    }

    Ok(BatchSummary {
        results,
        elapsed: started.elapsed(),
    })
}

pub fn default_concurrency() -> usize {
    let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(2);
    cpus.saturating_sub(1).max(1)
}

fn emit_progress(
    on_progress: &mut Option<&mut dyn FnMut(&BatchProgress)>,
    per_worker_completed: &[usize],
    total: usize,
    in_flight: &[Option<(String, Instant)>],
    last_advance: Instant,
) {
    let Some(cb) = on_progress.as_deref_mut() else {
        return;
    };

    let stalled = last_advance.elapsed() >= STALL_TIMEOUT;
    let slow = if stalled {
        in_flight
            .iter()
            .flatten()
            .min_by_key(|(_, since)| std::cmp::Reverse(since.elapsed()))
            .map(|(table, _)| table.clone())
    } else {
        None
    };

    cb(&BatchProgress {
        completed: per_worker_completed.iter().sum(),
        total,
        in_flight: in_flight.iter().flatten().map(|(t, _)| t.clone()).collect(),
        slow,
    });
}

fn collect_tasks(
    input_dir: &Path,
    output_dir: &Path,
    options: &BatchOptions,
) -> anyhow::Result<Vec<Task>> {
    let mut inputs: Vec<PathBuf> = std::fs::read_dir(input_dir)
        .with_context(|| format!("reading {}", input_dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && super::is_table_file(p))
        .collect();
    inputs.sort();

    if let Some(filter) = &options.filter {
        let needle = filter.to_lowercase();
        inputs.retain(|p| {
            p.file_name()
                .map(|n| n.to_string_lossy().to_lowercase().contains(&needle))
                .unwrap_or(false)
        });
    }
    if let Some(limit) = options.limit {
        inputs.truncate(limit);
    }

    Ok(inputs
        .into_iter()
        .filter_map(|input| {
            let Some(table) = table_name_from_path(&input) else {
                warn!("no table name derivable from {}, skipping", input.display());
                return None;
            };
            let output = output_dir.join(format!("{table}.json"));
            Some(Task {
                input,
                output,
                table,
            })
        })
        .collect())
}

fn worker_main(worker: usize, requests: Receiver<WorkerRequest>, events: Sender<WorkerEvent>) {
    let mut schema: Option<Schema> = None;

    while let Ok(request) = requests.recv() {
        match request {
            WorkerRequest::Init { schema_path } => match Schema::load(&schema_path) {
                Ok(s) => {
                    schema = Some(s);
                    let _ = events.send(WorkerEvent::Ready { worker });
                }
                Err(e) => {
                    let _ = events.send(WorkerEvent::Failed {
                        worker,
                        error: format!("{e:#}"),
                    });
                    return;
                }
            },
            WorkerRequest::Batch { tasks, check_cache } => {
                let Some(schema) = schema.as_ref() else {
                    let _ = events.send(WorkerEvent::Failed {
                        worker,
                        error: "batch before init".to_string(),
                    });
                    return;
                };

                let mut results = Vec::with_capacity(tasks.len());
                for (i, task) in tasks.iter().enumerate() {
                    let _ = events.send(WorkerEvent::Progress {
                        worker,
                        completed: i,
                        current: Some(task.table.clone()),
                    });
                    results.push(run_task(schema, task, check_cache));
                    let _ = events.send(WorkerEvent::Progress {
                        worker,
                        completed: i + 1,
                        current: None,
                    });
                }
                let _ = events.send(WorkerEvent::BatchResult { worker, results });
            }
        }
    }
}

fn run_task(schema: &Schema, task: &Task, check_cache: bool) -> TaskResult {
    let mut result = TaskResult {
        file: task.input.clone(),
        table: task.table.clone(),
        success: false,
        cached: false,
        rows: 0,
        skipped: None,
        warning: None,
        error: None,
    };

    if check_cache && is_cached(&task.input, &task.output) {
        result.success = true;
        result.cached = true;
        return result;
    }

    let size = match std::fs::metadata(&task.input) {
        Ok(m) => m.len(),
        Err(e) => {
            result.error = Some(e.to_string());
            return result;
        }
    };
    if size == 0 {
        result.skipped = Some("empty".to_string());
        return result;
    }
    if size > MAX_INPUT_SIZE {
        result.skipped = Some("too large".to_string());
        return result;
    }
    // Most tables on disk belong to the other product; not having a
    // schema entry is routine.
    if schema.table(&task.table).is_none() {
        result.skipped = Some("no schema".to_string());
        return result;
    }

    let data = match std::fs::read(&task.input) {
        Ok(d) => d,
        Err(e) => {
            result.error = Some(e.to_string());
            return result;
        }
    };

    let outcome = super::decode_table(schema, &task.table, &data);
    result.warning = outcome.warning.clone();
    if let Some(error) = outcome.error {
        result.error = Some(error);
        return result;
    }

    if let Err(e) = super::write_rows_json(&outcome, &task.output) {
        result.error = Some(format!("{e:#}"));
        return result;
    }

    result.success = true;
    result.rows = outcome.rows.len();
    result
}

fn is_cached(input: &Path, output: &Path) -> bool {
    let Ok(out_meta) = std::fs::metadata(output) else {
        return false;
    };
    let Ok(in_meta) = std::fs::metadata(input) else {
        return false;
    };
    match (out_meta.modified(), in_meta.modified()) {
        (Ok(out_time), Ok(in_time)) => out_time >= in_time,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "poe2-ggpk-batch-{}-{name}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_schema(dir: &Path) -> PathBuf {
        let path = dir.join("schema.min.json");
        std::fs::write(
            &path,
            r#"{"version":1,"createdAt":0,"tables":[
                {"validFor":2,"name":"Alpha","columns":[{"name":"A","type":"i32"}]},
                {"validFor":2,"name":"Beta","columns":[{"name":"B","type":"u32"}]}
            ]}"#,
        )
        .unwrap();
        path
    }

    fn write_table(dir: &Path, name: &str, value: u32) -> PathBuf {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&value.to_le_bytes());
        buf.extend_from_slice(&[0xBB; 8]);
        let path = dir.join(name);
        std::fs::write(&path, buf).unwrap();
        path
    }

    #[test]
    fn decodes_and_caches() {
        let input = temp_dir("in");
        let output = temp_dir("out");
        let schema = write_schema(&input);
        write_table(&input, "Alpha.datc64", 7);
        write_table(&input, "Beta.datc64", 9);

        let options = BatchOptions {
            concurrency: Some(2),
            ..Default::default()
        };
        let summary = decode_directory(&input, &output, &schema, &options, None).unwrap();
        assert_eq!(summary.results.len(), 2);
        assert_eq!(summary.succeeded(), 2);
        assert_eq!(summary.cached(), 0);
        assert!(output.join("Alpha.json").exists());
        assert!(output.join("Beta.json").exists());

        let mtime_before = std::fs::metadata(output.join("Alpha.json"))
            .unwrap()
            .modified()
            .unwrap();

        // Unmodified inputs: everything reports cached, nothing is
        // rewritten.
        let summary = decode_directory(&input, &output, &schema, &options, None).unwrap();
        assert_eq!(summary.succeeded(), 2);
        assert_eq!(summary.cached(), 2);
        let mtime_after = std::fs::metadata(output.join("Alpha.json"))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(mtime_before, mtime_after);

        std::fs::remove_dir_all(&input).ok();
        std::fs::remove_dir_all(&output).ok();
    }

    #[test]
    fn clamps_and_skips() {
        let input = temp_dir("clamp-in");
        let output = temp_dir("clamp-out");
        let schema = write_schema(&input);
        std::fs::write(input.join("Alpha.datc64"), b"").unwrap();
        write_table(&input, "Unknown.datc64", 1);

        let options = BatchOptions {
            concurrency: Some(1),
            ..Default::default()
        };
        let summary = decode_directory(&input, &output, &schema, &options, None).unwrap();
        assert_eq!(summary.results.len(), 2);
        assert_eq!(summary.skipped(), 2);

        let by_table = |t: &str| {
            summary
                .results
                .iter()
                .find(|r| r.table == t)
                .unwrap()
                .skipped
                .clone()
        };
        assert_eq!(by_table("Alpha").as_deref(), Some("empty"));
        assert_eq!(by_table("Unknown").as_deref(), Some("no schema"));

        std::fs::remove_dir_all(&input).ok();
        std::fs::remove_dir_all(&output).ok();
    }

    #[test]
    fn filter_and_limit() {
        let input = temp_dir("filter-in");
        let output = temp_dir("filter-out");
        let schema = write_schema(&input);
        write_table(&input, "Alpha.datc64", 1);
        write_table(&input, "Beta.datc64", 2);

        let options = BatchOptions {
            filter: Some("alpha".to_string()),
            concurrency: Some(1),
            ..Default::default()
        };
        let summary = decode_directory(&input, &output, &schema, &options, None).unwrap();
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.results[0].table, "Alpha");

        let options = BatchOptions {
            limit: Some(1),
            concurrency: Some(1),
            ..Default::default()
        };
        let summary = decode_directory(&input, &output, &schema, &options, None).unwrap();
        assert_eq!(summary.results.len(), 1);

        std::fs::remove_dir_all(&input).ok();
        std::fs::remove_dir_all(&output).ok();
    }

    #[test]
    fn sequential_matches_pool() {
        let input = temp_dir("seq-in");
        let output = temp_dir("seq-out");
        let schema = write_schema(&input);
        write_table(&input, "Alpha.datc64", 7);

        let options = BatchOptions {
            use_cache: false,
            ..Default::default()
        };
        let summary =
            decode_directory_sequential(&input, &output, &schema, &options, None).unwrap();
        assert_eq!(summary.succeeded(), 1);
        assert_eq!(summary.results[0].rows, 1);

        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(output.join("Alpha.json")).unwrap()).unwrap();
        assert_eq!(json[0]["A"], serde_json::json!(7));

        std::fs::remove_dir_all(&input).ok();
        std::fs::remove_dir_all(&output).ok();
    }
}
