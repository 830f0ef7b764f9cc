pub mod index;

use std::io::Read;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tiny_http::{Header, Method, Request, Response, Server};
use tracing::{error, info, warn};

use self::index::{FileIndex, FileKind};
use crate::bundle::BundleClient;
use crate::config::Config;
use crate::dat::{self, Schema};
use crate::pipeline::{self, PipelineEvent, PipelineOptions};

/// Budget for a DDS preview conversion.
const DDS_PREVIEW_TIMEOUT: Duration = Duration::from_secs(5);

/// Converted previews kept in memory.
const PREVIEW_CACHE_CAP: usize = 100;

/// Bytes shown by the hex fallback preview.
const HEX_PREVIEW_BYTES: usize = 4096;

const MIN_SEARCH_QUERY: usize = 2;

enum Payload {
    Json(String),
    Bytes(Vec<u8>, &'static str),
}

struct Reply {
    status: u16,
    payload: Payload,
}

fn json_reply<T: Serialize>(status: u16, value: &T) -> Reply {
    Reply {
        status,
        payload: Payload::Json(serde_json::to_string(value).unwrap_or_else(|_| "{}".into())),
    }
}

fn error_reply(status: u16, message: impl AsRef<str>) -> Reply {
    json_reply(status, &json!({ "error": message.as_ref() }))
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "lowercase")]
enum OperationStatus {
    Running,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct OperationProgress {
    stage: String,
    completed: u64,
    total: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
struct Operation {
    #[serde(rename = "type")]
    kind: String,
    status: OperationStatus,
    progress: OperationProgress,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

type OperationMap = Arc<RwLock<FxHashMap<String, Operation>>>;
type IndexSlot = Arc<RwLock<Arc<FileIndex>>>;

/// Access-stamped preview cache; the stalest entry is evicted first once
/// the cap is reached.
struct PreviewCache {
    epoch: usize,
    entries: FxHashMap<String, (usize, Arc<Vec<u8>>)>,
}

impl PreviewCache {
    fn new() -> PreviewCache {
        PreviewCache {
            epoch: 0,
            entries: FxHashMap::default(),
        }
    }

    fn get(&mut self, key: &str) -> Option<Arc<Vec<u8>>> {
        self.epoch += 1;
        let epoch = self.epoch;
        self.entries.get_mut(key).map(|entry| {
            entry.0 = epoch;
            Arc::clone(&entry.1)
        })
    }

    fn insert(&mut self, key: String, data: Arc<Vec<u8>>) {
        self.epoch += 1;
        self.entries.insert(key, (self.epoch, data));
        while self.entries.len() > PREVIEW_CACHE_CAP {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, (epoch, _))| *epoch)
                .map(|(k, _)| k.clone())
            else {
                break;
            };
            self.entries.remove(&oldest);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// The query surface the file explorer talks to. Requests are handled to
/// completion, one at a time, on the accept loop; background extract
/// jobs report through the shared operations map.
pub struct Backend {
    config: Config,
    index: IndexSlot,
    schema: RwLock<Option<Arc<Schema>>>,
    ggpk_counts: RwLock<Option<Option<(u64, u64)>>>,
    preview_cache: Mutex<PreviewCache>,
    operations: OperationMap,
    next_operation: AtomicU64,
}

impl Backend {
    pub fn new(config: Config) -> Backend {
        let cache_path = config.cache_dir.join("file_index.json");
        let index = FileIndex::load_or_rebuild(&config.output_dir, &cache_path);
        Backend {
            config,
            index: Arc::new(RwLock::new(Arc::new(index))),
            schema: RwLock::new(None),
            ggpk_counts: RwLock::new(None),
            preview_cache: Mutex::new(PreviewCache::new()),
            operations: Arc::new(RwLock::new(FxHashMap::default())),
            next_operation: AtomicU64::new(1),
        }
    }

    /// Binds `addr` and serves on a background thread. Returns the bound
    /// address, useful when the requested port was 0.
    pub fn start(self: Arc<Self>, addr: &str) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
        let server = Server::http(addr).map_err(|e| anyhow!("binding {addr}: {e}"))?;
        let bound = server
            .server_addr()
            .to_ip()
            .context("server has no ip address")?;
        info!("backend listening on {bound}");

        let backend = self;
        let handle = thread::spawn(move || {
            for request in server.incoming_requests() {
                backend.handle(request);
            }
        });
        Ok((bound, handle))
    }

    /// Serves forever on the calling thread.
    pub fn run(self: Arc<Self>, addr: &str) -> anyhow::Result<()> {
        let (_, handle) = self.start(addr)?;
        handle.join().map_err(|_| anyhow!("server thread panicked"))
    }

    fn handle(&self, mut request: Request) {
        let url = request.url().to_string();
        let (path, query) = match url.split_once('?') {
            Some((p, q)) => (p.to_string(), parse_query(q)),
            None => (url.clone(), Vec::new()),
        };

        let mut body = String::new();
        if *request.method() == Method::Post {
            request.as_reader().read_to_string(&mut body).ok();
        }

        let reply = match self.route(request.method(), &path, &query, &body) {
            Ok(reply) => reply,
            Err(e) => {
                error!("{} {path}: {e:#}", request.method());
                error_reply(500, format!("{e:#}"))
            }
        };

        let (content_type, data) = match reply.payload {
            Payload::Json(text) => ("application/json", text.into_bytes()),
            Payload::Bytes(bytes, mime) => (mime, bytes),
        };
        let header = Header::from_bytes(&b"Content-Type"[..], content_type.as_bytes())
            .expect("static content-type header");
        let response = Response::from_data(data)
            .with_status_code(reply.status)
            .with_header(header);
        request.respond(response).ok();
    }

    fn route(
        &self,
        method: &Method,
        path: &str,
        query: &[(String, String)],
        body: &str,
    ) -> anyhow::Result<Reply> {
        match (method, path) {
            (Method::Get, "/api/status") => self.handle_status(),
            (Method::Post, "/api/rebuild-index") => self.handle_rebuild(),
            (Method::Get, "/api/browse") => self.handle_browse(query),
            (Method::Get, "/api/search") => self.handle_search(query),
            (Method::Get, "/api/folders") => self.handle_folders(),
            (Method::Get, "/api/file") => self.handle_file(query),
            (Method::Post, "/api/extract") => self.handle_extract(body),
            (Method::Post, "/api/cleanup") => self.handle_cleanup(),
            (Method::Post, "/api/export-json") => self.handle_export_json(body),
            (Method::Get, _) if path.starts_with("/api/operation/") => {
                self.handle_operation(&path["/api/operation/".len()..])
            }
            _ => Ok(error_reply(404, format!("no such endpoint: {path}"))),
        }
    }

    fn handle_status(&self) -> anyhow::Result<Reply> {
        let index = Arc::clone(&self.index.read());

        let ggpk = self.ggpk_counts();
        let schema = match self.schema() {
            Ok(schema) => json!({
                "exists": true,
                "createdAt": schema.created_at,
                "tableCount": schema.table_count(),
                "version": schema.version,
            }),
            Err(_) => json!({ "exists": false }),
        };

        Ok(json_reply(
            200,
            &json!({
                "config": { "poe2Path": self.config.poe2_path },
                "ggpk": ggpk.map(|(bundles, files)| json!({
                    "bundleCount": bundles,
                    "fileCount": files,
                })),
                "extracted": { "fileCount": index.files.len() },
                "indexTimestamp": index.built_at,
                "schema": schema,
            }),
        ))
    }

    /// Probes the bundle index once and remembers the answer; a missing
    /// archive or a failing utility reports as null.
    fn ggpk_counts(&self) -> Option<(u64, u64)> {
        if let Some(cached) = *self.ggpk_counts.read() {
            return cached;
        }

        let archive = self.config.archive_path();
        let probed = if archive.is_file() {
            match BundleClient::new(self.config.bundle_tool()).list_files(&archive) {
                Ok(listing) => Some((listing.bundle_count, listing.file_count)),
                Err(e) => {
                    warn!("bundle index probe failed: {e:#}");
                    None
                }
            }
        } else {
            None
        };

        *self.ggpk_counts.write() = Some(probed);
        probed
    }

    fn schema(&self) -> anyhow::Result<Arc<Schema>> {
        if let Some(schema) = self.schema.read().as_ref() {
            return Ok(Arc::clone(schema));
        }
        let schema = Arc::new(Schema::load(&self.config.schema_path)?);
        *self.schema.write() = Some(Arc::clone(&schema));
        Ok(schema)
    }

    fn handle_rebuild(&self) -> anyhow::Result<Reply> {
        let index = rebuild_index(&self.config, &self.index);
        Ok(json_reply(200, &json!({ "fileCount": index.files.len() })))
    }

    fn handle_browse(&self, query: &[(String, String)]) -> anyhow::Result<Reply> {
        let folder = param(query, "folder").unwrap_or_default();
        let page = param(query, "page")
            .and_then(|p| p.parse().ok())
            .unwrap_or(1);
        let per_page = param(query, "perPage")
            .and_then(|p| p.parse().ok())
            .unwrap_or(100);
        let kind = param(query, "type").and_then(|t| FileKind::parse(&t));

        let result = self.index.read().browse(&folder, page, per_page, kind);
        Ok(json_reply(200, &result))
    }

    fn handle_search(&self, query: &[(String, String)]) -> anyhow::Result<Reply> {
        let Some(q) = param(query, "q") else {
            return Ok(error_reply(400, "missing query parameter 'q'"));
        };
        if q.chars().count() < MIN_SEARCH_QUERY {
            return Ok(error_reply(400, "query must be at least 2 characters"));
        }
        let kind = param(query, "type").and_then(|t| FileKind::parse(&t));
        let limit = param(query, "limit")
            .and_then(|l| l.parse().ok())
            .unwrap_or(50);

        let hits = self.index.read().search(&q, kind, limit);
        Ok(json_reply(200, &json!({ "query": q, "results": hits })))
    }

    fn handle_folders(&self) -> anyhow::Result<Reply> {
        Ok(json_reply(200, &self.index.read().folder_tree()))
    }

    fn handle_file(&self, query: &[(String, String)]) -> anyhow::Result<Reply> {
        let Some(raw) = param(query, "path") else {
            return Ok(error_reply(400, "missing query parameter 'path'"));
        };
        let Some(rel) = sanitize_rel_path(&raw) else {
            return Ok(error_reply(400, "invalid path"));
        };
        let full = self.config.output_dir.join(&rel);
        if !full.is_file() {
            return Ok(error_reply(404, format!("no such file: {rel}")));
        }

        let ext = full
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();

        match ext.as_str() {
            "json" => serve_raw(&full, "application/json"),
            "ogg" => serve_raw(&full, "audio/ogg"),
            "wav" => serve_raw(&full, "audio/wav"),
            "png" => serve_raw(&full, "image/png"),
            "webp" => serve_raw(&full, "image/webp"),
            "jpg" | "jpeg" => serve_raw(&full, "image/jpeg"),
            "dds" => self.serve_dds_preview(&rel, &full),
            "dat" | "dat64" | "datc64" => self.serve_table_preview(&full),
            _ => hex_reply(&full),
        }
    }

    fn serve_dds_preview(&self, rel: &str, full: &Path) -> anyhow::Result<Reply> {
        if let Some(png) = self.preview_cache.lock().get(rel) {
            return Ok(Reply {
                status: 200,
                payload: Payload::Bytes(png.as_ref().clone(), "image/png"),
            });
        }

        let preview_dir = self.config.cache_dir.join("previews");
        std::fs::create_dir_all(&preview_dir)
            .with_context(|| format!("creating {}", preview_dir.display()))?;
        let target = preview_dir.join(format!("{}.png", rel.replace('/', "_")));

        if let Err(e) = pipeline::convert_dds(
            &self.config.image_tool(),
            full,
            &target,
            90,
            DDS_PREVIEW_TIMEOUT,
        ) {
            return Ok(error_reply(502, format!("preview failed: {e}")));
        }

        let png = Arc::new(std::fs::read(&target)?);
        self.preview_cache
            .lock()
            .insert(rel.to_string(), Arc::clone(&png));
        Ok(Reply {
            status: 200,
            payload: Payload::Bytes(png.as_ref().clone(), "image/png"),
        })
    }

    /// Parsed rows when the schema knows the table, a hex dump when it
    /// does not.
    fn serve_table_preview(&self, full: &Path) -> anyhow::Result<Reply> {
        let Ok(schema) = self.schema() else {
            return hex_reply(full);
        };
        let Some(table) = dat::table_name_from_path(full) else {
            return hex_reply(full);
        };
        if schema.table(&table).is_none() {
            return hex_reply(full);
        }

        let outcome = dat::decode_file(&schema, full)?;
        if outcome.error.is_some() {
            return hex_reply(full);
        }
        Ok(json_reply(200, &outcome))
    }

    fn handle_extract(&self, body: &str) -> anyhow::Result<Reply> {
        let request: ExtractRequest = if body.trim().is_empty() {
            ExtractRequest::default()
        } else {
            match serde_json::from_str(body) {
                Ok(r) => r,
                Err(e) => return Ok(error_reply(400, format!("bad request body: {e}"))),
            }
        };

        let pattern = match (&request.pattern, &request.preset) {
            (Some(pattern), _) => pattern.clone(),
            (None, Some(preset)) => match pipeline::preset_pattern(preset) {
                Some(p) => p.to_string(),
                None => return Ok(error_reply(400, format!("unknown preset '{preset}'"))),
            },
            (None, None) => {
                return Ok(error_reply(400, "either 'pattern' or 'preset' is required"))
            }
        };

        let id = format!("op-{}", self.next_operation.fetch_add(1, Ordering::Relaxed));
        self.operations.write().insert(
            id.clone(),
            Operation {
                kind: "extract".to_string(),
                status: OperationStatus::Running,
                progress: OperationProgress {
                    stage: "starting".to_string(),
                    completed: 0,
                    total: 0,
                },
                error: None,
            },
        );

        // The job owns clones of everything it touches; the operations
        // map is its only channel back to the surface.
        let job = ExtractJob {
            id: id.clone(),
            pattern,
            options: PipelineOptions {
                exclude_languages: request.exclude_languages,
                convert_images: request.convert_images,
                decode_tables: request.decode_tables,
            },
            config: self.config.clone(),
            operations: Arc::clone(&self.operations),
            index: Arc::clone(&self.index),
        };
        thread::spawn(move || job.run());

        Ok(json_reply(202, &json!({ "operationId": id })))
    }

    fn handle_operation(&self, id: &str) -> anyhow::Result<Reply> {
        match self.operations.read().get(id) {
            Some(op) => Ok(json_reply(200, op)),
            None => Ok(error_reply(404, format!("no such operation: {id}"))),
        }
    }

    fn handle_cleanup(&self) -> anyhow::Result<Reply> {
        let stats = pipeline::cleanup_dir(&self.config.output_dir)?;
        rebuild_index(&self.config, &self.index);
        Ok(json_reply(200, &stats))
    }

    fn handle_export_json(&self, body: &str) -> anyhow::Result<Reply> {
        #[derive(Deserialize)]
        struct ExportRequest {
            path: String,
        }
        let request: ExportRequest = match serde_json::from_str(body) {
            Ok(r) => r,
            Err(e) => return Ok(error_reply(400, format!("bad request body: {e}"))),
        };
        let Some(rel) = sanitize_rel_path(&request.path) else {
            return Ok(error_reply(400, "invalid path"));
        };
        let full = self.config.output_dir.join(&rel);
        if !full.is_file() {
            return Ok(error_reply(404, format!("no such file: {rel}")));
        }

        let schema = self.schema()?;
        let outcome = dat::decode_file(&schema, &full)?;
        if let Some(error) = &outcome.error {
            return Ok(error_reply(422, error));
        }
        dat::write_rows_json(&outcome, &full.with_extension("json"))?;
        rebuild_index(&self.config, &self.index);

        Ok(json_reply(
            200,
            &json!({
                "table": outcome.table_name,
                "rows": outcome.rows.len(),
                "warning": outcome.warning,
            }),
        ))
    }
}

fn rebuild_index(config: &Config, slot: &IndexSlot) -> Arc<FileIndex> {
    let index = Arc::new(FileIndex::rebuild(&config.output_dir));
    let cache_path = config.cache_dir.join("file_index.json");
    if let Err(e) = index.save(&cache_path) {
        warn!("could not persist file index cache: {e:#}");
    }
    *slot.write() = Arc::clone(&index);
    index
}

struct ExtractJob {
    id: String,
    pattern: String,
    options: PipelineOptions,
    config: Config,
    operations: OperationMap,
    index: IndexSlot,
}

impl ExtractJob {
    fn run(self) {
        let operations = Arc::clone(&self.operations);
        let id = self.id.clone();
        let on_event = move |event: PipelineEvent| {
            let (stage, completed, total) = match event {
                PipelineEvent::Extracting { completed, .. } => ("extracting", completed, 0),
                PipelineEvent::ConvertingImages { completed, total } => {
                    ("converting", completed, total)
                }
                PipelineEvent::DecodingTables { completed, total } => {
                    ("decoding", completed, total)
                }
            };
            if let Some(op) = operations.write().get_mut(&id) {
                op.progress = OperationProgress {
                    stage: stage.to_string(),
                    completed,
                    total,
                };
            }
        };

        let result = pipeline::run(&self.config, &self.pattern, &self.options, Some(&on_event));
        if result.is_ok() {
            rebuild_index(&self.config, &self.index);
        }

        let mut operations = self.operations.write();
        let Some(op) = operations.get_mut(&self.id) else {
            return;
        };
        match result {
            Ok(metrics) => {
                info!(
                    "extract operation {} finished: {} files in {} ms",
                    self.id, metrics.extracted, metrics.elapsed_ms
                );
                op.status = OperationStatus::Completed;
                op.progress.stage = "done".to_string();
            }
            Err(e) => {
                error!("extract operation {} failed: {e:#}", self.id);
                op.status = OperationStatus::Error;
                op.error = Some(format!("{e:#}"));
            }
        }
    }
}

fn serve_raw(path: &Path, mime: &'static str) -> anyhow::Result<Reply> {
    Ok(Reply {
        status: 200,
        payload: Payload::Bytes(std::fs::read(path)?, mime),
    })
}

fn hex_reply(path: &Path) -> anyhow::Result<Reply> {
    let size = std::fs::metadata(path)?.len();
    let mut file = std::fs::File::open(path)?;
    let mut buf = vec![0u8; HEX_PREVIEW_BYTES.min(size as usize)];
    file.read_exact(&mut buf)?;

    Ok(json_reply(
        200,
        &json!({
            "type": "hex",
            "size": size,
            "preview": hex_dump(&buf),
        }),
    ))
}

fn hex_dump(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 3);
    for (i, chunk) in bytes.chunks(16).enumerate() {
        if i > 0 {
            out.push('\n');
        }
        for (j, b) in chunk.iter().enumerate() {
            if j > 0 {
                out.push(' ');
            }
            write!(out, "{b:02x}").ok();
        }
    }
    out
}

fn param(query: &[(String, String)], name: &str) -> Option<String> {
    query
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.clone())
}

fn parse_query(query: &str) -> Vec<(String, String)> {
    query
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| match part.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(part), String::new()),
        })
        .collect()
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_val(bytes[i + 1]), hex_val(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Rejects traversal and absolute paths; returns the cleaned relative
/// path.
fn sanitize_rel_path(raw: &str) -> Option<String> {
    let cleaned = raw.trim_matches('/');
    if cleaned.is_empty() {
        return None;
    }
    let path = Path::new(cleaned);
    if path.is_absolute() {
        return None;
    }
    for component in path.components() {
        match component {
            std::path::Component::Normal(_) => {}
            _ => return None,
        }
    }
    Some(cleaned.replace('\\', "/"))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ExtractRequest {
    pattern: Option<String>,
    preset: Option<String>,
    exclude_languages: bool,
    convert_images: bool,
    decode_tables: bool,
}

impl Default for ExtractRequest {
    fn default() -> Self {
        ExtractRequest {
            pattern: None,
            preset: None,
            exclude_languages: true,
            convert_images: true,
            decode_tables: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::net::TcpStream;
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn query_strings_decode() {
        let parsed = parse_query("folder=art%2F2dart&q=fire+ball&perPage=50");
        assert_eq!(
            parsed,
            vec![
                ("folder".to_string(), "art/2dart".to_string()),
                ("q".to_string(), "fire ball".to_string()),
                ("perPage".to_string(), "50".to_string()),
            ]
        );
        assert_eq!(param(&parsed, "perPage").as_deref(), Some("50"));
        assert_eq!(param(&parsed, "missing"), None);
    }

    #[test]
    fn path_sanitizer_rejects_traversal() {
        assert_eq!(
            sanitize_rel_path("data/mods.json").as_deref(),
            Some("data/mods.json")
        );
        assert_eq!(sanitize_rel_path("/data/x").as_deref(), Some("data/x"));
        assert!(sanitize_rel_path("../etc/passwd").is_none());
        assert!(sanitize_rel_path("data/../../x").is_none());
        assert!(sanitize_rel_path("").is_none());
    }

    #[test]
    fn hex_dump_formats_sixteen_per_line() {
        let bytes: Vec<u8> = (0u8..20).collect();
        let dump = hex_dump(&bytes);
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00 01 02"));
        assert!(lines[1].starts_with("10 11 12"));
    }

    #[test]
    fn preview_cache_evicts_stalest() {
        let mut cache = PreviewCache::new();
        for i in 0..(PREVIEW_CACHE_CAP + 10) {
            cache.insert(format!("k{i}"), Arc::new(vec![i as u8]));
        }
        assert_eq!(cache.len(), PREVIEW_CACHE_CAP);
        assert!(cache.get("k0").is_none());
        assert!(cache.get(&format!("k{}", PREVIEW_CACHE_CAP + 9)).is_some());
    }

    fn test_backend(name: &str) -> (Arc<Backend>, PathBuf) {
        let dir = std::env::temp_dir().join(format!(
            "poe2-ggpk-server-{}-{name}",
            std::process::id()
        ));
        std::fs::create_dir_all(dir.join("extracted/data")).unwrap();
        std::fs::write(dir.join("extracted/data/mods.json"), b"[]").unwrap();

        let mut config = Config::default();
        config.poe2_path = dir.join("game");
        config.output_dir = dir.join("extracted");
        config.cache_dir = dir.join("cache");
        (Arc::new(Backend::new(config)), dir)
    }

    fn http_get(addr: SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        write!(
            stream,
            "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
        )
        .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    #[test]
    fn status_and_browse_over_http() {
        let (backend, dir) = test_backend("smoke");
        let (addr, _handle) = backend.start("127.0.0.1:0").unwrap();

        let status = http_get(addr, "/api/status");
        assert!(status.starts_with("HTTP/1.1 200"));
        assert!(status.contains("\"extracted\""));
        assert!(status.contains("\"ggpk\":null"));
        assert!(status.contains("\"exists\":false"));

        let browse = http_get(addr, "/api/browse?folder=data");
        assert!(browse.starts_with("HTTP/1.1 200"));
        assert!(browse.contains("mods.json"));

        let search = http_get(addr, "/api/search?q=x");
        assert!(search.starts_with("HTTP/1.1 400"));

        let missing = http_get(addr, "/api/nope");
        assert!(missing.starts_with("HTTP/1.1 404"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn file_endpoint_serves_json_and_hex() {
        let (backend, dir) = test_backend("file");
        std::fs::write(dir.join("extracted/data/blob.bin"), [0u8, 1, 2, 3]).unwrap();
        let (addr, _handle) = backend.start("127.0.0.1:0").unwrap();

        let json = http_get(addr, "/api/file?path=data%2Fmods.json");
        assert!(json.starts_with("HTTP/1.1 200"));
        assert!(json.contains("application/json"));

        let hex = http_get(addr, "/api/file?path=data/blob.bin");
        assert!(hex.starts_with("HTTP/1.1 200"));
        assert!(hex.contains("\"type\":\"hex\""));
        assert!(hex.contains("00 01 02 03"));

        let denied = http_get(addr, "/api/file?path=../secret");
        assert!(denied.starts_with("HTTP/1.1 400"));

        std::fs::remove_dir_all(&dir).ok();
    }
}
