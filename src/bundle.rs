use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use lazy_static::lazy_static;
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use tracing::{info, warn};

use crate::error::ToolError;

/// Above this many paths the list travels over the utility's stdin to
/// stay clear of platform argument-length limits.
pub const STDIN_PATH_THRESHOLD: usize = 50;

/// Progress callbacks fire at most ten times per second.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Path segments that mark localised duplicates of game files.
pub const LANGUAGE_SEGMENTS: [&str; 10] = [
    "french",
    "german",
    "japanese",
    "korean",
    "portuguese",
    "russian",
    "spanish",
    "thai",
    "traditional chinese",
    "simplified chinese",
];

lazy_static! {
    static ref LANGUAGE_EXCLUDE: Regex = {
        let alternatives = LANGUAGE_SEGMENTS.join("|");
        RegexBuilder::new(&format!(r"[/.](?:{alternatives})[/.]"))
            .case_insensitive(true)
            .build()
            .expect("language exclusion pattern")
    };
    static ref DONE_LINE: Regex =
        Regex::new(r"Done, (\d+)/(\d+) extracted, (\d+) missed").expect("done-line pattern");
}

pub fn is_language_path(path: &str) -> bool {
    LANGUAGE_EXCLUDE.is_match(path)
}

#[derive(Debug, Clone)]
pub struct BundleListing {
    pub bundle_count: u64,
    pub file_count: u64,
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ExtractStats {
    pub extracted: u64,
    pub total: u64,
    pub missed: u64,
}

/// Client for the external utility that owns the proprietary bundle
/// codec. The index and every bundle block are decoded on its side of
/// the fence; this side only speaks its stdio contract.
pub struct BundleClient {
    tool: PathBuf,
}

impl BundleClient {
    pub fn new<P: Into<PathBuf>>(tool: P) -> BundleClient {
        BundleClient { tool: tool.into() }
    }

    /// Enumerates every logical path in the bundle index, along with the
    /// bundle and file counts the utility reports on stderr.
    pub fn list_files(&self, archive: &Path) -> anyhow::Result<BundleListing> {
        let mut child = Command::new(&self.tool)
            .arg("list-files")
            .arg(archive)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning {}", self.tool.display()))?;

        let stderr = child.stderr.take().context("no stderr handle")?;
        let stderr_thread = thread::spawn(move || {
            let mut buf = String::new();
            let mut reader = BufReader::new(stderr);
            reader.read_to_string(&mut buf).ok();
            buf
        });

        let stdout = child.stdout.take().context("no stdout handle")?;
        let mut paths = Vec::new();
        for line in BufReader::new(stdout).lines() {
            let line = line?;
            let line = line.trim();
            if !line.is_empty() {
                paths.push(line.to_string());
            }
        }

        let status = child.wait()?;
        let stderr_text = stderr_thread.join().unwrap_or_default();
        if !status.success() {
            return Err(ToolError::ExternalTool(format!(
                "{} list-files exited with {status}: {}",
                self.tool.display(),
                stderr_text.trim()
            ))
            .into());
        }

        let (bundle_count, file_count) = parse_index_counts(&stderr_text);
        info!(
            "bundle index: {} bundles, {} files",
            bundle_count.unwrap_or(0),
            file_count.unwrap_or(paths.len() as u64)
        );

        Ok(BundleListing {
            bundle_count: bundle_count.unwrap_or(0),
            file_count: file_count.unwrap_or(paths.len() as u64),
            paths,
        })
    }

    /// Extracts the named logical paths into `output_dir`. Long path
    /// lists are fed through stdin.
    pub fn extract_by_paths(
        &self,
        archive: &Path,
        output_dir: &Path,
        paths: &[String],
        use_regex: bool,
        mut on_progress: Option<&mut dyn FnMut(u64, &str)>,
    ) -> anyhow::Result<ExtractStats> {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("creating {}", output_dir.display()))?;

        let mut command = Command::new(&self.tool);
        command.arg("extract-files");
        if use_regex {
            command.arg("--regex");
        }
        command.arg(archive).arg(output_dir);

        let over_threshold = paths.len() > STDIN_PATH_THRESHOLD;
        if over_threshold {
            command.stdin(Stdio::piped());
        } else {
            command.args(paths);
            command.stdin(Stdio::null());
        }

        let mut child = command
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawning {}", self.tool.display()))?;

        // Written from its own thread so a chatty utility cannot wedge
        // against a full stderr pipe.
        let stdin_thread = if over_threshold {
            let mut stdin = child.stdin.take().context("no stdin handle")?;
            let body = paths.join("\n");
            Some(thread::spawn(move || {
                stdin.write_all(body.as_bytes()).ok();
                stdin.write_all(b"\n").ok();
            }))
        } else {
            None
        };

        let stdout = child.stdout.take().context("no stdout handle")?;
        let stdout_thread = thread::spawn(move || {
            let mut buf = String::new();
            BufReader::new(stdout).read_to_string(&mut buf).ok();
            buf
        });

        // The utility narrates on stderr; one `Extracting:` line per
        // finished file.
        let stderr = child.stderr.take().context("no stderr handle")?;
        let mut transcript = String::new();
        let mut completed = 0u64;
        let mut last_emit = Instant::now()
            .checked_sub(PROGRESS_INTERVAL)
            .unwrap_or_else(Instant::now);
        for line in BufReader::new(stderr).lines() {
            let line = line?;
            if let Some(path) = line.split("Extracting:").nth(1) {
                completed += 1;
                if let Some(cb) = on_progress.as_deref_mut() {
                    if last_emit.elapsed() >= PROGRESS_INTERVAL {
                        cb(completed, path.trim());
                        last_emit = Instant::now();
                    }
                }
            }
            transcript.push_str(&line);
            transcript.push('\n');
        }

        let status = child.wait()?;
        if let Some(t) = stdin_thread {
            t.join().ok();
        }
        transcript.push_str(&stdout_thread.join().unwrap_or_default());

        if !status.success() && !transcript.contains("Done,") {
            return Err(ToolError::ExternalTool(format!(
                "{} extract-files exited with {status}: {}",
                self.tool.display(),
                last_lines(&transcript, 5)
            ))
            .into());
        }

        let stats = match parse_done(&transcript) {
            Some(stats) => stats,
            None => {
                warn!("no terminating summary from the extractor, using counted progress");
                ExtractStats {
                    extracted: completed,
                    total: paths.len() as u64,
                    missed: 0,
                }
            }
        };
        if let Some(cb) = on_progress.as_deref_mut() {
            cb(stats.extracted, "");
        }
        Ok(stats)
    }

    /// Extracts everything matching `pattern`. With `exclude_languages`
    /// the index is enumerated first so localised duplicates can be
    /// dropped before extraction.
    pub fn extract_by_pattern(
        &self,
        archive: &Path,
        output_dir: &Path,
        pattern: &str,
        exclude_languages: bool,
        on_progress: Option<&mut dyn FnMut(u64, &str)>,
    ) -> anyhow::Result<ExtractStats> {
        if !exclude_languages {
            return self.extract_by_paths(
                archive,
                output_dir,
                &[pattern.to_string()],
                true,
                on_progress,
            );
        }

        let re = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .with_context(|| format!("invalid extraction pattern '{pattern}'"))?;

        let listing = self.list_files(archive)?;
        let selected: Vec<String> = listing
            .paths
            .into_iter()
            .filter(|p| re.is_match(p) && !is_language_path(p))
            .collect();

        if selected.is_empty() {
            return Ok(ExtractStats::default());
        }
        self.extract_by_paths(archive, output_dir, &selected, false, on_progress)
    }
}

fn parse_index_counts(stderr: &str) -> (Option<u64>, Option<u64>) {
    let mut bundles = None;
    let mut files = None;
    for line in stderr.lines() {
        if line.contains("Bundle count in index binary:") {
            bundles = trailing_number(line);
        } else if line.contains("File count in index binary:") {
            files = trailing_number(line);
        }
    }
    (bundles, files)
}

fn trailing_number(line: &str) -> Option<u64> {
    line.rsplit(':').next()?.trim().parse().ok()
}

fn parse_done(output: &str) -> Option<ExtractStats> {
    let captures = DONE_LINE.captures(output)?;
    Some(ExtractStats {
        extracted: captures[1].parse().ok()?,
        total: captures[2].parse().ok()?,
        missed: captures[3].parse().ok()?,
    })
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().rev().take(n).collect();
    lines.into_iter().rev().collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_paths_are_recognised() {
        assert!(is_language_path("metadata/french/ui.txt"));
        assert!(is_language_path("data.Traditional Chinese.index"));
        assert!(is_language_path("art/GERMAN/foo.dds"));
        assert!(!is_language_path("art/2dart/skillicons/fireball.dds"));
        assert!(!is_language_path("data/frenchvanilla/x.txt"));
    }

    #[test]
    fn index_counts_parse_from_summary_lines() {
        let stderr = "Reading index...\n\
                      Bundle count in index binary: 512\n\
                      File count in index binary: 123456\n";
        assert_eq!(parse_index_counts(stderr), (Some(512), Some(123456)));
        assert_eq!(parse_index_counts("nothing here"), (None, None));
    }

    #[test]
    fn done_line_parses() {
        let out = "Extracting: a\nExtracting: b\nDone, 2/3 extracted, 1 missed.\n";
        let stats = parse_done(out).unwrap();
        assert_eq!(stats.extracted, 2);
        assert_eq!(stats.total, 3);
        assert_eq!(stats.missed, 1);
        assert!(parse_done("no summary").is_none());
    }

    #[cfg(unix)]
    fn fake_tool(dir: &Path, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-extractor.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{script}")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[cfg(unix)]
    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "poe2-ggpk-bundle-{}-{name}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[cfg(unix)]
    #[test]
    fn list_files_reads_stdout_and_counts() {
        let dir = temp_dir("list");
        let tool = fake_tool(
            &dir,
            "echo 'data/mods.datc64'\n\
             echo 'art/ui/icon.dds'\n\
             echo 'Bundle count in index binary: 2' >&2\n\
             echo 'File count in index binary: 2' >&2\n",
        );

        let listing = BundleClient::new(&tool)
            .list_files(Path::new("archive.ggpk"))
            .unwrap();
        assert_eq!(listing.bundle_count, 2);
        assert_eq!(listing.file_count, 2);
        assert_eq!(listing.paths, vec!["data/mods.datc64", "art/ui/icon.dds"]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[cfg(unix)]
    #[test]
    fn extract_streams_progress_and_parses_summary() {
        let dir = temp_dir("extract");
        let tool = fake_tool(
            &dir,
            "echo 'Extracting: data/a.datc64' >&2\n\
             echo 'Extracting: data/b.datc64' >&2\n\
             echo 'Done, 2/2 extracted, 0 missed.' >&2\n",
        );

        let out_dir = dir.join("out");
        let mut seen = Vec::new();
        let mut cb = |count: u64, path: &str| seen.push((count, path.to_string()));
        let stats = BundleClient::new(&tool)
            .extract_by_paths(
                Path::new("archive.ggpk"),
                &out_dir,
                &["data/a.datc64".to_string(), "data/b.datc64".to_string()],
                false,
                Some(&mut cb),
            )
            .unwrap();

        assert_eq!(stats.extracted, 2);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.missed, 0);
        assert!(!seen.is_empty());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[cfg(unix)]
    #[test]
    fn failure_without_sentinel_is_an_error() {
        let dir = temp_dir("fail");
        let tool = fake_tool(&dir, "echo 'it broke' >&2\nexit 3\n");

        let err = BundleClient::new(&tool)
            .extract_by_paths(
                Path::new("archive.ggpk"),
                &dir.join("out"),
                &["x".to_string()],
                false,
                None,
            )
            .unwrap_err();
        assert!(err.to_string().contains("extract-files"));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[cfg(unix)]
    #[test]
    fn long_path_lists_travel_over_stdin() {
        let dir = temp_dir("stdin");
        // The fake tool counts the lines it receives on stdin.
        let tool = fake_tool(
            &dir,
            "n=$(wc -l | tr -d ' ')\n\
             echo \"Done, $n/$n extracted, 0 missed.\" >&2\n",
        );

        let paths: Vec<String> = (0..60).map(|i| format!("data/file{i}.bin")).collect();
        let stats = BundleClient::new(&tool)
            .extract_by_paths(Path::new("archive.ggpk"), &dir.join("out"), &paths, false, None)
            .unwrap();
        assert_eq!(stats.extracted, 60);

        std::fs::remove_dir_all(&dir).ok();
    }
}
