use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use walkdir::WalkDir;

/// Coarse type tag for the browse/search surface, derived from the file
/// extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    Audio,
    Data,
    Json,
    Text,
    Other,
}

impl FileKind {
    pub fn from_path(path: &Path) -> FileKind {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return FileKind::Other;
        };
        match ext.to_ascii_lowercase().as_str() {
            "png" | "webp" | "jpg" | "jpeg" | "dds" => FileKind::Image,
            "ogg" | "wav" => FileKind::Audio,
            "dat" | "dat64" | "datc64" => FileKind::Data,
            "json" => FileKind::Json,
            "txt" | "csv" | "xml" => FileKind::Text,
            _ => FileKind::Other,
        }
    }

    pub fn parse(value: &str) -> Option<FileKind> {
        match value {
            "image" => Some(FileKind::Image),
            "audio" => Some(FileKind::Audio),
            "data" => Some(FileKind::Data),
            "json" => Some(FileKind::Json),
            "text" => Some(FileKind::Text),
            "other" => Some(FileKind::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileEntry {
    pub name: String,
    /// Parent folder with forward slashes; empty at the root.
    pub folder: String,
    pub path: String,
    pub size: u64,
    pub kind: FileKind,
}

/// Catalogue of the extracted output tree, persisted as a versioned
/// cache so restarts skip the disk walk.
#[derive(Debug, Serialize, Deserialize)]
pub struct FileIndex {
    cache_version: u32,
    pub base: PathBuf,
    /// Unix timestamp of the last rebuild.
    pub built_at: u64,
    pub files: Vec<FileEntry>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrowseResult {
    pub folder: String,
    pub files: Vec<FileEntry>,
    pub subfolders: Vec<String>,
    pub total: usize,
    pub page: usize,
    pub per_page: usize,
    pub has_more: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderNode {
    pub name: String,
    pub path: String,
    pub file_count: usize,
    pub children: Vec<FolderNode>,
}

impl FileIndex {
    pub const VERSION: u32 = 2;

    pub fn rebuild(base: &Path) -> FileIndex {
        let mut files = Vec::new();
        for entry in WalkDir::new(base).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(base) else {
                continue;
            };
            let path = rel.to_string_lossy().replace('\\', "/");
            let (folder, name) = match path.rsplit_once('/') {
                Some((folder, name)) => (folder.to_string(), name.to_string()),
                None => (String::new(), path.clone()),
            };
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            files.push(FileEntry {
                name,
                folder,
                kind: FileKind::from_path(entry.path()),
                size,
                path,
            });
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));

        info!("indexed {} extracted files under {}", files.len(), base.display());
        FileIndex {
            cache_version: Self::VERSION,
            base: base.to_path_buf(),
            built_at: unix_now(),
            files,
        }
    }

    /// Loads the persisted catalogue when its version and base path still
    /// match, otherwise rebuilds and rewrites it.
    pub fn load_or_rebuild(base: &Path, cache_path: &Path) -> FileIndex {
        if let Some(cached) = Self::read_cache(cache_path) {
            if cached.cache_version == Self::VERSION && cached.base == base {
                info!("loaded file index cache ({} files)", cached.files.len());
                return cached;
            }
            warn!("file index cache is stale, rebuilding");
        }

        let index = Self::rebuild(base);
        if let Err(e) = index.save(cache_path) {
            warn!("could not persist file index cache: {e:#}");
        }
        index
    }

    fn read_cache(cache_path: &Path) -> Option<FileIndex> {
        let file = std::fs::File::open(cache_path).ok()?;
        serde_json::from_reader(file).ok()
    }

    pub fn save(&self, cache_path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = cache_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        std::fs::write(cache_path, serde_json::to_vec(self)?)
            .with_context(|| format!("writing {}", cache_path.display()))?;
        Ok(())
    }

    /// Direct children of `folder` only; subfolders are derived from the
    /// descendant paths.
    pub fn browse(
        &self,
        folder: &str,
        page: usize,
        per_page: usize,
        kind: Option<FileKind>,
    ) -> BrowseResult {
        let folder = folder.trim_matches('/');
        let page = page.max(1);
        let per_page = per_page.max(1);

        let matching: Vec<&FileEntry> = self
            .files
            .iter()
            .filter(|f| f.folder == folder)
            .filter(|f| kind.map(|k| f.kind == k).unwrap_or(true))
            .collect();

        let mut subfolders: Vec<String> = Vec::new();
        let prefix = if folder.is_empty() {
            String::new()
        } else {
            format!("{folder}/")
        };
        for file in &self.files {
            if file.folder == folder || !file.folder.starts_with(&prefix) {
                continue;
            }
            let child = file.folder[prefix.len()..]
                .split('/')
                .next()
                .unwrap_or_default();
            if !child.is_empty() && subfolders.last().map(|s| s.as_str()) != Some(child) {
                subfolders.push(child.to_string());
            }
        }
        subfolders.sort();
        subfolders.dedup();

        let total = matching.len();
        let start = (page - 1).saturating_mul(per_page).min(total);
        let end = (start + per_page).min(total);
        let files = matching[start..end].iter().map(|f| (*f).clone()).collect();

        BrowseResult {
            folder: folder.to_string(),
            files,
            subfolders,
            total,
            page,
            per_page,
            has_more: end < total,
        }
    }

    /// Case-insensitive substring match against name and folder.
    pub fn search(&self, query: &str, kind: Option<FileKind>, limit: usize) -> Vec<FileEntry> {
        let needle = query.to_lowercase();
        self.files
            .iter()
            .filter(|f| kind.map(|k| f.kind == k).unwrap_or(true))
            .filter(|f| {
                f.name.to_lowercase().contains(&needle)
                    || f.folder.to_lowercase().contains(&needle)
            })
            .take(limit)
            .cloned()
            .collect()
    }

    /// The derived folder tree with per-node direct file counts.
    pub fn folder_tree(&self) -> FolderNode {
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        counts.insert(String::new(), 0);
        for file in &self.files {
            *counts.entry(file.folder.clone()).or_default() += 1;
            // Intermediate folders may hold no files directly.
            let mut ancestor = file.folder.as_str();
            while let Some((parent, _)) = ancestor.rsplit_once('/') {
                counts.entry(parent.to_string()).or_default();
                ancestor = parent;
            }
            if !file.folder.is_empty() {
                counts.entry(String::new()).or_default();
            }
        }

        build_node(String::new(), &counts)
    }
}

fn build_node(path: String, counts: &BTreeMap<String, usize>) -> FolderNode {
    let prefix = if path.is_empty() {
        String::new()
    } else {
        format!("{path}/")
    };

    let children = counts
        .keys()
        .filter(|k| !k.is_empty() && k.starts_with(&prefix) && **k != path)
        .filter(|k| !k[prefix.len()..].contains('/'))
        .map(|k| build_node(k.clone(), counts))
        .collect();

    FolderNode {
        name: path.rsplit('/').next().unwrap_or_default().to_string(),
        file_count: counts.get(&path).copied().unwrap_or(0),
        path,
        children,
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileIndex {
        let entries = [
            ("icon.png", "art/2dart", FileKind::Image),
            ("fireball.dds", "art/2dart/skillicons", FileKind::Image),
            ("mods.json", "data", FileKind::Json),
            ("mods.datc64", "data", FileKind::Data),
            ("readme.txt", "", FileKind::Text),
        ];
        FileIndex {
            cache_version: FileIndex::VERSION,
            base: PathBuf::from("/out"),
            built_at: 0,
            files: entries
                .iter()
                .map(|(name, folder, kind)| FileEntry {
                    name: name.to_string(),
                    folder: folder.to_string(),
                    path: if folder.is_empty() {
                        name.to_string()
                    } else {
                        format!("{folder}/{name}")
                    },
                    size: 1,
                    kind: *kind,
                })
                .collect(),
        }
    }

    #[test]
    fn browse_returns_direct_children_only() {
        let index = sample();
        let result = index.browse("art/2dart", 1, 100, None);
        assert_eq!(result.total, 1);
        assert_eq!(result.files[0].name, "icon.png");
        assert_eq!(result.subfolders, vec!["skillicons"]);
        assert!(!result.has_more);

        let root = index.browse("", 1, 100, None);
        assert_eq!(root.total, 1);
        assert_eq!(root.subfolders, vec!["art", "data"]);
    }

    #[test]
    fn browse_paginates() {
        let index = sample();
        let result = index.browse("data", 1, 1, None);
        assert_eq!(result.total, 2);
        assert_eq!(result.files.len(), 1);
        assert!(result.has_more);

        let result = index.browse("data", 2, 1, None);
        assert_eq!(result.files.len(), 1);
        assert!(!result.has_more);
    }

    #[test]
    fn browse_filters_by_kind() {
        let index = sample();
        let result = index.browse("data", 1, 100, Some(FileKind::Json));
        assert_eq!(result.total, 1);
        assert_eq!(result.files[0].name, "mods.json");
    }

    #[test]
    fn search_matches_name_and_folder() {
        let index = sample();
        let hits = index.search("MODS", None, 10);
        assert_eq!(hits.len(), 2);

        let hits = index.search("skillicons", None, 10);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "fireball.dds");

        let hits = index.search("mods", Some(FileKind::Data), 10);
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn folder_tree_counts_and_nests() {
        let index = sample();
        let tree = index.folder_tree();
        assert_eq!(tree.file_count, 1); // readme.txt
        assert_eq!(tree.children.len(), 2); // art, data

        let art = tree.children.iter().find(|n| n.name == "art").unwrap();
        assert_eq!(art.file_count, 0);
        let twodart = &art.children[0];
        assert_eq!(twodart.name, "2dart");
        assert_eq!(twodart.file_count, 1);
        assert_eq!(twodart.children[0].name, "skillicons");
        assert_eq!(twodart.children[0].file_count, 1);
    }

    #[test]
    fn rebuild_and_cache_round_trip() {
        let base = std::env::temp_dir().join(format!(
            "poe2-ggpk-index-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(base.join("data")).unwrap();
        std::fs::write(base.join("data/mods.json"), b"[]").unwrap();

        let cache = base.join("cache/index.json");
        let index = FileIndex::load_or_rebuild(&base, &cache);
        assert_eq!(index.files.len(), 1);
        assert!(cache.exists());

        // Cached copy satisfies the next load.
        let again = FileIndex::load_or_rebuild(&base, &cache);
        assert_eq!(again.files.len(), 1);
        assert_eq!(again.built_at, index.built_at);

        std::fs::remove_dir_all(&base).ok();
    }
}
