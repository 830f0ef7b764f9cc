use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Environment overrides for the two path settings.
pub const ENV_GAME_PATH: &str = "POE2_PATH";
pub const ENV_OUTPUT_DIR: &str = "POE2_OUTPUT_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Game install directory; the archive lives inside it.
    pub poe2_path: PathBuf,
    pub output_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub threads: usize,
    pub schema_path: PathBuf,
    pub tools: Tools,
    pub conversion: Conversion,
    pub extraction: Extraction,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            poe2_path: PathBuf::new(),
            output_dir: PathBuf::from("./extracted"),
            cache_dir: PathBuf::from("./cache"),
            threads: 4,
            schema_path: PathBuf::from("./schema.min.json"),
            tools: Tools::default(),
            conversion: Conversion::default(),
            extraction: Extraction::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Tools {
    /// Bundle-codec utility (`list-files` / `extract-files`).
    pub libggpk3: Option<PathBuf>,
    pub pypoe: Option<PathBuf>,
    pub ooz: Option<PathBuf>,
    /// DDS converter; falls back to `magick` on PATH.
    pub magick: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Conversion {
    pub dds: DdsConversion,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DdsConversion {
    pub format: ImageFormat,
    pub quality: u32,
    pub preserve_originals: bool,
}

impl Default for DdsConversion {
    fn default() -> Self {
        DdsConversion {
            format: ImageFormat::Webp,
            quality: 90,
            preserve_originals: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Webp,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Webp => "webp",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Extraction {
    /// User-defined pattern groups, merged over the built-in presets.
    pub patterns: FxHashMap<String, Vec<String>>,
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
        let path = path.as_ref();
        let raw = std::fs::read(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let mut config: Config = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Environment variables beat the file for the two path settings.
    pub fn apply_env(&mut self) {
        if let Ok(path) = std::env::var(ENV_GAME_PATH) {
            if !path.is_empty() {
                self.poe2_path = PathBuf::from(path);
            }
        }
        if let Ok(dir) = std::env::var(ENV_OUTPUT_DIR) {
            if !dir.is_empty() {
                self.output_dir = PathBuf::from(dir);
            }
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poe2_path.as_os_str().is_empty() {
            bail!("poe2Path is not set (config file or {ENV_GAME_PATH})");
        }
        Ok(())
    }

    /// The container archive inside the game install.
    pub fn archive_path(&self) -> PathBuf {
        self.poe2_path.join("Content.ggpk")
    }

    pub fn bundle_tool(&self) -> PathBuf {
        self.tools
            .libggpk3
            .clone()
            .unwrap_or_else(|| PathBuf::from("ExtractBundledGGPK3"))
    }

    pub fn image_tool(&self) -> PathBuf {
        self.tools
            .magick
            .clone()
            .unwrap_or_else(|| PathBuf::from("magick"))
    }
}
