use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::pipeline::{DEFAULT_FILENAME_PREFIX, ImageType, OutputFolder, OutputKind};
use crate::xmp::XmpFields;

/// Top-level configuration for the CLI.
///
/// Sets where images land and the defaults applied when a flag is not
/// given on the command line. Missing sections fall back to defaults.
///
/// # Loading
///
/// ```rust,no_run
/// use xmp_save::config::Config;
///
/// // From a JSON file
/// let config = Config::load(Some("config.json".as_ref())).unwrap();
///
/// // Or use defaults and customize
/// let mut config = Config::default();
/// config.defaults.filename_prefix = "portraits/shoot".into();
/// config.defaults.metadata.creator = Some("Jane Doe".into());
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Output root and record type.
    pub output: OutputConfig,
    /// Request defaults.
    pub defaults: SaveDefaults,
}

/// Where saved images are written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Root folder; the filename prefix may add subfolders below it.
    pub directory: PathBuf,
    /// Reported as `type` in every save record.
    pub kind: OutputKind,
}

/// Values used when the command line leaves them out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveDefaults {
    pub filename_prefix: String,
    pub image_type: ImageType,
    /// Metadata merged under whatever the command line supplies.
    pub metadata: XmpFields,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: PathBuf::from("output"),
            kind: OutputKind::Output,
        }
    }
}

impl Default for SaveDefaults {
    fn default() -> Self {
        Self {
            filename_prefix: DEFAULT_FILENAME_PREFIX.to_string(),
            image_type: ImageType::default(),
            metadata: XmpFields::default(),
        }
    }
}

impl Config {
    /// Default config location: `config.json` beside the running binary.
    pub fn config_path() -> Result<PathBuf> {
        let exe = std::env::current_exe().context("Cannot locate the xmp-save binary")?;
        exe.parent()
            .map(|dir| dir.join("config.json"))
            .context("The xmp-save binary has no parent directory")
    }

    fn resolve(path: Option<&Path>) -> Result<PathBuf> {
        path.map_or_else(Self::config_path, |p| Ok(p.to_path_buf()))
    }

    /// Read a config file. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = Self::resolve(path)?;

        let contents = match std::fs::read_to_string(&config_path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!(
                    "No config at {}, saving with built-in defaults",
                    config_path.display()
                );
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("Cannot read config {}", config_path.display())
                });
            }
        };

        serde_json::from_str(&contents)
            .with_context(|| format!("Invalid config {}", config_path.display()))
    }

    /// Write this config as pretty JSON.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let config_path = Self::resolve(path)?;
        let contents = serde_json::to_string_pretty(self).context("Cannot serialize config")?;
        std::fs::write(&config_path, contents)
            .with_context(|| format!("Cannot write config {}", config_path.display()))?;
        log::info!("Wrote config {}", config_path.display());
        Ok(())
    }

    /// Planner rooted at the configured output directory.
    pub fn output_folder(&self) -> OutputFolder {
        OutputFolder::new(&self.output.directory, self.output.kind)
    }
}
