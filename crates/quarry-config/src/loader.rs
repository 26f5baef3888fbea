use std::path::{Path, PathBuf};

use quarry_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

const LOCAL_CANDIDATES: &[&str] = &["quarry.toml", "quarry.yml", "quarry.yaml"];
const USER_CANDIDATES: &[&str] = &["config.toml", "config.yml", "config.yaml"];

/// Locates and parses the Quarry config file.
pub struct ConfigLoader {
    search_dirs: Vec<(PathBuf, &'static [&'static str])>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        let mut search_dirs = vec![(PathBuf::from("."), LOCAL_CANDIDATES)];
        if let Some(dir) = dirs::config_dir() {
            search_dirs.push((dir.join("quarry"), USER_CANDIDATES));
        }
        Self { search_dirs }
    }
}

impl ConfigLoader {
    /// Search only `dir` for the local file names.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            search_dirs: vec![(dir.into(), LOCAL_CANDIDATES)],
        }
    }

    /// Load `explicit` if given, otherwise the first config file found,
    /// otherwise defaults.
    pub fn load(&self, explicit: Option<&Path>) -> Result<AppConfig> {
        if let Some(path) = explicit {
            if !path.is_file() {
                return Err(Error::Config(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            }
            return Self::load_file(path);
        }

        match self.discover() {
            Some(path) => Self::load_file(&path),
            None => {
                debug!("no config file found, using defaults");
                Ok(AppConfig::default())
            }
        }
    }

    pub fn discover(&self) -> Option<PathBuf> {
        self.search_dirs.iter().find_map(|(dir, names)| {
            names
                .iter()
                .map(|name| dir.join(name))
                .find(|candidate| candidate.is_file())
        })
    }

    pub fn load_file(path: &Path) -> Result<AppConfig> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let config = parse_config(path, &contents)?;
        info!("loaded config from {}", path.display());
        Ok(config)
    }
}

fn parse_config(path: &Path, contents: &str) -> Result<AppConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "yml" | "yaml" => serde_yaml::from_str(contents)
            .map_err(|e| Error::Config(format!("YAML parse error: {e}"))),
        "toml" => {
            toml::from_str(contents).map_err(|e| Error::Config(format!("TOML parse error: {e}")))
        }
        other => Err(Error::Config(format!(
            "unsupported config extension: {other}"
        ))),
    }
}
