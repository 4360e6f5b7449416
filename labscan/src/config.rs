//! User config file: fills in whatever the flags and environment left
//! unset. Layering is CLI > environment > file > built-in default.

use std::path::{Path, PathBuf};

use observability_deps::tracing::debug;
use serde::Deserialize;

/// `~/.labscan/config.toml` (or `$LABSCAN_CONFIG`).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    /// Default data directory for the recorder.
    pub datapath: Option<PathBuf>,
    /// Default catalog database URL.
    pub db_url: Option<String>,
    /// Default recorder port.
    pub port: Option<u16>,
    /// Default submission-server port.
    pub server_port: Option<u16>,
    /// Default log filter.
    pub log_filter: Option<String>,
}

impl FileConfig {
    /// Load the config file; a missing or unreadable file is simply an
    /// empty config.
    pub fn load(explicit: Option<&Path>) -> Self {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => match config_root() {
                Some(root) => root.join("config.toml"),
                None => return Self::default(),
            },
        };
        match std::fs::read_to_string(&path) {
            Ok(text) => match toml::from_str(&text) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("ignoring malformed config {}: {e}", path.display());
                    Self::default()
                }
            },
            Err(_) => {
                debug!(path = %path.display(), "no config file");
                Self::default()
            }
        }
    }

    /// The data directory to use when nothing else was given.
    pub fn default_datapath(&self) -> PathBuf {
        self.datapath.clone().unwrap_or_else(|| {
            config_root()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("data")
        })
    }
}

fn config_root() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".labscan"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_is_empty_config() {
        let config = FileConfig::load(Some(Path::new("/nonexistent/config.toml")));
        assert!(config.datapath.is_none());
        assert!(config.port.is_none());
    }

    #[test]
    fn file_values_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "datapath = \"/srv/lab\"\nport = 7000").unwrap();

        let config = FileConfig::load(Some(&path));
        assert_eq!(config.datapath, Some(PathBuf::from("/srv/lab")));
        assert_eq!(config.port, Some(7000));
        assert_eq!(config.default_datapath(), PathBuf::from("/srv/lab"));
    }

    #[test]
    fn malformed_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "port = \"not a number").unwrap();
        let config = FileConfig::load(Some(&path));
        assert!(config.port.is_none());
    }
}
