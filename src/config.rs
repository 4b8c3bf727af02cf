use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure that can be loaded from CLI or a config file
///
/// Example configuration file content
/// # Video Merger Configuration
///
/// listen_on_port = 8501
/// permits = 1
/// workspace = "/var/tmp/video-merger"
///
/// # Finished jobs and their downloads are kept this long
/// retention_secs = 3600
///
/// # Request body limit for one merge submission
/// max_upload_mb = 2048
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[command(version, about, long_about = None)]
#[serde(default)]
pub struct Config {
    /// Port to listen on
    #[arg(short, long, default_value_t = default_port())]
    #[serde(default = "default_port")]
    pub listen_on_port: u16,

    /// Number of concurrent merge jobs
    #[arg(short, long, default_value_t = default_permits())]
    #[serde(default = "default_permits")]
    pub permits: usize,

    /// Scratch directory for uploads and merged outputs
    #[arg(short = 'w', long, default_value_t = default_workspace())]
    #[serde(default = "default_workspace")]
    pub workspace: String,

    /// Seconds a finished job and its download are kept
    #[arg(short, long, default_value_t = default_retention_secs())]
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Maximum size of one merge submission in MiB
    #[arg(short, long, default_value_t = default_max_upload_mb())]
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,

    /// Configuration file path
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_on_port: default_port(),
            permits: default_permits(),
            workspace: default_workspace(),
            retention_secs: default_retention_secs(),
            max_upload_mb: default_max_upload_mb(),
            config: None,
        }
    }
}

impl Config {
    /// Load configuration from CLI args, optionally merging with a config file
    pub fn load() -> Result<Self> {
        // First parse CLI args
        let mut config = Config::parse();

        // If a config file is specified, load it and merge
        if let Some(config_path) = &config.config {
            let file_config = Self::from_file(Path::new(config_path))?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge with file config, CLI args take precedence
    fn merge_with_file(mut self, file_config: Config) -> Self {
        // If CLI value is default, use file value
        if self.listen_on_port == default_port() {
            self.listen_on_port = file_config.listen_on_port;
        }
        if self.permits == default_permits() {
            self.permits = file_config.permits;
        }
        if self.workspace == default_workspace() {
            self.workspace = file_config.workspace;
        }
        if self.retention_secs == default_retention_secs() {
            self.retention_secs = file_config.retention_secs;
        }
        if self.max_upload_mb == default_max_upload_mb() {
            self.max_upload_mb = file_config.max_upload_mb;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.permits == 0 {
            return Err(anyhow::anyhow!("permits must be at least 1"));
        }
        if self.workspace.trim().is_empty() {
            return Err(anyhow::anyhow!("workspace cannot be empty"));
        }
        if self.retention_secs == 0 {
            return Err(anyhow::anyhow!("retention_secs must be greater than 0"));
        }
        if self.max_upload_mb == 0 {
            return Err(anyhow::anyhow!("max_upload_mb must be greater than 0"));
        }

        Ok(())
    }

    pub fn workspace_path(&self) -> PathBuf {
        PathBuf::from(&self.workspace)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

// Default value functions
fn default_port() -> u16 {
    8501
}

fn default_permits() -> usize {
    1
}

fn default_workspace() -> String {
    std::env::temp_dir()
        .join("video-merger")
        .to_string_lossy()
        .into_owned()
}

fn default_retention_secs() -> u64 {
    3600
}

fn default_max_upload_mb() -> usize {
    2048
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_values_fill_cli_defaults() {
        let file = Config {
            listen_on_port: 9000,
            permits: 3,
            retention_secs: 60,
            ..Config::default()
        };
        let cli = Config {
            permits: 2,
            ..Config::default()
        };

        let merged = cli.merge_with_file(file);
        assert_eq!(merged.listen_on_port, 9000);
        assert_eq!(merged.permits, 2);
        assert_eq!(merged.retention_secs, 60);
        assert_eq!(merged.max_upload_mb, default_max_upload_mb());
    }

    #[test]
    fn toml_file_is_partial() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merger.toml");
        std::fs::write(&path, "listen_on_port = 8600\nmax_upload_mb = 16\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.listen_on_port, 8600);
        assert_eq!(config.max_upload_bytes(), 16 * 1024 * 1024);
        assert_eq!(config.permits, 1);
        assert_eq!(config.retention(), Duration::from_secs(3600));
        assert!(config.config.is_none());
    }

    #[test]
    fn validation_rejects_zero_limits() {
        assert!(Config::default().validate().is_ok());
        for config in [
            Config {
                permits: 0,
                ..Config::default()
            },
            Config {
                retention_secs: 0,
                ..Config::default()
            },
            Config {
                max_upload_mb: 0,
                ..Config::default()
            },
            Config {
                workspace: " ".into(),
                ..Config::default()
            },
        ] {
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn cli_parses_long_flags() {
        let config = Config::parse_from([
            "video-merger",
            "--listen-on-port",
            "8700",
            "--permits",
            "2",
            "--retention-secs",
            "30",
        ]);
        assert_eq!(config.listen_on_port, 8700);
        assert_eq!(config.permits, 2);
        assert_eq!(config.retention_secs, 30);
        assert_eq!(config.workspace, default_workspace());
    }
}
