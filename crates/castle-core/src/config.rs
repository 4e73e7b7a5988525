use crate::environment::CastleEnvironment;
use crate::error::Result;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// CastleConfig
// ---------------------------------------------------------------------------

/// Run settings read from `castle.yaml` in the working directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CastleConfig {
    /// Upper bound on concurrently executing action instances.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Enables the gated debug channel on every node and cluster log.
    #[serde(default)]
    pub debug: bool,
    /// Docker CLI used by the Docker uplink.
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,
    /// Grace period handed to `docker stop` before the container is removed.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
}

fn default_max_workers() -> usize {
    8
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

fn default_stop_timeout() -> u64 {
    10
}

impl Default for CastleConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            debug: false,
            docker_binary: default_docker_binary(),
            stop_timeout_secs: default_stop_timeout(),
        }
    }
}

impl CastleConfig {
    /// Load `castle.yaml`, falling back to defaults when the file is absent.
    pub fn load(env: &CastleEnvironment) -> Result<Self> {
        let path = env.config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: CastleConfig = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, env: &CastleEnvironment) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&env.config_path(), data.as_bytes())
    }

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.max_workers == 0 {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "max_workers=0 would never run anything; using 1".to_string(),
            });
        }

        if self.docker_binary.trim().is_empty() {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message: "docker_binary must not be empty".to_string(),
            });
        }

        warnings
    }

    /// Worker pool size actually used by the scheduler.
    pub fn effective_max_workers(&self) -> usize {
        self.max_workers.max(1)
    }
}
