use std::path::{Path, PathBuf};

use crate::error::Result;
use crate::log::{CastleLog, LOG_EXTENSION};

// ---------------------------------------------------------------------------
// File name constants
// ---------------------------------------------------------------------------

pub const CLUSTER_FILE_NAME: &str = "cluster.conf";
pub const CONFIG_FILE_NAME: &str = "castle.yaml";
pub const CLUSTER_LOG_NAME: &str = "cluster";

// ---------------------------------------------------------------------------
// CastleEnvironment
// ---------------------------------------------------------------------------

/// Paths derived from the working directory of one castle run.
#[derive(Debug, Clone)]
pub struct CastleEnvironment {
    working_directory: PathBuf,
}

impl CastleEnvironment {
    /// Resolve `working_directory` to an absolute path. An empty path means
    /// the current directory.
    pub fn new(working_directory: impl AsRef<Path>) -> Self {
        Self {
            working_directory: to_absolute_path(working_directory.as_ref()),
        }
    }

    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    pub fn cluster_output_path(&self) -> PathBuf {
        self.working_directory.join(CLUSTER_FILE_NAME)
    }

    pub fn config_path(&self) -> PathBuf {
        self.working_directory.join(CONFIG_FILE_NAME)
    }

    pub fn node_log_path(&self, node_name: &str) -> PathBuf {
        self.working_directory
            .join(format!("{node_name}.{LOG_EXTENSION}"))
    }

    pub fn create_castle_log(&self, node_name: &str, enable_debug: bool) -> Result<CastleLog> {
        CastleLog::from_file(&self.working_directory, node_name, enable_debug)
    }
}

fn to_absolute_path(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    if path.as_os_str().is_empty() {
        cwd
    } else {
        cwd.join(path)
    }
}
