//! Daemon configuration.
//!
//! Both daemons read a JSON config file; every field has a default so a
//! minimal file (or none at all for throwaway setups) works. Command
//! line switches override file values - that logic lives in the
//! binaries.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{format_err, Error};
use serde::Deserialize;

fn default_storage_listen() -> String {
    "0.0.0.0:7790".to_string()
}

fn default_manager_listen() -> String {
    "0.0.0.0:7780".to_string()
}

fn default_data_path() -> PathBuf {
    PathBuf::from("/var/lib/metis")
}

fn default_meta_path() -> PathBuf {
    PathBuf::from("/etc/metis/meta.json")
}

fn default_workers() -> usize {
    4
}

fn default_worker_queue_length() -> usize {
    1024
}

fn default_min_disk_free() -> f64 {
    0.05
}

fn default_max_slice_size() -> u32 {
    1024 * 1024 * 1024
}

fn default_cmd_timeout_secs() -> u64 {
    5
}

fn default_max_connections_per_storage() -> usize {
    8
}

fn default_max_object_size() -> u32 {
    64 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration of a storage daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Root directory holding `<level>/<sub_level>/{data,index}` trees.
    #[serde(default = "default_data_path")]
    pub data_path: PathBuf,
    #[serde(default = "default_storage_listen")]
    pub listen: String,
    #[serde(default)]
    pub server_id: u32,
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Bound on concurrently served connections.
    #[serde(default = "default_worker_queue_length")]
    pub worker_queue_length: usize,
    /// Fraction of the filesystem that must stay free; PUTs violating
    /// the floor answer NO_SPACE.
    #[serde(default = "default_min_disk_free")]
    pub min_disk_free: f64,
    #[serde(default = "default_max_slice_size")]
    pub max_slice_size: u32,
    /// Sync data and index files before a write is acknowledged.
    #[serde(default)]
    pub fsync: bool,
    /// Peer storages receiving asynchronous PUT/DELETE replication.
    #[serde(default)]
    pub sync_peers: Vec<String>,
    /// Pull missing items from sync peers once at startup.
    #[serde(default)]
    pub pull_on_start: bool,
    #[serde(default = "default_cmd_timeout_secs")]
    pub cmd_timeout_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

impl StorageConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        load_json(path)
    }

    pub fn cmd_timeout(&self) -> Duration {
        Duration::from_secs(self.cmd_timeout_secs)
    }
}

/// Configuration of a manager daemon.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManagerConfig {
    #[serde(default = "default_manager_listen")]
    pub listen: String,
    #[serde(default)]
    pub server_id: u32,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_worker_queue_length")]
    pub worker_queue_length: usize,
    /// Metadata store location (range and storage rows).
    #[serde(default = "default_meta_path")]
    pub meta_path: PathBuf,
    #[serde(default = "default_min_disk_free")]
    pub min_disk_free: f64,
    #[serde(default = "default_max_connections_per_storage")]
    pub max_connections_per_storage: usize,
    /// Largest accepted PUT body; the dispatch additionally bounds it
    /// by what one wire command may declare (frame limit minus the
    /// item header).
    #[serde(default = "default_max_object_size")]
    pub max_object_size: u32,
    #[serde(default = "default_cmd_timeout_secs")]
    pub cmd_timeout_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_path: Option<PathBuf>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        serde_json::from_str("{}").unwrap()
    }
}

impl ManagerConfig {
    pub fn load(path: &Path) -> Result<Self, Error> {
        load_json(path)
    }

    pub fn cmd_timeout(&self) -> Duration {
        Duration::from_secs(self.cmd_timeout_secs)
    }
}

fn load_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, Error> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| format_err!("unable to read config {:?} - {}", path, err))?;
    serde_json::from_str(&raw)
        .map_err(|err| format_err!("unable to parse config {:?} - {}", path, err))
}
