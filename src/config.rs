//! Agent configuration and the process-config parser.
//!
//! The agent is configured by a directory (or single file) of JSON/YAML
//! documents, each declaring servers with their queries and output writers.
//! `parse_servers` turns the current set of files into the runtime model;
//! everything else here is the file discovery and filtering that feeds it.
//!
//! # Examples
//!
//! **YAML Format:**
//! ```yaml
//! servers:
//!   - host: app01.example.com
//!     port: 8778
//!     run_period_seconds: 30
//!     queries:
//!       - object_name: "java.lang:type=Memory"
//!         attributes: [HeapMemoryUsage]
//!         keys: [used, max]
//!         output_writers:
//!           - type: graphite
//!             host: graphite.example.com
//!             port: 2003
//! ```
//!
//! **JSON Format:**
//! ```json
//! {
//!   "servers": [
//!     {
//!       "host": "app01.example.com",
//!       "port": 8778,
//!       "queries": [
//!         {
//!           "object_name": "java.lang:type=Threading",
//!           "attributes": ["ThreadCount"],
//!           "output_writers": [{ "type": "console" }]
//!         }
//!       ]
//!     }
//!   ]
//! }
//! ```

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{error, warn};

use crate::error::AgentError;
use crate::executors::DEFAULT_POOL_CAPACITY;
use crate::model::{Query, Server};
use crate::output::WriterConfig;

/// Global default polling period, in seconds.
pub const DEFAULT_RUN_PERIOD: u64 = 60;

/// Resolved agent configuration, supplied by the CLI layer.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Directory of config files, or a single config file.
    pub config_path: PathBuf,
    /// Skip malformed config files instead of failing the reload.
    pub continue_on_error: bool,
    /// Default polling period for servers without their own.
    pub run_period_seconds: u64,
    /// Port for the `/metrics` endpoint; 0 disables it.
    pub metrics_port: u16,
    /// Queue bound for the per-server pools.
    pub pool_capacity: usize,
    /// How long scheduler shutdown waits for job tasks to wind down.
    pub scheduler_grace: Duration,
    /// How long a standalone run waits for jobs to drain before stopping.
    pub standalone_grace: Duration,
}

impl AgentConfig {
    pub fn new(config_path: PathBuf) -> Self {
        Self {
            config_path,
            continue_on_error: false,
            run_period_seconds: DEFAULT_RUN_PERIOD,
            metrics_port: 0,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            scheduler_grace: Duration::from_secs(5),
            standalone_grace: Duration::from_secs(10),
        }
    }

    /// The directory handed to the file watcher: the configured directory,
    /// or the parent when the configured path is a single file.
    pub fn watch_dir(&self) -> PathBuf {
        if self.config_path.is_file() {
            self.config_path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."))
        } else {
            self.config_path.clone()
        }
    }

    /// Is `path` a process-config file this agent should react to?
    ///
    /// In file-mode only the configured file counts. In dir-mode the name
    /// must not be hidden and must carry a `.json`/`.yml`/`.yaml` extension;
    /// paths that no longer exist are allowed through so deletions stay
    /// observable.
    pub fn is_process_config_file(&self, path: &Path) -> bool {
        if self.config_path.is_file() {
            return path == self.config_path;
        }
        if path.exists() && !path.is_file() {
            return false;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        !name.starts_with('.')
            && (name.ends_with(".json") || name.ends_with(".yml") || name.ends_with(".yaml"))
    }

    /// Enumerate the config files to parse right now.
    pub fn process_config_files(&self) -> Result<Vec<PathBuf>, AgentError> {
        if self.config_path.is_file() {
            return Ok(vec![self.config_path.clone()]);
        }
        if !self.config_path.is_dir() {
            return Err(AgentError::Config(format!(
                "configuration path {} is neither a file nor a directory",
                self.config_path.display()
            )));
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.config_path)
            .map_err(|e| {
                AgentError::Config(format!("cannot list {}: {e}", self.config_path.display()))
            })?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| self.is_process_config_file(path))
            .collect();
        files.sort();
        Ok(files)
    }
}

#[derive(Debug, Deserialize)]
struct ProcessDecl {
    #[serde(default)]
    servers: Vec<ServerDecl>,
}

#[derive(Debug, Deserialize)]
struct ServerDecl {
    host: String,
    port: u16,
    #[serde(default)]
    alias: Option<String>,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    cron: Option<String>,
    #[serde(default)]
    run_period_seconds: Option<u64>,
    #[serde(default)]
    output_writers: Vec<WriterConfig>,
    #[serde(default)]
    queries: Vec<QueryDecl>,
}

#[derive(Debug, Deserialize)]
struct QueryDecl {
    object_name: String,
    #[serde(default)]
    attributes: Vec<String>,
    #[serde(default)]
    result_alias: Option<String>,
    #[serde(default)]
    keys: Vec<String>,
    #[serde(default)]
    output_writers: Vec<WriterConfig>,
}

/// Parse `files` into the runtime server list, instantiating writers along
/// the way. With `continue_on_error` a malformed file is logged and skipped;
/// otherwise it fails the whole parse. Servers declaring the same
/// `host:port` are merged: the first declaration keeps its connection
/// settings, later ones only contribute queries.
pub fn parse_servers(
    files: &[PathBuf],
    continue_on_error: bool,
) -> Result<Vec<Arc<Server>>, AgentError> {
    let mut order: Vec<String> = Vec::new();
    let mut merged: HashMap<String, ServerDecl> = HashMap::new();

    for file in files {
        let decl = match parse_file(file) {
            Ok(decl) => decl,
            Err(e) if continue_on_error => {
                error!(file = %file.display(), error = %e, "skipping malformed config file");
                continue;
            }
            Err(e) => return Err(e),
        };
        for server in decl.servers {
            let key = format!("{}:{}", server.host, server.port);
            match merged.entry(key.clone()) {
                Entry::Occupied(mut existing) => {
                    warn!(server = %key, "server declared more than once, merging queries");
                    existing.get_mut().queries.extend(server.queries);
                }
                Entry::Vacant(slot) => {
                    order.push(key);
                    slot.insert(server);
                }
            }
        }
    }

    Ok(order
        .into_iter()
        .map(|key| build_server(merged.remove(&key).expect("declared server")))
        .collect())
}

fn parse_file(path: &Path) -> Result<ProcessDecl, AgentError> {
    let contents = std::fs::read_to_string(path).map_err(|e| AgentError::ConfigParse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    let is_yaml = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e == "yml" || e == "yaml");
    if is_yaml {
        serde_yaml::from_str(&contents).map_err(|e| AgentError::ConfigParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    } else {
        serde_json::from_str(&contents).map_err(|e| AgentError::ConfigParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

fn build_server(decl: ServerDecl) -> Arc<Server> {
    let queries = decl
        .queries
        .into_iter()
        .map(|q| {
            Arc::new(Query {
                object_name: q.object_name,
                attributes: q.attributes,
                result_alias: q.result_alias,
                keys: q.keys,
                output_writers: q
                    .output_writers
                    .iter()
                    .map(|w| Arc::new(w.build()))
                    .collect(),
            })
        })
        .collect();
    Arc::new(Server {
        host: decl.host,
        port: decl.port,
        alias: decl.alias,
        username: decl.username,
        password: decl.password,
        cron: decl.cron,
        run_period_seconds: decl.run_period_seconds,
        queries,
        output_writers: decl
            .output_writers
            .iter()
            .map(|w| Arc::new(w.build()))
            .collect(),
    })
}
