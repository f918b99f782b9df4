use std::{
    collections::BTreeMap,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;

const DEFAULT_LOG_MAX_LINES: usize = 1000;
const DEFAULT_LOG_FILE_MAX_BYTES: u64 = 10 * 1024 * 1024; // 10 MiB
const DEFAULT_LOG_FILE_MAX_FILES: usize = 3;
const DEFAULT_SUBSCRIBER_QUEUE: usize = 256;
const DEFAULT_UPLOAD_MAX_BYTES: usize = 512 * 1024 * 1024;

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_usize(name: &str) -> Option<usize> {
    env_string(name).and_then(|v| v.parse::<usize>().ok())
}

fn env_u64(name: &str) -> Option<u64> {
    env_string(name).and_then(|v| v.parse::<u64>().ok())
}

/// How to turn an installed instance into a command line.
///
/// `{version}`, `{ram}` and `{port}` are replaced from the instance's version and properties.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct LaunchTemplate {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl Default for LaunchTemplate {
    fn default() -> Self {
        Self {
            program: "java".to_string(),
            args: vec![
                "-Xmx{ram}M".to_string(),
                "-jar".to_string(),
                "server.jar".to_string(),
                "nogui".to_string(),
            ],
            env: BTreeMap::new(),
        }
    }
}

/// Console conventions of the supervised server binary.
///
/// Only plain substring matching is used; nothing here is tied to a specific game.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct ConsoleDialect {
    /// Substring of an output line meaning "ready to accept players".
    pub ready_marker: Option<String>,
    pub join_suffix: Option<String>,
    pub leave_suffix: Option<String>,
    pub stop_command: Option<String>,
    pub save_off_command: Option<String>,
    pub save_all_command: Option<String>,
    pub save_on_command: Option<String>,
    /// Lowercase substrings that confirm a completed save.
    pub save_keywords: Vec<String>,
    /// Command templates; `{player}` is replaced.
    pub op_command: Option<String>,
    pub deop_command: Option<String>,
    pub ban_command: Option<String>,
    pub pardon_command: Option<String>,
    /// File whose presence marks a directory as a world.
    pub world_marker: Option<String>,
}

impl Default for ConsoleDialect {
    fn default() -> Self {
        Self {
            ready_marker: Some("Done (".to_string()),
            join_suffix: Some(" joined the game".to_string()),
            leave_suffix: Some(" left the game".to_string()),
            stop_command: Some("stop".to_string()),
            save_off_command: Some("save-off".to_string()),
            save_all_command: Some("save-all flush".to_string()),
            save_on_command: Some("save-on".to_string()),
            save_keywords: vec![
                "saved the game".to_string(),
                "all chunks are saved".to_string(),
            ],
            op_command: Some("op {player}".to_string()),
            deop_command: Some("deop {player}".to_string()),
            ban_command: Some("ban {player}".to_string()),
            pardon_command: Some("pardon {player}".to_string()),
            world_marker: Some("level.dat".to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub data_root: PathBuf,
    pub bind: SocketAddr,
    pub log_max_lines: usize,
    pub log_file_max_bytes: u64,
    pub log_file_max_files: usize,
    pub resource_sample_interval: Duration,
    pub ready_timeout: Duration,
    pub stop_timeout: Duration,
    pub term_grace: Duration,
    pub save_timeout: Duration,
    pub subscriber_queue: usize,
    pub upload_max_bytes: usize,
    pub dist_root: PathBuf,
    pub launch: LaunchTemplate,
    pub dialect: ConsoleDialect,
}

impl Default for AgentConfig {
    fn default() -> Self {
        let data_root = PathBuf::from("./data");
        Self {
            dist_root: data_root.join("dist"),
            data_root,
            bind: ([0, 0, 0, 0], 8080).into(),
            log_max_lines: DEFAULT_LOG_MAX_LINES,
            log_file_max_bytes: DEFAULT_LOG_FILE_MAX_BYTES,
            log_file_max_files: DEFAULT_LOG_FILE_MAX_FILES,
            resource_sample_interval: Duration::from_millis(2000),
            ready_timeout: Duration::from_secs(180),
            stop_timeout: Duration::from_secs(30),
            term_grace: Duration::from_secs(5),
            save_timeout: Duration::from_secs(20),
            subscriber_queue: DEFAULT_SUBSCRIBER_QUEUE,
            upload_max_bytes: DEFAULT_UPLOAD_MAX_BYTES,
            launch: LaunchTemplate::default(),
            dialect: ConsoleDialect::default(),
        }
    }
}

/// On-disk shape of `ANVIL_CONFIG`. Every field is optional.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct FileConfig {
    data_root: Option<PathBuf>,
    bind: Option<SocketAddr>,
    log_max_lines: Option<usize>,
    log_file_max_bytes: Option<u64>,
    log_file_max_files: Option<usize>,
    resource_sample_interval_ms: Option<u64>,
    ready_timeout_ms: Option<u64>,
    stop_timeout_ms: Option<u64>,
    term_grace_ms: Option<u64>,
    save_timeout_ms: Option<u64>,
    subscriber_queue: Option<usize>,
    upload_max_bytes: Option<usize>,
    dist_root: Option<PathBuf>,
    launch: Option<LaunchTemplate>,
    dialect: Option<ConsoleDialect>,
}

impl AgentConfig {
    /// Defaults, then the optional TOML file named by `ANVIL_CONFIG`, then `ANVIL_*` env vars.
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = Self::default();
        if let Some(path) = env_string("ANVIL_CONFIG") {
            cfg.apply_file(Path::new(&path))?;
        }
        cfg.apply_env();
        cfg.data_root = absolutize(&cfg.data_root);
        cfg.dist_root = absolutize(&cfg.dist_root);
        Ok(cfg)
    }

    fn apply_file(&mut self, path: &Path) -> anyhow::Result<()> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        self.apply_toml(&raw)
            .with_context(|| format!("parse config {}", path.display()))
    }

    pub fn apply_toml(&mut self, raw: &str) -> anyhow::Result<()> {
        let f: FileConfig = toml::from_str(raw)?;
        if let Some(v) = f.data_root {
            if f.dist_root.is_none() {
                self.dist_root = v.join("dist");
            }
            self.data_root = v;
        }
        if let Some(v) = f.dist_root {
            self.dist_root = v;
        }
        if let Some(v) = f.bind {
            self.bind = v;
        }
        if let Some(v) = f.log_max_lines {
            self.log_max_lines = clamp_log_lines(v);
        }
        if let Some(v) = f.log_file_max_bytes {
            self.log_file_max_bytes = clamp_log_bytes(v);
        }
        if let Some(v) = f.log_file_max_files {
            self.log_file_max_files = v.clamp(1, 20);
        }
        if let Some(v) = f.resource_sample_interval_ms {
            self.resource_sample_interval = sample_interval(v);
        }
        if let Some(v) = f.ready_timeout_ms {
            self.ready_timeout = ready_timeout(v);
        }
        if let Some(v) = f.stop_timeout_ms {
            self.stop_timeout = stop_timeout(v);
        }
        if let Some(v) = f.term_grace_ms {
            self.term_grace = term_grace(v);
        }
        if let Some(v) = f.save_timeout_ms {
            self.save_timeout = save_timeout(v);
        }
        if let Some(v) = f.subscriber_queue {
            self.subscriber_queue = v.clamp(16, 65_536);
        }
        if let Some(v) = f.upload_max_bytes {
            self.upload_max_bytes = clamp_upload(v);
        }
        if let Some(v) = f.launch {
            self.launch = v;
        }
        if let Some(v) = f.dialect {
            self.dialect = v;
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_string("ANVIL_DATA_ROOT") {
            let root = PathBuf::from(v);
            if env_string("ANVIL_DIST_ROOT").is_none() {
                self.dist_root = root.join("dist");
            }
            self.data_root = root;
        }
        if let Some(v) = env_string("ANVIL_DIST_ROOT") {
            self.dist_root = PathBuf::from(v);
        }
        if let Some(v) = env_string("ANVIL_BIND").and_then(|v| v.parse().ok()) {
            self.bind = v;
        }
        if let Some(v) = env_usize("ANVIL_LOG_MAX_LINES") {
            self.log_max_lines = clamp_log_lines(v);
        }
        if let Some(v) = env_u64("ANVIL_LOG_FILE_MAX_BYTES") {
            self.log_file_max_bytes = clamp_log_bytes(v);
        }
        if let Some(v) = env_usize("ANVIL_LOG_FILE_MAX_FILES") {
            self.log_file_max_files = v.clamp(1, 20);
        }
        if let Some(v) = env_u64("ANVIL_RESOURCE_SAMPLE_INTERVAL_MS") {
            self.resource_sample_interval = sample_interval(v);
        }
        if let Some(v) = env_u64("ANVIL_READY_TIMEOUT_MS") {
            self.ready_timeout = ready_timeout(v);
        }
        if let Some(v) = env_u64("ANVIL_STOP_TIMEOUT_MS") {
            self.stop_timeout = stop_timeout(v);
        }
        if let Some(v) = env_u64("ANVIL_TERM_GRACE_MS") {
            self.term_grace = term_grace(v);
        }
        if let Some(v) = env_u64("ANVIL_SAVE_TIMEOUT_MS") {
            self.save_timeout = save_timeout(v);
        }
        if let Some(v) = env_usize("ANVIL_SUBSCRIBER_QUEUE") {
            self.subscriber_queue = v.clamp(16, 65_536);
        }
        if let Some(v) = env_usize("ANVIL_UPLOAD_MAX_BYTES") {
            self.upload_max_bytes = clamp_upload(v);
        }
    }

    pub fn instances_dir(&self) -> PathBuf {
        self.data_root.join("instances")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.data_root.join("backups")
    }

    pub fn uploads_dir(&self) -> PathBuf {
        self.data_root.join("uploads")
    }
}

fn clamp_log_lines(v: usize) -> usize {
    v.clamp(100, 50_000)
}

fn clamp_log_bytes(v: u64) -> u64 {
    v.clamp(256 * 1024, 1024 * 1024 * 1024)
}

fn clamp_upload(v: usize) -> usize {
    v.clamp(1024 * 1024, 1024 * 1024 * 1024)
}

fn sample_interval(ms: u64) -> Duration {
    Duration::from_millis(ms.clamp(250, 60_000))
}

fn ready_timeout(ms: u64) -> Duration {
    Duration::from_millis(ms.clamp(1000, 30 * 60 * 1000))
}

fn stop_timeout(ms: u64) -> Duration {
    Duration::from_millis(ms.clamp(1000, 10 * 60 * 1000))
}

fn term_grace(ms: u64) -> Duration {
    Duration::from_millis(ms.clamp(100, 60_000))
}

fn save_timeout(ms: u64) -> Duration {
    Duration::from_millis(ms.clamp(500, 10 * 60 * 1000))
}

fn absolutize(p: &Path) -> PathBuf {
    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };

    // Best-effort canonicalization: don't fail if the directory doesn't exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_overrides_and_clamps() {
        let mut cfg = AgentConfig::default();
        cfg.apply_toml(
            r#"
data_root = "/srv/anvil"
log_max_lines = 5
stop_timeout_ms = 2500

[launch]
program = "/bin/sh"
args = ["run.sh", "{version}"]

[dialect]
ready_marker = "READY"
save_keywords = ["saved"]
"#,
        )
        .unwrap();

        assert_eq!(cfg.data_root, PathBuf::from("/srv/anvil"));
        assert_eq!(cfg.dist_root, PathBuf::from("/srv/anvil/dist"));
        assert_eq!(cfg.log_max_lines, 100);
        assert_eq!(cfg.stop_timeout, Duration::from_millis(2500));
        assert_eq!(cfg.launch.program, "/bin/sh");
        assert_eq!(cfg.dialect.ready_marker.as_deref(), Some("READY"));
        // Unset dialect fields fall back to defaults.
        assert_eq!(cfg.dialect.stop_command.as_deref(), Some("stop"));
    }

    #[test]
    fn rejects_malformed_toml() {
        let mut cfg = AgentConfig::default();
        assert!(cfg.apply_toml("log_max_lines = \"many\"").is_err());
    }
}
