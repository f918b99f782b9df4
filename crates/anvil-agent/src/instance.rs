//! One managed server instance: its record, console tail and live channels.
//!
//! Lock order is `record` → `logs` → `metrics`. Status and player events are
//! published while `record` is held, output lines while `logs` is held and
//! samples while `metrics` is held, so [`Instance::attach`] (which takes all
//! three) sees every event either in its snapshot or on its subscriptions.

use std::{
    collections::BTreeSet,
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use anvil_process::{
    InstanceEvent, InstanceId, InstanceSnapshot, InstanceSummary, PlayerSet, ResourceSample,
    Status, StatusChange, Subject, WorldGenerationSettings,
};
use tokio::sync::watch;

use crate::{
    config::{AgentConfig, ConsoleDialect},
    console::ConsoleSignal,
    console_log::{ConsoleLog, ConsoleTail},
    error::Result,
    event_bus::{EventSubscription, InstanceChannels},
    fsutil::write_json_atomic,
    properties::{self, Properties},
    state_machine::{self, LifecycleEvent},
    supervisor::{ExitInfo, ProcessObserver},
};

pub const RECORD_FILE: &str = "instance.json";
pub const PROPERTIES_FILE: &str = "server.properties";

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WorldEntry {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default, rename = "type")]
    pub world_type: Option<String>,
    /// Applied to the properties when the world becomes active and has not been generated yet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<WorldGenerationSettings>,
}

/// Persisted state of an instance (`instances/<id>/instance.json`).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub name: String,
    pub version: String,
    pub installed: bool,
    pub status: Status,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub worlds: Vec<WorldEntry>,
    #[serde(default)]
    pub properties: Properties,
    #[serde(default)]
    pub operators: BTreeSet<String>,
    #[serde(default)]
    pub banned: BTreeSet<String>,
    pub created_at_unix_ms: u64,
    #[serde(skip)]
    pub online: BTreeSet<String>,
}

impl InstanceRecord {
    pub fn summary(&self) -> InstanceSummary {
        InstanceSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            version: self.version.clone(),
            installed: self.installed,
            status: self.status,
            message: self.message.clone(),
        }
    }

    pub fn players(&self) -> PlayerSet {
        PlayerSet {
            online: self.online.clone(),
            operators: self.operators.clone(),
            banned: self.banned.clone(),
        }
    }

    /// Name of the world `level-name` points at.
    pub fn active_world(&self) -> Option<&str> {
        let level = properties::get_text(&self.properties, properties::LEVEL_NAME)?;
        let name = level.strip_prefix("worlds/").unwrap_or(level);
        Some(name)
    }

    pub fn has_world(&self, name: &str) -> bool {
        self.worlds.iter().any(|w| w.name == name)
    }
}

/// Knobs shared by every instance, taken from [`AgentConfig`].
#[derive(Debug, Clone)]
pub struct InstanceSettings {
    pub log_max_lines: usize,
    pub log_file_max_bytes: u64,
    pub log_file_max_files: usize,
    pub subscriber_queue: usize,
    pub dialect: Arc<ConsoleDialect>,
}

impl InstanceSettings {
    pub fn from_config(cfg: &AgentConfig) -> Self {
        Self {
            log_max_lines: cfg.log_max_lines,
            log_file_max_bytes: cfg.log_file_max_bytes,
            log_file_max_files: cfg.log_file_max_files,
            subscriber_queue: cfg.subscriber_queue,
            dialect: Arc::new(cfg.dialect.clone()),
        }
    }
}

/// Live subscriptions returned by [`Instance::attach`].
#[derive(Debug)]
pub struct Attached {
    pub output: EventSubscription,
    pub metrics: EventSubscription,
    pub players: EventSubscription,
    pub status: EventSubscription,
}

#[derive(Debug)]
pub struct Instance {
    id: InstanceId,
    root: PathBuf,
    dialect: Arc<ConsoleDialect>,
    channels: InstanceChannels,
    record: Mutex<InstanceRecord>,
    logs: Mutex<ConsoleTail>,
    metrics: Mutex<Option<ResourceSample>>,
    console_log: ConsoleLog,
    status_tx: watch::Sender<Status>,
    generation: AtomicU64,
    retired: AtomicBool,
    persist_lock: tokio::sync::Mutex<()>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

impl Instance {
    /// Must be called from within a tokio runtime (the console log writer is a task).
    pub fn new(root: PathBuf, record: InstanceRecord, settings: &InstanceSettings) -> Arc<Self> {
        let console_log = ConsoleLog::spawn(
            root.join("logs").join("console.log"),
            settings.log_file_max_bytes,
            settings.log_file_max_files,
        );
        let (status_tx, _) = watch::channel(record.status);
        Arc::new(Self {
            id: record.id.clone(),
            root,
            dialect: settings.dialect.clone(),
            channels: InstanceChannels::new(settings.subscriber_queue),
            record: Mutex::new(record),
            logs: Mutex::new(ConsoleTail::new(settings.log_max_lines)),
            metrics: Mutex::new(None),
            console_log,
            status_tx,
            generation: AtomicU64::new(0),
            retired: AtomicBool::new(false),
            persist_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn id(&self) -> &InstanceId {
        &self.id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn worlds_dir(&self) -> PathBuf {
        self.root.join("worlds")
    }

    pub fn world_dir(&self, name: &str) -> PathBuf {
        self.worlds_dir().join(name)
    }

    pub fn dialect(&self) -> &ConsoleDialect {
        &self.dialect
    }

    /// Exclusive section for reads and mutations of the record.
    pub fn record(&self) -> MutexGuard<'_, InstanceRecord> {
        lock(&self.record)
    }

    pub fn status(&self) -> Status {
        self.record().status
    }

    pub fn summary(&self) -> InstanceSummary {
        self.record().summary()
    }

    pub fn players(&self) -> PlayerSet {
        self.record().players()
    }

    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.status_tx.subscribe()
    }

    /// Apply `event` to the record while the caller holds the record lock.
    pub fn apply(
        &self,
        rec: &mut InstanceRecord,
        event: LifecycleEvent,
        message: Option<String>,
    ) -> Result<Status> {
        let previous = rec.status;
        let status = state_machine::next(previous, event, rec.installed)?;
        if event == LifecycleEvent::DeleteRequested {
            return Ok(status);
        }
        match event {
            LifecycleEvent::InstallOk => rec.installed = true,
            LifecycleEvent::InstallRequested => rec.installed = false,
            _ => {}
        }
        rec.status = status;
        rec.message = message.clone();
        self.status_tx.send_replace(status);
        self.channels.publish(InstanceEvent::Status(StatusChange {
            status,
            previous: Some(previous),
            message,
        }));
        tracing::info!(
            instance_id = %self.id,
            from = %previous,
            to = %status,
            event = %event,
            "status changed"
        );
        Ok(status)
    }

    pub fn transition(&self, event: LifecycleEvent, message: Option<String>) -> Result<Status> {
        let mut rec = self.record();
        self.apply(&mut rec, event, message)
    }

    /// Record which spawn is current; exits and outputs of older spawns are ignored.
    pub fn set_generation(&self, generation: u64) {
        self.generation.store(generation, Ordering::SeqCst);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    pub fn push_output(&self, line: String) {
        let mut logs = lock(&self.logs);
        logs.push(line.clone());
        self.console_log.append(&line);
        self.channels.publish(InstanceEvent::Output(line));
    }

    /// Control-plane message injected into the console stream.
    pub fn system_line(&self, msg: impl AsRef<str>) {
        self.push_output(format!("[anvil] {}", msg.as_ref()));
    }

    pub fn last_log_seq(&self) -> u64 {
        lock(&self.logs).last_seq()
    }

    pub fn logs_after(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        lock(&self.logs).read_after(cursor, limit)
    }

    pub fn latest_metrics(&self) -> Option<ResourceSample> {
        lock(&self.metrics).clone()
    }

    /// Publish the player set; the caller holds the record lock.
    pub fn publish_players(&self, rec: &InstanceRecord) {
        self.channels
            .publish(InstanceEvent::Players(rec.players()));
    }

    pub fn subscribe(&self, subject: Subject) -> EventSubscription {
        self.channels.subscribe(subject)
    }

    pub fn subscriber_count(&self, subject: Subject) -> usize {
        self.channels.subscriber_count(subject)
    }

    /// Snapshot plus subscriptions to all four subjects, with no gap and no overlap.
    pub fn attach(&self) -> (InstanceSnapshot, Attached) {
        let rec = self.record();
        let logs = lock(&self.logs);
        let metrics = lock(&self.metrics);

        let snapshot = InstanceSnapshot {
            instance: rec.summary(),
            players: rec.players(),
            logs: logs.snapshot(),
            metrics: metrics.clone(),
        };
        let attached = Attached {
            output: self.channels.subscribe(Subject::Output),
            metrics: self.channels.subscribe(Subject::Metrics),
            players: self.channels.subscribe(Subject::Players),
            status: self.channels.subscribe(Subject::Status),
        };
        (snapshot, attached)
    }

    /// Write `instance.json` and `server.properties` from the current record.
    pub async fn persist(&self) -> Result<()> {
        let _serial = self.persist_lock.lock().await;
        if self.retired.load(Ordering::SeqCst) {
            return Ok(());
        }
        let rec = self.record().clone();
        write_json_atomic(&self.root.join(RECORD_FILE), &rec).await?;
        let rendered = properties::render(&rec.properties);
        let path = self.root.join(PROPERTIES_FILE);
        let tmp = path.with_extension("properties.tmp");
        tokio::fs::write(&tmp, rendered).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Stop persisting and close `console.log`; returns once no write is in
    /// flight. Used before the root is removed.
    pub async fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        let _serial = self.persist_lock.lock().await;
        self.console_log.close().await;
    }

    /// Flush `console.log` on agent shutdown.
    pub async fn close_console(&self) {
        self.console_log.close().await;
    }

    /// Persist in the background; failures are logged.
    pub fn persist_later(self: &Arc<Self>) {
        let me = self.clone();
        tokio::spawn(async move {
            if let Err(e) = me.persist().await {
                tracing::warn!(instance_id = %me.id, error = %e, "persist instance failed");
            }
        });
    }

    fn handle_output(self: &Arc<Self>, generation: u64, line: String) {
        let signal = self.dialect.classify(&line);
        self.push_output(line);
        if !self.is_current(generation) {
            return;
        }
        match signal {
            Some(ConsoleSignal::Ready) => {
                let mut rec = self.record();
                if rec.status == Status::Starting
                    && self
                        .apply(&mut rec, LifecycleEvent::ProcessReady, None)
                        .is_ok()
                {
                    drop(rec);
                    self.persist_later();
                }
            }
            Some(ConsoleSignal::PlayerJoined(name)) => {
                let mut rec = self.record();
                if rec.online.insert(name) {
                    self.publish_players(&rec);
                }
            }
            Some(ConsoleSignal::PlayerLeft(name)) => {
                let mut rec = self.record();
                if rec.online.remove(&name) {
                    self.publish_players(&rec);
                }
            }
            Some(ConsoleSignal::SaveConfirmed) | None => {}
        }
    }

    fn handle_sample(&self, generation: u64, sample: ResourceSample) {
        if !self.is_current(generation) {
            return;
        }
        let mut metrics = lock(&self.metrics);
        *metrics = Some(sample.clone());
        self.channels.publish(InstanceEvent::Metrics(sample));
    }

    fn handle_exit(self: &Arc<Self>, exit: ExitInfo) {
        if !self.is_current(exit.generation) {
            tracing::debug!(instance_id = %self.id, generation = exit.generation, "ignoring exit of a stale process");
            return;
        }
        let code = exit
            .code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        {
            let mut rec = self.record();
            if !rec.online.is_empty() {
                rec.online.clear();
                self.publish_players(&rec);
            }
            let current = rec.status;
            let (event, message) = match current {
                Status::Stopping => (LifecycleEvent::ProcessExited, None),
                Status::Running => (
                    LifecycleEvent::ProcessCrashed,
                    Some(format!("server exited unexpectedly (code {code})")),
                ),
                Status::Starting => (
                    LifecycleEvent::StartFail,
                    Some(format!("server exited before it was ready (code {code})")),
                ),
                _ => {
                    drop(rec);
                    self.system_line(format!("process exited (code {code})"));
                    return;
                }
            };
            if let Err(e) = self.apply(&mut rec, event, message) {
                tracing::warn!(instance_id = %self.id, error = %e, "exit transition rejected");
            }
        }
        self.system_line(format!(
            "process exited (code {code}, runtime {}ms)",
            exit.runtime_ms
        ));
        self.persist_later();
    }
}

/// Routes supervisor callbacks into the instance.
pub struct InstanceObserver(pub Arc<Instance>);

impl ProcessObserver for InstanceObserver {
    fn on_spawn(&self, generation: u64) {
        self.0.set_generation(generation);
    }

    fn on_output(&self, generation: u64, line: String) {
        self.0.handle_output(generation, line);
    }

    fn on_sample(&self, generation: u64, sample: ResourceSample) {
        self.0.handle_sample(generation, sample);
    }

    fn on_exit(&self, exit: ExitInfo) {
        self.0.handle_exit(exit);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anvil_process::PropertyValue;

    pub(crate) fn record(name: &str) -> InstanceRecord {
        InstanceRecord {
            id: InstanceId::new(),
            name: name.to_string(),
            version: "1.20.1".to_string(),
            installed: true,
            status: Status::Stopped,
            message: None,
            worlds: vec![WorldEntry {
                name: "world".to_string(),
                version: None,
                world_type: None,
                generation: None,
            }],
            properties: properties::defaults(name, "world"),
            operators: BTreeSet::new(),
            banned: BTreeSet::new(),
            created_at_unix_ms: 0,
            online: BTreeSet::new(),
        }
    }

    fn settings() -> InstanceSettings {
        InstanceSettings {
            log_max_lines: 100,
            log_file_max_bytes: 1024 * 1024,
            log_file_max_files: 2,
            subscriber_queue: 64,
            dialect: Arc::new(ConsoleDialect::default()),
        }
    }

    fn running(dir: &Path) -> Arc<Instance> {
        let inst = Instance::new(dir.to_path_buf(), record("A"), &settings());
        inst.transition(LifecycleEvent::StartRequested, None).unwrap();
        inst.set_generation(1);
        inst
    }

    #[tokio::test]
    async fn ready_line_moves_starting_to_running() {
        let dir = tempfile::tempdir().unwrap();
        let inst = running(dir.path());
        let mut status = inst.subscribe(Subject::Status);

        inst.handle_output(1, "[12:00] [Server thread/INFO]: Done (1.0s)!".to_string());
        assert_eq!(inst.status(), Status::Running);
        assert!(matches!(
            status.recv().await,
            Some(InstanceEvent::Status(StatusChange {
                status: Status::Running,
                previous: Some(Status::Starting),
                ..
            }))
        ));
    }

    #[tokio::test]
    async fn joins_and_leaves_track_online_players() {
        let dir = tempfile::tempdir().unwrap();
        let inst = running(dir.path());
        let mut players = inst.subscribe(Subject::Players);

        inst.handle_output(1, "Steve joined the game".to_string());
        inst.handle_output(1, "Alex joined the game".to_string());
        inst.handle_output(1, "Steve left the game".to_string());

        let online: Vec<String> = inst.players().online.into_iter().collect();
        assert_eq!(online, vec!["Alex"]);
        let mut last = None;
        while let Some(ev) = players.try_recv() {
            last = Some(ev);
        }
        assert!(matches!(last, Some(InstanceEvent::Players(p)) if p.online.len() == 1));
    }

    #[tokio::test]
    async fn exit_while_running_is_a_crash_and_clears_players() {
        let dir = tempfile::tempdir().unwrap();
        let inst = running(dir.path());
        inst.handle_output(1, "Done (1s)!".to_string());
        inst.handle_output(1, "Steve joined the game".to_string());

        inst.handle_exit(ExitInfo {
            generation: 1,
            code: Some(1),
            runtime_ms: 10,
        });
        assert_eq!(inst.status(), Status::Error);
        assert!(inst.players().online.is_empty());
    }

    #[tokio::test]
    async fn stale_exit_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let inst = running(dir.path());
        inst.handle_output(1, "Done (1s)!".to_string());
        inst.set_generation(2);
        inst.handle_exit(ExitInfo {
            generation: 1,
            code: Some(0),
            runtime_ms: 10,
        });
        assert_eq!(inst.status(), Status::Running);
    }

    #[tokio::test]
    async fn attach_has_no_gap_and_no_duplicate() {
        let dir = tempfile::tempdir().unwrap();
        let inst = running(dir.path());
        inst.push_output("one".to_string());
        inst.push_output("two".to_string());

        let (snap, mut live) = inst.attach();
        inst.push_output("three".to_string());

        assert_eq!(snap.logs, vec!["one", "two"]);
        assert_eq!(snap.instance.status, Status::Starting);
        assert_eq!(
            live.output.recv().await,
            Some(InstanceEvent::Output("three".to_string()))
        );
        assert!(live.output.try_recv().is_none());
        assert!(live.status.try_recv().is_none());
    }

    #[tokio::test]
    async fn persist_writes_record_and_properties() {
        let dir = tempfile::tempdir().unwrap();
        let inst = Instance::new(dir.path().to_path_buf(), record("A"), &settings());
        inst.record()
            .properties
            .insert("pvp".to_string(), PropertyValue::Bool(false));
        inst.persist().await.unwrap();

        let back: InstanceRecord =
            serde_json::from_slice(&std::fs::read(dir.path().join(RECORD_FILE)).unwrap()).unwrap();
        assert_eq!(back.name, "A");
        assert_eq!(back.active_world(), Some("world"));
        let props = std::fs::read_to_string(dir.path().join(PROPERTIES_FILE)).unwrap();
        assert!(props.contains("pvp=false\n"));
        assert!(props.contains("level-name=worlds/world\n"));
        assert!(!props.contains("ram="));
    }
}
