//! Facade over the registry, supervisor, scheduler and backup catalog.
//!
//! One `Orchestrator` is built in `main` and shared with the transport as an
//! `Arc`. Long operations take the instance's operation guard before their first
//! `.await` and hand it to a background task; callers get an [`OperationTicket`].

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anvil_process::{
    BackupId, BackupInfo, InstanceId, InstanceSnapshot, InstanceSummary, PlayerSet, Status,
    Subject, UploadId, WorldGenerationSettings, WorldInfo,
};

use crate::{
    backup::BackupManager,
    catalog::{DirectoryCatalog, VersionCatalog},
    config::AgentConfig,
    console::player_command,
    error::{AnvilError, Result},
    event_bus::EventSubscription,
    instance::{Attached, Instance, InstanceObserver, InstanceRecord, InstanceSettings},
    properties::{self, Properties},
    registry::{InstanceRegistry, WorldSource},
    scheduler::{OperationKind, OperationScheduler, OperationTicket},
    state_machine::LifecycleEvent,
    supervisor::{LaunchSpec, ProcessSupervisor, StopPolicy},
    uploads::UploadStore,
    worlds::{self, SaveControl},
};

const DEFAULT_RAM_MB: i64 = 2048;
const DEFAULT_PORT: i64 = 25565;
const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_PLAYER_NAME: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerAction {
    Op,
    Deop,
    Ban,
    Pardon,
}

impl PlayerAction {
    fn as_str(self) -> &'static str {
        match self {
            PlayerAction::Op => "op",
            PlayerAction::Deop => "deop",
            PlayerAction::Ban => "ban",
            PlayerAction::Pardon => "pardon",
        }
    }
}

/// Result of [`Orchestrator::send_command`].
#[derive(Debug)]
pub enum CommandOutcome {
    Sent,
    /// The line was the stop command and went through the stop operation.
    Stopping(OperationTicket<()>),
}

pub struct Orchestrator {
    cfg: AgentConfig,
    registry: InstanceRegistry,
    supervisor: ProcessSupervisor,
    scheduler: OperationScheduler,
    backups: BackupManager,
    uploads: UploadStore,
    catalog: Arc<dyn VersionCatalog>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("data_root", &self.cfg.data_root)
            .finish_non_exhaustive()
    }
}

fn validate_player(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() || name.len() > MAX_PLAYER_NAME {
        return Err(AnvilError::InvalidArgument(format!(
            "player name must be 1..={MAX_PLAYER_NAME} characters"
        )));
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(AnvilError::InvalidArgument(format!(
            "invalid player name: {name:?}"
        )));
    }
    Ok(name.to_string())
}

/// Wait until the instance leaves `from`; `None` on timeout.
async fn wait_until_left(inst: &Instance, from: Status, timeout: Duration) -> Option<Status> {
    let mut rx = inst.watch_status();
    let left = async move { rx.wait_for(|s| *s != from).await.map(|s| *s).ok() };
    tokio::time::timeout(timeout, left).await.ok().flatten()
}

impl Orchestrator {
    pub fn new(cfg: AgentConfig) -> Arc<Self> {
        let catalog = Arc::new(DirectoryCatalog::new(cfg.dist_root.clone()));
        Self::with_catalog(cfg, catalog)
    }

    pub fn with_catalog(cfg: AgentConfig, catalog: Arc<dyn VersionCatalog>) -> Arc<Self> {
        let uploads = UploadStore::new(cfg.uploads_dir(), cfg.dialect.world_marker.clone());
        let registry = InstanceRegistry::new(
            cfg.data_root.clone(),
            InstanceSettings::from_config(&cfg),
            uploads.clone(),
        );
        let supervisor = ProcessSupervisor::new(
            cfg.resource_sample_interval,
            StopPolicy {
                stop_timeout: cfg.stop_timeout,
                term_grace: cfg.term_grace,
            },
        );
        Arc::new(Self {
            backups: BackupManager::new(cfg.backups_dir()),
            registry,
            supervisor,
            scheduler: OperationScheduler::new(),
            uploads,
            catalog,
            cfg,
        })
    }

    pub fn config(&self) -> &AgentConfig {
        &self.cfg
    }

    /// Reload persisted instances and backups.
    pub async fn load(&self) -> Result<()> {
        tokio::fs::create_dir_all(self.cfg.instances_dir()).await?;
        let instances = self.registry.load().await?;
        let backups = self.backups.load().await?;
        tracing::info!(instances, backups, data_root = %self.cfg.data_root.display(), "state loaded");
        Ok(())
    }

    fn saves(&self) -> SaveControl<'_> {
        SaveControl {
            supervisor: &self.supervisor,
            save_timeout: self.cfg.save_timeout,
        }
    }

    fn instance(&self, id: &InstanceId) -> Result<Arc<Instance>> {
        self.registry.get(id)
    }

    pub async fn available_versions(&self) -> Result<Vec<String>> {
        self.catalog.list_available_versions().await
    }

    pub async fn create_instance(
        &self,
        name: &str,
        version: &str,
        world: WorldSource,
    ) -> Result<InstanceSummary> {
        let id = self.registry.create(name, version, world).await?;
        Ok(self.instance(&id)?.summary())
    }

    pub fn get_instance(&self, id: &InstanceId) -> Result<InstanceSummary> {
        Ok(self.instance(id)?.summary())
    }

    pub fn list_instances(&self) -> Vec<InstanceSummary> {
        self.registry.list().iter().map(|i| i.summary()).collect()
    }

    pub async fn delete_instance(&self, id: &InstanceId) -> Result<()> {
        self.instance(id)?;
        let _guard = self.scheduler.acquire(id, OperationKind::Delete)?;
        self.registry.delete(id).await?;
        self.backups.remove_instance(id).await?;
        Ok(())
    }

    pub fn in_flight(&self, id: &InstanceId) -> Result<Option<OperationKind>> {
        self.instance(id)?;
        Ok(self.scheduler.in_flight(id))
    }

    pub fn cancel_operation(&self, id: &InstanceId) -> Result<Option<OperationKind>> {
        self.instance(id)?;
        Ok(self.scheduler.cancel(id))
    }

    /// Lay out the server files of the instance's version.
    pub fn install(self: &Arc<Self>, id: &InstanceId) -> Result<OperationTicket<()>> {
        let inst = self.instance(id)?;
        let guard = self.scheduler.acquire(id, OperationKind::Install)?;
        let version = {
            let mut rec = inst.record();
            inst.apply(&mut rec, LifecycleEvent::InstallRequested, None)?;
            rec.version.clone()
        };
        inst.system_line(format!("installing version {version}"));

        let me = self.clone();
        Ok(self.scheduler.spawn_with(guard, move |guard| async move {
            let res = guard
                .run_cancellable(me.catalog.install(&version, inst.root()))
                .await;
            let (event, message) = match &res {
                Ok(()) => (LifecycleEvent::InstallOk, None),
                Err(e) => (LifecycleEvent::InstallFail, Some(e.to_string())),
            };
            if let Err(e) = inst.transition(event, message) {
                tracing::warn!(instance_id = %inst.id(), error = %e, "install result transition rejected");
            }
            match &res {
                Ok(()) => inst.system_line("install complete"),
                Err(e) => inst.system_line(format!("install failed: {e}")),
            }
            inst.persist().await?;
            res
        }))
    }

    fn launch_spec(&self, inst: &Instance, rec: &InstanceRecord) -> LaunchSpec {
        let ram = properties::get_int(&rec.properties, properties::RAM).unwrap_or(DEFAULT_RAM_MB);
        let port = properties::get_int(&rec.properties, properties::SERVER_PORT)
            .unwrap_or(DEFAULT_PORT);
        let fill = |s: &str| {
            s.replace("{version}", &rec.version)
                .replace("{ram}", &ram.to_string())
                .replace("{port}", &port.to_string())
        };
        let template = &self.cfg.launch;
        LaunchSpec {
            program: fill(&template.program),
            args: template.args.iter().map(|a| fill(a)).collect(),
            cwd: inst.root().to_path_buf(),
            env: template
                .env
                .iter()
                .map(|(k, v)| (k.clone(), fill(v)))
                .collect(),
            stop_command: inst.dialect().stop_command.clone(),
        }
    }

    /// Spawn the server and wait in the background for its readiness marker.
    pub fn start(self: &Arc<Self>, id: &InstanceId) -> Result<OperationTicket<()>> {
        let inst = self.instance(id)?;
        let guard = self.scheduler.acquire(id, OperationKind::Start)?;
        let spec = {
            let mut rec = inst.record();
            inst.apply(&mut rec, LifecycleEvent::StartRequested, None)?;
            self.launch_spec(&inst, &rec)
        };
        inst.system_line(format!("starting {}", spec.program));

        let observer = Arc::new(InstanceObserver(inst.clone()));
        let handle = match self.supervisor.spawn(id, spec, observer) {
            Ok(h) => h,
            Err(e) => {
                if let Err(te) = inst.transition(LifecycleEvent::StartFail, Some(e.to_string())) {
                    tracing::warn!(instance_id = %id, error = %te, "start failure transition rejected");
                }
                inst.system_line(format!("start failed: {e}"));
                inst.persist_later();
                return Err(e);
            }
        };

        let me = self.clone();
        let ready_timeout = self.cfg.ready_timeout;
        Ok(self.scheduler.spawn_with(guard, move |guard| async move {
            let settled = guard
                .run_cancellable(async { Ok(wait_until_left(&inst, Status::Starting, ready_timeout).await) })
                .await;
            let failure = match settled {
                Ok(Some(Status::Running)) => {
                    inst.system_line("server is ready");
                    inst.persist().await?;
                    return Ok(());
                }
                // The exit path already recorded the failure.
                Ok(Some(other)) => {
                    return Err(AnvilError::Spawn(format!(
                        "server exited before it was ready (status {other})"
                    )));
                }
                Ok(None) => AnvilError::Spawn(format!(
                    "server not ready within {}s",
                    ready_timeout.as_secs()
                )),
                Err(e) => e,
            };
            if let Err(e) = inst.transition(LifecycleEvent::StartFail, Some(failure.to_string())) {
                tracing::debug!(instance_id = %inst.id(), error = %e, "start already settled");
            }
            inst.system_line(format!("start aborted: {failure}"));
            if let Err(e) = me.supervisor.terminate(&handle, false).await {
                tracing::warn!(instance_id = %inst.id(), error = %e, "terminate after failed start");
            }
            inst.persist().await?;
            Err(failure)
        }))
    }

    /// Graceful stop: stop command, then SIGTERM, then SIGKILL.
    pub fn stop(self: &Arc<Self>, id: &InstanceId) -> Result<OperationTicket<()>> {
        let inst = self.instance(id)?;
        let guard = self.scheduler.acquire(id, OperationKind::Stop)?;
        inst.transition(LifecycleEvent::StopRequested, None)?;
        inst.system_line("stopping");
        let handle = self.supervisor.handle(id);

        let me = self.clone();
        Ok(self.scheduler.spawn_with(guard, move |_guard| async move {
            match handle {
                Some(handle) => {
                    me.supervisor.terminate(&handle, true).await?;
                }
                None => {
                    // Exited between the status check and the transition.
                    let mut rec = inst.record();
                    if rec.status == Status::Stopping {
                        inst.apply(&mut rec, LifecycleEvent::ProcessExited, None)?;
                    }
                }
            }
            if wait_until_left(&inst, Status::Stopping, SETTLE_TIMEOUT)
                .await
                .is_none()
            {
                tracing::warn!(instance_id = %inst.id(), "exit not observed after stop");
            }
            inst.persist().await?;
            Ok(())
        }))
    }

    /// Forward a console line; the dialect's stop command is routed through [`Self::stop`].
    pub async fn send_command(
        self: &Arc<Self>,
        id: &InstanceId,
        command: &str,
    ) -> Result<CommandOutcome> {
        let inst = self.instance(id)?;
        let command = command.trim();
        if command.is_empty() || command.contains(['\n', '\r']) {
            return Err(AnvilError::InvalidArgument(
                "command must be a single non-empty line".to_string(),
            ));
        }
        if inst.dialect().is_stop_command(command) && inst.status() == Status::Running {
            return Ok(CommandOutcome::Stopping(self.stop(id)?));
        }
        let handle = self
            .supervisor
            .handle(id)
            .ok_or_else(|| AnvilError::ProcessNotRunning(id.clone()))?;
        self.supervisor.write_line(&handle, command).await?;
        tracing::debug!(instance_id = %id, command, "console command sent");
        Ok(CommandOutcome::Sent)
    }

    pub fn attach(&self, id: &InstanceId) -> Result<(InstanceSnapshot, Attached)> {
        Ok(self.instance(id)?.attach())
    }

    pub fn subscribe(&self, id: &InstanceId, subject: Subject) -> Result<EventSubscription> {
        Ok(self.instance(id)?.subscribe(subject))
    }

    /// Buffered console lines after `cursor`, with the cursor to pass next time.
    pub fn logs(&self, id: &InstanceId, cursor: u64, limit: usize) -> Result<(Vec<String>, u64)> {
        Ok(self.instance(id)?.logs_after(cursor, limit))
    }

    pub fn players(&self, id: &InstanceId) -> Result<PlayerSet> {
        Ok(self.instance(id)?.players())
    }

    pub async fn update_player(
        &self,
        id: &InstanceId,
        action: PlayerAction,
        player: &str,
    ) -> Result<PlayerSet> {
        let inst = self.instance(id)?;
        let player = validate_player(player)?;
        let changed = {
            let mut rec = inst.record();
            let changed = match action {
                PlayerAction::Op => rec.operators.insert(player.clone()),
                PlayerAction::Deop => rec.operators.remove(&player),
                PlayerAction::Ban => rec.banned.insert(player.clone()),
                PlayerAction::Pardon => rec.banned.remove(&player),
            };
            if changed {
                inst.publish_players(&rec);
            }
            changed
        };
        if changed {
            inst.persist().await?;
            inst.system_line(format!("{} {player}", action.as_str()));
        }

        let dialect = inst.dialect();
        let template = match action {
            PlayerAction::Op => dialect.op_command.as_deref(),
            PlayerAction::Deop => dialect.deop_command.as_deref(),
            PlayerAction::Ban => dialect.ban_command.as_deref(),
            PlayerAction::Pardon => dialect.pardon_command.as_deref(),
        };
        if let Some(cmd) = player_command(template, &player)
            && let Some(handle) = self.supervisor.handle(id)
            && let Err(e) = self.supervisor.write_line(&handle, &cmd).await
        {
            tracing::warn!(instance_id = %id, error = %e, action = action.as_str(), "could not forward player command");
        }
        Ok(inst.players())
    }

    pub async fn set_operator(&self, id: &InstanceId, player: &str) -> Result<PlayerSet> {
        self.update_player(id, PlayerAction::Op, player).await
    }

    pub async fn remove_operator(&self, id: &InstanceId, player: &str) -> Result<PlayerSet> {
        self.update_player(id, PlayerAction::Deop, player).await
    }

    pub async fn ban(&self, id: &InstanceId, player: &str) -> Result<PlayerSet> {
        self.update_player(id, PlayerAction::Ban, player).await
    }

    pub async fn pardon(&self, id: &InstanceId, player: &str) -> Result<PlayerSet> {
        self.update_player(id, PlayerAction::Pardon, player).await
    }

    pub fn properties(&self, id: &InstanceId) -> Result<Properties> {
        Ok(self.instance(id)?.record().properties.clone())
    }

    /// Apply what can be applied; returns the rejected keys with reasons.
    pub async fn update_properties(
        &self,
        id: &InstanceId,
        patch: &BTreeMap<String, serde_json::Value>,
    ) -> Result<BTreeMap<String, String>> {
        let inst = self.instance(id)?;
        let fails = {
            let mut rec = inst.record();
            properties::update(&mut rec.properties, patch)
        };
        if fails.len() < patch.len() {
            inst.persist().await?;
            inst.system_line(format!(
                "{} propert{} updated",
                patch.len() - fails.len(),
                if patch.len() - fails.len() == 1 { "y" } else { "ies" }
            ));
        }
        Ok(fails)
    }

    pub fn worlds(&self, id: &InstanceId) -> Result<Vec<WorldInfo>> {
        let inst = self.instance(id)?;
        Ok(worlds::list(&inst))
    }

    pub async fn create_world(
        &self,
        id: &InstanceId,
        name: &str,
        settings: WorldGenerationSettings,
    ) -> Result<WorldInfo> {
        let inst = self.instance(id)?;
        let _guard = self.scheduler.acquire(id, OperationKind::CreateWorld)?;
        worlds::create(&inst, name, settings).await
    }

    pub async fn change_world(&self, id: &InstanceId, name: &str) -> Result<()> {
        let inst = self.instance(id)?;
        let _guard = self.scheduler.acquire(id, OperationKind::ChangeWorld)?;
        worlds::change(&inst, name).await
    }

    pub fn copy_world(
        self: &Arc<Self>,
        id: &InstanceId,
        src: &str,
        dst: &str,
    ) -> Result<OperationTicket<WorldInfo>> {
        let inst = self.instance(id)?;
        let me = self.clone();
        let (src, dst) = (src.to_string(), dst.to_string());
        self.scheduler
            .run_exclusive(id, OperationKind::CopyWorld, move |guard| async move {
                worlds::copy(&inst, me.saves(), &guard, &src, &dst).await
            })
    }

    /// Store a zipped world upload; identical bytes return the existing id.
    pub async fn upload_world(&self, bytes: Vec<u8>) -> Result<(UploadId, bool)> {
        if bytes.len() > self.cfg.upload_max_bytes {
            return Err(AnvilError::InvalidArgument(format!(
                "upload exceeds {} bytes",
                self.cfg.upload_max_bytes
            )));
        }
        self.uploads.upload_world(bytes).await
    }

    pub fn import_world(
        self: &Arc<Self>,
        id: &InstanceId,
        upload_id: &UploadId,
    ) -> Result<OperationTicket<WorldInfo>> {
        let inst = self.instance(id)?;
        let dir = self.uploads.resolve(upload_id)?;
        self.scheduler
            .run_exclusive(id, OperationKind::ImportWorld, move |guard| async move {
                worlds::import(&inst, &guard, &dir).await
            })
    }

    pub fn create_backup(
        self: &Arc<Self>,
        id: &InstanceId,
        world: &str,
    ) -> Result<OperationTicket<BackupInfo>> {
        let inst = self.instance(id)?;
        let me = self.clone();
        let world = world.to_string();
        self.scheduler
            .run_exclusive(id, OperationKind::Backup, move |guard| async move {
                me.backups.create(&inst, &world, me.saves(), &guard).await
            })
    }

    pub fn restore_backup(self: &Arc<Self>, backup_id: &BackupId) -> Result<OperationTicket<()>> {
        let info = self.backups.get(backup_id)?;
        let inst = self.instance(&info.instance_id)?;
        let guard = self.scheduler.acquire(inst.id(), OperationKind::Restore)?;
        worlds::ensure_replaceable(&inst, &info.world).or_else(|e| match e {
            // A world that was deleted since the backup is recreated by the restore.
            AnvilError::NotFound { .. } => Ok(()),
            other => Err(other),
        })?;
        let (info, mark) = self.backups.begin_restore(backup_id)?;

        let me = self.clone();
        Ok(self.scheduler.spawn_with(guard, move |guard| async move {
            let _mark = mark;
            me.backups.restore(&info, &inst, &guard).await
        }))
    }

    pub async fn delete_backup(&self, backup_id: &BackupId) -> Result<()> {
        self.backups.delete(backup_id).await
    }

    pub fn get_backup(&self, backup_id: &BackupId) -> Result<BackupInfo> {
        self.backups.get(backup_id)
    }

    pub fn list_backups(&self, instance: Option<&InstanceId>) -> Result<Vec<BackupInfo>> {
        if let Some(id) = instance {
            self.instance(id)?;
        }
        Ok(self.backups.list(instance))
    }

    /// Stop every live server with the graceful policy, then flush all state.
    pub async fn shutdown(&self) -> Result<()> {
        let running = self.supervisor.running();
        tracing::info!(running = running.len(), "shutting down");
        let stops = running.into_iter().map(|handle| async move {
            if let Ok(inst) = self.instance(handle.instance_id()) {
                if let Err(e) = inst.transition(LifecycleEvent::StopRequested, None) {
                    tracing::debug!(instance_id = %inst.id(), error = %e, "stop on shutdown outside running");
                }
                inst.system_line("stopping for agent shutdown");
            }
            if let Err(e) = self.supervisor.terminate(&handle, true).await {
                tracing::warn!(instance_id = %handle.instance_id(), error = %e, "stop on shutdown failed");
            }
        });
        futures_util::future::join_all(stops).await;
        self.supervisor.kill_all().await;

        for inst in self.registry.list() {
            if inst.status().is_live() {
                wait_until_left(&inst, inst.status(), SETTLE_TIMEOUT).await;
            }
        }
        let flushed = self.registry.flush().await;
        let instances = self.registry.list();
        futures_util::future::join_all(instances.iter().map(|inst| inst.close_console())).await;
        flushed
    }
}
