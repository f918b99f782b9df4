//! Content-addressed world backups, cataloged in `backups/catalog.json`.

use std::{
    collections::HashSet,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard},
};

use anvil_process::{BackupId, BackupInfo, InstanceId};
use anyhow::Context;

use crate::{
    archive::{extract_zip_file, zip_dir},
    error::{AnvilError, Result},
    fsutil::{read_json, replace_dir, write_json_atomic},
    instance::{Instance, WorldEntry},
    resources::now_unix_ms,
    scheduler::{OperationGuard, OperationKind},
    worlds::SaveControl,
};

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct CatalogFile {
    backups: Vec<BackupInfo>,
}

/// Catalog entries and restore marks share one lock, so registering,
/// deleting and marking a backup are each a single step.
#[derive(Debug, Default)]
struct Catalog {
    backups: Vec<BackupInfo>,
    restoring: HashSet<BackupId>,
}

impl Catalog {
    fn find(&self, id: &BackupId) -> Option<&BackupInfo> {
        self.backups.iter().find(|b| &b.backup_id == id)
    }
}

#[derive(Debug)]
pub struct BackupManager {
    root: PathBuf,
    catalog: Arc<Mutex<Catalog>>,
    persist_lock: tokio::sync::Mutex<()>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

fn backup_not_found(id: &BackupId) -> AnvilError {
    AnvilError::NotFound {
        kind: "backup",
        id: id.0.clone(),
    }
}

/// Marks a backup as being restored until dropped.
#[derive(Debug)]
pub struct RestoreMark {
    catalog: Arc<Mutex<Catalog>>,
    id: BackupId,
}

impl Drop for RestoreMark {
    fn drop(&mut self) {
        lock(&self.catalog).restoring.remove(&self.id);
    }
}

impl BackupManager {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            catalog: Arc::new(Mutex::new(Catalog::default())),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn catalog_path(&self) -> PathBuf {
        self.root.join("catalog.json")
    }

    pub async fn load(&self) -> Result<usize> {
        let path = self.catalog_path();
        if tokio::fs::metadata(&path).await.is_err() {
            return Ok(0);
        }
        let file: CatalogFile = read_json(&path).await?;
        let kept: Vec<BackupInfo> = file
            .backups
            .into_iter()
            .filter(|b| {
                let present = std::path::Path::new(&b.archive_path).is_file();
                if !present {
                    tracing::warn!(backup_id = %b.backup_id, "dropping backup with missing archive");
                }
                present
            })
            .collect();
        let n = kept.len();
        lock(&self.catalog).backups = kept;
        Ok(n)
    }

    async fn persist(&self) -> Result<()> {
        let _serial = self.persist_lock.lock().await;
        let file = CatalogFile {
            backups: lock(&self.catalog).backups.clone(),
        };
        write_json_atomic(&self.catalog_path(), &file).await?;
        Ok(())
    }

    pub fn get(&self, id: &BackupId) -> Result<BackupInfo> {
        lock(&self.catalog)
            .find(id)
            .cloned()
            .ok_or_else(|| backup_not_found(id))
    }

    pub fn list(&self, instance: Option<&InstanceId>) -> Vec<BackupInfo> {
        lock(&self.catalog)
            .backups
            .iter()
            .filter(|b| instance.is_none_or(|i| &b.instance_id == i))
            .cloned()
            .collect()
    }

    /// Snapshot `world` of `inst`. The caller holds the instance's operation guard.
    pub async fn create(
        &self,
        inst: &Instance,
        world: &str,
        saves: SaveControl<'_>,
        guard: &OperationGuard,
    ) -> Result<BackupInfo> {
        let (version, known) = {
            let rec = inst.record();
            (rec.version.clone(), rec.has_world(world))
        };
        let src = inst.world_dir(world);
        if !known || !src.is_dir() {
            return Err(AnvilError::NotFound {
                kind: "world",
                id: world.to_string(),
            });
        }

        let dir = self.root.join(&inst.id().0);
        let pending = dir.join(format!(".pending-{}.zip", uuid::Uuid::new_v4().simple()));
        let salt = format!("{}/{}", inst.id(), world);
        let cancel = guard.cancel_flag();

        let snapshot = || {
            let (src, pending, salt) = (src.clone(), pending.clone(), salt.clone());
            async move {
                tokio::task::spawn_blocking(move || zip_dir(&src, &pending, &salt, &cancel))
                    .await
                    .context("backup task")?
            }
        };
        let digest = if saves.world_in_use(inst, world) {
            saves.with_saves_suspended(inst, snapshot).await?
        } else {
            snapshot().await?
        };

        let backup_id = BackupId(digest);
        let archive = dir.join(format!("{backup_id}.zip"));
        let info = BackupInfo {
            backup_id: backup_id.clone(),
            instance_id: inst.id().clone(),
            world: world.to_string(),
            archive_path: archive.display().to_string(),
            created_at_unix_ms: now_unix_ms(),
            version,
        };

        // `<id>.zip` is only moved while the catalog lock is held.
        let registered = {
            let mut catalog = lock(&self.catalog);
            if let Some(existing) = catalog.find(&backup_id).cloned() {
                Err(existing)
            } else {
                std::fs::rename(&pending, &archive)
                    .with_context(|| format!("persist backup {}", archive.display()))?;
                catalog.backups.push(info.clone());
                Ok(())
            }
        };
        if let Err(existing) = registered {
            let _ = tokio::fs::remove_file(&pending).await;
            tracing::info!(backup_id = %backup_id, "identical backup already exists");
            return Ok(existing);
        }
        self.persist().await?;
        inst.system_line(format!("backup {backup_id} of world {world} created"));
        tracing::info!(instance_id = %inst.id(), backup_id = %backup_id, world, "backup created");
        Ok(info)
    }

    /// Mark `id` as restoring; `delete` is refused until the mark is dropped.
    pub fn begin_restore(&self, id: &BackupId) -> Result<(BackupInfo, RestoreMark)> {
        let mut catalog = lock(&self.catalog);
        let info = catalog.find(id).cloned().ok_or_else(|| backup_not_found(id))?;
        if !catalog.restoring.insert(id.clone()) {
            return Err(AnvilError::OperationInProgress {
                instance_id: info.instance_id.clone(),
                operation: OperationKind::Restore,
            });
        }
        Ok((
            info,
            RestoreMark {
                catalog: self.catalog.clone(),
                id: id.clone(),
            },
        ))
    }

    /// Replace the backup's world directory with the archive contents.
    pub async fn restore(
        &self,
        info: &BackupInfo,
        inst: &Instance,
        guard: &OperationGuard,
    ) -> Result<()> {
        {
            let rec = inst.record();
            if rec.status.is_live() && rec.active_world() == Some(info.world.as_str()) {
                return Err(AnvilError::InstanceRunning {
                    instance_id: inst.id().clone(),
                    status: rec.status,
                });
            }
        }

        let target = inst.world_dir(&info.world);
        let staging = inst.worlds_dir().join(format!(".{}.restore", info.world));
        let archive = PathBuf::from(&info.archive_path);
        let (staging_in, archive_in) = (staging.clone(), archive.clone());
        let extracted = tokio::task::spawn_blocking(move || {
            let _ = std::fs::remove_dir_all(&staging_in);
            extract_zip_file(&archive_in, &staging_in)
        })
        .await
        .context("restore task")
        .and_then(|r| r);

        if let Err(e) = extracted {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(e.into());
        }
        if guard.is_cancelled() {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            return Err(AnvilError::Cancelled);
        }

        let (staging_in, target_in) = (staging.clone(), target.clone());
        tokio::task::spawn_blocking(move || replace_dir(&staging_in, &target_in))
            .await
            .context("restore task")??;

        {
            let mut rec = inst.record();
            if !rec.has_world(&info.world) {
                rec.worlds.push(WorldEntry {
                    name: info.world.clone(),
                    version: Some(info.version.clone()),
                    world_type: None,
                    generation: None,
                });
            }
        }
        inst.persist().await?;
        inst.system_line(format!(
            "backup {} restored into world {}",
            info.backup_id, info.world
        ));
        tracing::info!(instance_id = %inst.id(), backup_id = %info.backup_id, "backup restored");
        Ok(())
    }

    /// Remove archive and catalog entry. Refused while the backup is being restored.
    pub async fn delete(&self, id: &BackupId) -> Result<()> {
        let doomed = {
            let mut catalog = lock(&self.catalog);
            let info = catalog.find(id).cloned().ok_or_else(|| backup_not_found(id))?;
            if catalog.restoring.contains(id) {
                return Err(AnvilError::OperationInProgress {
                    instance_id: info.instance_id,
                    operation: OperationKind::Restore,
                });
            }
            // Move the archive out of `<id>.zip` so a new backup with the
            // same content can take the name while this one is unlinked.
            let archive = PathBuf::from(&info.archive_path);
            let doomed = archive.with_file_name(format!(
                ".deleted-{}.zip",
                uuid::Uuid::new_v4().simple()
            ));
            let moved = match std::fs::rename(&archive, &doomed) {
                Ok(()) => Some(doomed),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
                Err(e) => {
                    return Err(anyhow::Error::new(e)
                        .context(format!("delete backup {}", archive.display()))
                        .into());
                }
            };
            catalog.backups.retain(|b| &b.backup_id != id);
            moved
        };
        if let Some(doomed) = doomed
            && let Err(e) = tokio::fs::remove_file(&doomed).await
        {
            tracing::warn!(path = %doomed.display(), error = %e, "remove deleted backup archive failed");
        }
        self.persist().await?;
        tracing::info!(backup_id = %id, "backup deleted");
        Ok(())
    }

    /// Drop every backup of a deleted instance.
    pub async fn remove_instance(&self, instance_id: &InstanceId) -> Result<()> {
        let removed: Vec<BackupInfo> = {
            let mut catalog = lock(&self.catalog);
            let (gone, kept): (Vec<BackupInfo>, Vec<BackupInfo>) = catalog
                .backups
                .drain(..)
                .partition(|b| &b.instance_id == instance_id);
            catalog.backups = kept;
            gone
        };
        if removed.is_empty() {
            return Ok(());
        }
        let _ = tokio::fs::remove_dir_all(self.root.join(&instance_id.0)).await;
        self.persist().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ConsoleDialect,
        instance::{InstanceSettings, tests::record},
        scheduler::OperationScheduler,
        supervisor::{ProcessSupervisor, StopPolicy},
    };
    use std::time::Duration;

    struct Fixture {
        _dir: tempfile::TempDir,
        inst: Arc<Instance>,
        backups: BackupManager,
        sup: ProcessSupervisor,
        sched: OperationScheduler,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let settings = InstanceSettings {
            log_max_lines: 100,
            log_file_max_bytes: 1024 * 1024,
            log_file_max_files: 2,
            subscriber_queue: 64,
            dialect: Arc::new(ConsoleDialect::default()),
        };
        let inst = Instance::new(dir.path().join("inst"), record("A"), &settings);
        let world = inst.world_dir("world");
        std::fs::create_dir_all(world.join("region")).unwrap();
        std::fs::write(world.join("level.dat"), b"level").unwrap();
        std::fs::write(world.join("region").join("r.0.0.mca"), vec![3u8; 4096]).unwrap();
        let backups = BackupManager::new(dir.path().join("backups"));
        let sup = ProcessSupervisor::new(
            Duration::from_secs(1),
            StopPolicy {
                stop_timeout: Duration::from_secs(1),
                term_grace: Duration::from_millis(200),
            },
        );
        Fixture {
            _dir: dir,
            inst,
            backups,
            sup,
            sched: OperationScheduler::new(),
        }
    }

    fn saves(f: &Fixture) -> SaveControl<'_> {
        SaveControl {
            supervisor: &f.sup,
            save_timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn backup_restore_delete() {
        let f = fixture();
        let guard = f.sched.acquire(f.inst.id(), OperationKind::Backup).unwrap();
        let info = f.backups.create(&f.inst, "world", saves(&f), &guard).await.unwrap();
        drop(guard);
        assert!(std::path::Path::new(&info.archive_path).is_file());
        assert_eq!(f.backups.list(Some(f.inst.id())), vec![info.clone()]);

        // Same content dedupes onto the same id.
        let guard = f.sched.acquire(f.inst.id(), OperationKind::Backup).unwrap();
        let again = f.backups.create(&f.inst, "world", saves(&f), &guard).await.unwrap();
        drop(guard);
        assert_eq!(again.backup_id, info.backup_id);
        assert_eq!(f.backups.list(None).len(), 1);

        let world = f.inst.world_dir("world");
        std::fs::remove_dir_all(&world).unwrap();
        std::fs::create_dir_all(&world).unwrap();

        let (info, mark) = f.backups.begin_restore(&info.backup_id).unwrap();
        assert!(matches!(
            f.backups.delete(&info.backup_id).await,
            Err(AnvilError::OperationInProgress { .. })
        ));
        let guard = f.sched.acquire(f.inst.id(), OperationKind::Restore).unwrap();
        f.backups.restore(&info, &f.inst, &guard).await.unwrap();
        drop(guard);
        drop(mark);
        assert_eq!(std::fs::read(world.join("level.dat")).unwrap(), b"level");
        assert_eq!(
            std::fs::read(world.join("region").join("r.0.0.mca")).unwrap(),
            vec![3u8; 4096]
        );

        f.backups.delete(&info.backup_id).await.unwrap();
        assert!(f.backups.list(None).is_empty());
        assert!(!std::path::Path::new(&info.archive_path).exists());
        assert!(matches!(
            f.backups.begin_restore(&info.backup_id),
            Err(AnvilError::NotFound { kind: "backup", .. })
        ));
    }

    #[tokio::test]
    async fn restore_cannot_start_once_delete_has_begun() {
        use futures_util::FutureExt;

        let f = fixture();
        let guard = f.sched.acquire(f.inst.id(), OperationKind::Backup).unwrap();
        let info = f.backups.create(&f.inst, "world", saves(&f), &guard).await.unwrap();
        drop(guard);

        // Poll the delete once so it is suspended on the archive unlink.
        let mut delete = Box::pin(f.backups.delete(&info.backup_id));
        let finished = (&mut delete).now_or_never();

        assert!(matches!(
            f.backups.begin_restore(&info.backup_id),
            Err(AnvilError::NotFound { kind: "backup", .. })
        ));

        // Backing up the same content again registers a fresh archive that the
        // pending delete must not remove.
        let guard = f.sched.acquire(f.inst.id(), OperationKind::Backup).unwrap();
        let again = f.backups.create(&f.inst, "world", saves(&f), &guard).await.unwrap();
        drop(guard);
        assert_eq!(again.backup_id, info.backup_id);

        match finished {
            Some(res) => res.unwrap(),
            None => delete.await.unwrap(),
        }
        assert_eq!(f.backups.list(None), vec![again.clone()]);
        assert!(std::path::Path::new(&again.archive_path).is_file());
        let (restorable, _mark) = f.backups.begin_restore(&again.backup_id).unwrap();
        assert_eq!(restorable, again);
    }

    #[tokio::test]
    async fn unknown_world_and_catalog_reload() {
        let f = fixture();
        let guard = f.sched.acquire(f.inst.id(), OperationKind::Backup).unwrap();
        assert!(matches!(
            f.backups.create(&f.inst, "nether", saves(&f), &guard).await,
            Err(AnvilError::NotFound { kind: "world", .. })
        ));
        let info = f.backups.create(&f.inst, "world", saves(&f), &guard).await.unwrap();

        let reloaded = BackupManager::new(f.backups.root.clone());
        assert_eq!(reloaded.load().await.unwrap(), 1);
        assert_eq!(reloaded.get(&info.backup_id).unwrap(), info);

        reloaded.remove_instance(f.inst.id()).await.unwrap();
        assert!(reloaded.list(None).is_empty());
    }

    #[tokio::test]
    async fn restore_into_active_world_of_live_instance_is_refused() {
        let f = fixture();
        let guard = f.sched.acquire(f.inst.id(), OperationKind::Backup).unwrap();
        let info = f.backups.create(&f.inst, "world", saves(&f), &guard).await.unwrap();
        drop(guard);

        f.inst.record().status = anvil_process::Status::Running;
        let guard = f.sched.acquire(f.inst.id(), OperationKind::Restore).unwrap();
        assert!(matches!(
            f.backups.restore(&info, &f.inst, &guard).await,
            Err(AnvilError::InstanceRunning { .. })
        ));
    }
}
