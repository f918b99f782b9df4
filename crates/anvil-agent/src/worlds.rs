//! World directories of an instance and save suspension around snapshots.

use std::{future::Future, path::Path, sync::Arc, time::Duration};

use anvil_process::{WorldGenerationSettings, WorldInfo};
use anyhow::Context;

use crate::{
    console::ConsoleSignal,
    error::{AnvilError, Result},
    fsutil::{copy_dir_recursive, validate_name},
    instance::{Instance, WorldEntry},
    properties,
    scheduler::OperationGuard,
    supervisor::ProcessSupervisor,
};

const SAVE_POLL: Duration = Duration::from_millis(100);

pub fn list(inst: &Instance) -> Vec<WorldInfo> {
    let rec = inst.record();
    let active = rec.active_world().map(str::to_string);
    rec.worlds
        .iter()
        .map(|w| WorldInfo {
            name: w.name.clone(),
            path: inst.world_dir(&w.name).display().to_string(),
            version: w.version.clone(),
            world_type: w.world_type.clone(),
            active: active.as_deref() == Some(w.name.as_str()),
        })
        .collect()
}

fn world_not_found(name: &str) -> AnvilError {
    AnvilError::NotFound {
        kind: "world",
        id: name.to_string(),
    }
}

fn ensure_absent(inst: &Instance, name: &str) -> Result<()> {
    if inst.record().has_world(name) || inst.world_dir(name).exists() {
        return Err(AnvilError::NameConflict(format!(
            "world {name:?} already exists"
        )));
    }
    Ok(())
}

/// Register an empty world; the server generates it on first start.
pub async fn create(
    inst: &Arc<Instance>,
    name: &str,
    settings: WorldGenerationSettings,
) -> Result<WorldInfo> {
    let name = validate_name("world name", name)?;
    ensure_absent(inst, &name)?;
    let dir = inst.world_dir(&name);
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("create {}", dir.display()))?;
    {
        let mut rec = inst.record();
        let version = rec.version.clone();
        rec.worlds.push(WorldEntry {
            name: name.clone(),
            version: Some(version),
            world_type: settings.level_type.clone(),
            generation: Some(settings),
        });
    }
    inst.persist().await?;
    inst.system_line(format!("world {name} created"));
    find(inst, &name)
}

/// Point `level-name` at `name`. Refused while the server may be running.
pub async fn change(inst: &Arc<Instance>, name: &str) -> Result<()> {
    {
        let mut rec = inst.record();
        let live = rec.status;
        if live.is_live() {
            return Err(AnvilError::InstanceRunning {
                instance_id: inst.id().clone(),
                status: live,
            });
        }
        let entry = rec
            .worlds
            .iter()
            .find(|w| w.name == name)
            .cloned()
            .ok_or_else(|| world_not_found(name))?;
        rec.properties.insert(
            properties::LEVEL_NAME.to_string(),
            anvil_process::PropertyValue::Text(properties::world_level_name(name)),
        );
        if let Some(settings) = &entry.generation {
            properties::apply_generation(&mut rec.properties, settings);
        }
    }
    inst.persist().await?;
    inst.system_line(format!("active world changed to {name}"));
    Ok(())
}

/// Copy `src` into a fresh `dst` through a staging directory, honouring cancellation.
pub async fn copy_tree(src: &Path, dst: &Path, guard: &OperationGuard) -> Result<()> {
    let staging = match dst.file_name() {
        Some(name) => dst.with_file_name(format!(".{}.partial", name.to_string_lossy())),
        None => return Err(AnvilError::InvalidArgument(format!("bad target {}", dst.display()))),
    };
    let (from, to) = (src.to_path_buf(), staging.clone());
    let copied = tokio::task::spawn_blocking(move || {
        let _ = std::fs::remove_dir_all(&to);
        copy_dir_recursive(&from, &to)
    })
    .await
    .context("copy task")
    .and_then(|r| r);

    if let Err(e) = copied {
        let _ = tokio::fs::remove_dir_all(&staging).await;
        return Err(e.into());
    }
    if guard.is_cancelled() {
        let _ = tokio::fs::remove_dir_all(&staging).await;
        return Err(AnvilError::Cancelled);
    }
    tokio::fs::rename(&staging, dst)
        .await
        .with_context(|| format!("move {} into place", dst.display()))?;
    Ok(())
}

/// Saving control through the server console.
#[derive(Debug, Clone, Copy)]
pub struct SaveControl<'a> {
    pub supervisor: &'a ProcessSupervisor,
    pub save_timeout: Duration,
}

impl SaveControl<'_> {
    /// True when `world` is the active world of a server that may be writing to it.
    pub fn world_in_use(&self, inst: &Instance, world: &str) -> bool {
        let rec = inst.record();
        rec.status.is_live() && rec.active_world() == Some(world)
    }

    /// Run `f` while the server's automatic saving is off and a full save has been flushed.
    ///
    /// Without a running process `f` runs directly; a live server whose dialect cannot
    /// suspend saving is refused with `InstanceRunning`.
    pub async fn with_saves_suspended<T, F, Fut>(&self, inst: &Instance, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(handle) = self.supervisor.handle(inst.id()) else {
            return f().await;
        };
        let dialect = inst.dialect();
        let (Some(off), Some(on)) = (
            dialect.save_off_command.clone(),
            dialect.save_on_command.clone(),
        ) else {
            return Err(AnvilError::InstanceRunning {
                instance_id: inst.id().clone(),
                status: inst.status(),
            });
        };

        self.supervisor.write_line(&handle, &off).await?;
        let mut cursor = inst.last_log_seq();
        if let Some(all) = dialect.save_all_command.clone() {
            self.supervisor.write_line(&handle, &all).await?;
            let deadline = tokio::time::Instant::now() + self.save_timeout;
            let mut confirmed = false;
            while !confirmed && tokio::time::Instant::now() < deadline {
                let (lines, next) = inst.logs_after(cursor, 200);
                cursor = next;
                confirmed = lines
                    .iter()
                    .any(|l| dialect.classify(l) == Some(ConsoleSignal::SaveConfirmed));
                if !confirmed {
                    tokio::time::sleep(SAVE_POLL).await;
                }
            }
            if confirmed {
                inst.system_line("world save confirmed");
            } else {
                inst.system_line("world save not confirmed before timeout; snapshot may be stale");
            }
        }

        let res = f().await;
        if let Err(e) = self.supervisor.write_line(&handle, &on).await {
            tracing::warn!(instance_id = %inst.id(), error = %e, "could not re-enable saving");
        }
        res
    }
}

/// Copy world `src` to a new world `dst` of the same instance.
pub async fn copy(
    inst: &Arc<Instance>,
    saves: SaveControl<'_>,
    guard: &OperationGuard,
    src: &str,
    dst: &str,
) -> Result<WorldInfo> {
    let dst = validate_name("world name", dst)?;
    let entry = inst
        .record()
        .worlds
        .iter()
        .find(|w| w.name == src)
        .cloned()
        .ok_or_else(|| world_not_found(src))?;
    ensure_absent(inst, &dst)?;

    let (from, to) = (inst.world_dir(src), inst.world_dir(&dst));
    if saves.world_in_use(inst, src) {
        saves
            .with_saves_suspended(inst, || copy_tree(&from, &to, guard))
            .await?;
    } else {
        copy_tree(&from, &to, guard).await?;
    }

    inst.record().worlds.push(WorldEntry {
        name: dst.clone(),
        ..entry
    });
    inst.persist().await?;
    inst.system_line(format!("world {src} copied to {dst}"));
    find(inst, &dst)
}

/// Add an uploaded world directory as a new world.
pub async fn import(
    inst: &Arc<Instance>,
    guard: &OperationGuard,
    upload_dir: &Path,
) -> Result<WorldInfo> {
    let name = upload_dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| AnvilError::InvalidWorldSource("upload has no directory name".to_string()))?;
    let name = validate_name("world name", name)
        .map_err(|e| AnvilError::InvalidWorldSource(e.to_string()))?;
    ensure_absent(inst, &name)?;

    copy_tree(upload_dir, &inst.world_dir(&name), guard).await?;
    inst.record().worlds.push(WorldEntry {
        name: name.clone(),
        version: None,
        world_type: None,
        generation: None,
    });
    inst.persist().await?;
    inst.system_line(format!("world {name} imported"));
    find(inst, &name)
}

fn find(inst: &Instance, name: &str) -> Result<WorldInfo> {
    list(inst)
        .into_iter()
        .find(|w| w.name == name)
        .ok_or_else(|| world_not_found(name))
}

/// Worlds of an instance that is not running can be replaced freely.
pub fn ensure_replaceable(inst: &Instance, world: &str) -> Result<()> {
    let rec = inst.record();
    if rec.status.is_live() && rec.active_world() == Some(world) {
        return Err(AnvilError::InstanceRunning {
            instance_id: inst.id().clone(),
            status: rec.status,
        });
    }
    if !rec.has_world(world) {
        return Err(world_not_found(world));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ConsoleDialect,
        instance::{InstanceSettings, tests::record},
        scheduler::{OperationKind, OperationScheduler},
    };
    use anvil_process::Status;

    fn instance(dir: &Path) -> Arc<Instance> {
        let settings = InstanceSettings {
            log_max_lines: 100,
            log_file_max_bytes: 1024 * 1024,
            log_file_max_files: 2,
            subscriber_queue: 64,
            dialect: Arc::new(ConsoleDialect::default()),
        };
        let inst = Instance::new(dir.join("inst"), record("A"), &settings);
        std::fs::create_dir_all(inst.world_dir("world")).unwrap();
        inst
    }

    #[tokio::test]
    async fn create_then_activate_world() {
        let dir = tempfile::tempdir().unwrap();
        let inst = instance(dir.path());
        let settings = WorldGenerationSettings {
            seed: Some("1234".to_string()),
            level_type: Some("minecraft:flat".to_string()),
            generate_structures: None,
        };
        let info = create(&inst, "flat", settings).await.unwrap();
        assert_eq!(info.world_type.as_deref(), Some("minecraft:flat"));
        assert!(!info.active);
        assert!(matches!(
            create(&inst, "flat", WorldGenerationSettings::default()).await,
            Err(AnvilError::NameConflict(_))
        ));
        assert!(matches!(
            create(&inst, "../escape", WorldGenerationSettings::default()).await,
            Err(AnvilError::InvalidArgument(_))
        ));

        change(&inst, "flat").await.unwrap();
        let rec = inst.record().clone();
        assert_eq!(rec.active_world(), Some("flat"));
        assert_eq!(properties::get_text(&rec.properties, "level-seed"), Some("1234"));
        assert!(matches!(
            change(&inst, "missing").await,
            Err(AnvilError::NotFound { kind: "world", .. })
        ));
    }

    #[tokio::test]
    async fn live_instance_keeps_its_active_world() {
        let dir = tempfile::tempdir().unwrap();
        let inst = instance(dir.path());
        create(&inst, "other", WorldGenerationSettings::default())
            .await
            .unwrap();
        inst.record().status = Status::Running;

        assert!(matches!(
            change(&inst, "other").await,
            Err(AnvilError::InstanceRunning { .. })
        ));
        assert!(matches!(
            ensure_replaceable(&inst, "world"),
            Err(AnvilError::InstanceRunning { .. })
        ));
        ensure_replaceable(&inst, "other").unwrap();
    }

    #[tokio::test]
    async fn cancelled_copy_leaves_no_target() {
        let dir = tempfile::tempdir().unwrap();
        let inst = instance(dir.path());
        std::fs::write(inst.world_dir("world").join("level.dat"), b"x").unwrap();

        let sched = OperationScheduler::new();
        let guard = sched.acquire(inst.id(), OperationKind::CopyWorld).unwrap();
        sched.cancel(inst.id());
        let target = inst.world_dir("copy");
        assert!(matches!(
            copy_tree(&inst.world_dir("world"), &target, &guard).await,
            Err(AnvilError::Cancelled)
        ));
        assert!(!target.exists());
        assert_eq!(
            std::fs::read_dir(inst.worlds_dir()).unwrap().count(),
            1,
            "staging directory left behind"
        );
    }
}
