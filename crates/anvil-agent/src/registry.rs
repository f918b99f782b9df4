//! Authoritative id → instance mapping, persisted as `catalog.json`.

use std::{
    collections::{BTreeSet, HashMap},
    path::PathBuf,
    sync::{Arc, RwLock},
};

use anvil_process::{InstanceId, Status, UploadId, WorldGenerationSettings};
use anyhow::Context;

use crate::{
    error::{AnvilError, Result},
    fsutil::{copy_dir_recursive, read_json, validate_name, write_json_atomic},
    instance::{Instance, InstanceRecord, InstanceSettings, RECORD_FILE, WorldEntry},
    properties,
    resources::now_unix_ms,
    state_machine,
    uploads::UploadStore,
};

pub const DEFAULT_WORLD: &str = "world";

/// Initial world of a new instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorldSource {
    Generate(WorldGenerationSettings),
    Uploaded(UploadId),
}

impl Default for WorldSource {
    fn default() -> Self {
        WorldSource::Generate(WorldGenerationSettings::default())
    }
}

#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct CatalogFile {
    instances: Vec<InstanceId>,
}

#[derive(Debug, Default)]
struct Catalog {
    order: Vec<InstanceId>,
    by_id: HashMap<InstanceId, Arc<Instance>>,
}

#[derive(Debug)]
pub struct InstanceRegistry {
    data_root: PathBuf,
    settings: InstanceSettings,
    uploads: UploadStore,
    catalog: RwLock<Catalog>,
    // Serializes create/delete so name checks and directory reservation cannot interleave.
    mutate: tokio::sync::Mutex<()>,
}

fn normalized_name(name: &str) -> String {
    name.trim().to_lowercase()
}

fn validate_display_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() || name.chars().count() > 64 {
        return Err(AnvilError::InvalidArgument(
            "name must be 1..=64 characters".to_string(),
        ));
    }
    if name.chars().any(char::is_control) {
        return Err(AnvilError::InvalidArgument(
            "name must not contain control characters".to_string(),
        ));
    }
    Ok(name.to_string())
}

impl InstanceRegistry {
    pub fn new(data_root: PathBuf, settings: InstanceSettings, uploads: UploadStore) -> Self {
        Self {
            data_root,
            settings,
            uploads,
            catalog: RwLock::new(Catalog::default()),
            mutate: tokio::sync::Mutex::new(()),
        }
    }

    fn instances_dir(&self) -> PathBuf {
        self.data_root.join("instances")
    }

    fn catalog_path(&self) -> PathBuf {
        self.data_root.join("catalog.json")
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Catalog> {
        self.catalog.read().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Catalog> {
        self.catalog.write().unwrap_or_else(|p| p.into_inner())
    }

    pub fn get(&self, id: &InstanceId) -> Result<Arc<Instance>> {
        self.read()
            .by_id
            .get(id)
            .cloned()
            .ok_or_else(|| AnvilError::instance_not_found(id))
    }

    /// Instances in creation order.
    pub fn list(&self) -> Vec<Arc<Instance>> {
        let c = self.read();
        c.order
            .iter()
            .filter_map(|id| c.by_id.get(id).cloned())
            .collect()
    }

    pub async fn create(&self, name: &str, version: &str, world: WorldSource) -> Result<InstanceId> {
        let name = validate_display_name(name)?;
        let version = validate_name("version", version)?;
        let _mutate = self.mutate.lock().await;

        let wanted = normalized_name(&name);
        if self
            .list()
            .iter()
            .any(|i| normalized_name(&i.record().name) == wanted)
        {
            return Err(AnvilError::NameConflict(format!(
                "an instance named {name:?} already exists"
            )));
        }

        let upload = match &world {
            WorldSource::Uploaded(upload_id) => Some(self.uploads.resolve(upload_id)?),
            WorldSource::Generate(_) => None,
        };
        let world_name = match &upload {
            Some(path) => {
                let dir = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or(DEFAULT_WORLD);
                validate_name("world name", dir)
                    .map_err(|e| AnvilError::InvalidWorldSource(e.to_string()))?
            }
            None => DEFAULT_WORLD.to_string(),
        };

        let id = InstanceId::new();
        let root = self.instances_dir().join(&id.0);
        if root.exists() {
            return Err(AnvilError::NameConflict(format!(
                "instance directory {} already exists",
                root.display()
            )));
        }

        let mut props = properties::defaults(&name, &world_name);
        if let WorldSource::Generate(settings) = &world {
            properties::apply_generation(&mut props, settings);
        }
        let record = InstanceRecord {
            id: id.clone(),
            name: name.clone(),
            version: version.clone(),
            installed: false,
            status: Status::NotInstalled,
            message: None,
            worlds: vec![WorldEntry {
                name: world_name.clone(),
                version: upload.as_ref().map(|_| version.clone()),
                world_type: None,
                generation: None,
            }],
            properties: props,
            operators: BTreeSet::new(),
            banned: BTreeSet::new(),
            created_at_unix_ms: now_unix_ms(),
            online: BTreeSet::new(),
        };

        let world_dir = root.join("worlds").join(&world_name);
        let laid_out = tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            std::fs::create_dir_all(&world_dir)
                .with_context(|| format!("create {}", world_dir.display()))?;
            if let Some(src) = upload {
                copy_dir_recursive(&src, &world_dir)?;
            }
            Ok(())
        })
        .await
        .context("create instance task")
        .and_then(|r| r);

        let instance = Instance::new(root.clone(), record, &self.settings);
        let persisted = match laid_out {
            Ok(()) => instance.persist().await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = persisted {
            let _ = tokio::fs::remove_dir_all(&root).await;
            return Err(e);
        }

        {
            let mut c = self.write();
            c.order.push(id.clone());
            c.by_id.insert(id.clone(), instance);
        }
        self.flush_catalog().await?;
        tracing::info!(instance_id = %id, name = %name, version = %version, "instance created");
        Ok(id)
    }

    /// Remove the instance's files and catalog entry. Refused while a process may be live.
    pub async fn delete(&self, id: &InstanceId) -> Result<()> {
        let _mutate = self.mutate.lock().await;
        let instance = self.get(id)?;
        {
            let rec = instance.record();
            if !state_machine::can_delete(rec.status) {
                return Err(AnvilError::InstanceRunning {
                    instance_id: id.clone(),
                    status: rec.status,
                });
            }
        }

        instance.retire().await;
        match tokio::fs::remove_dir_all(instance.root()).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("remove {}", instance.root().display()))
                    .into());
            }
        }
        {
            let mut c = self.write();
            c.order.retain(|x| x != id);
            c.by_id.remove(id);
        }
        self.flush_catalog().await?;
        tracing::info!(instance_id = %id, "instance deleted");
        Ok(())
    }

    async fn flush_catalog(&self) -> Result<()> {
        let file = CatalogFile {
            instances: self.read().order.clone(),
        };
        write_json_atomic(&self.catalog_path(), &file).await?;
        Ok(())
    }

    /// Persist the catalog and every instance record.
    pub async fn flush(&self) -> Result<()> {
        self.flush_catalog().await?;
        for inst in self.list() {
            inst.persist().await?;
        }
        Ok(())
    }

    /// Reload persisted instances. No process survives a restart, so live statuses are reset.
    pub async fn load(&self) -> Result<usize> {
        let path = self.catalog_path();
        if tokio::fs::metadata(&path).await.is_err() {
            return Ok(0);
        }
        let file: CatalogFile = read_json(&path).await?;

        let mut loaded = Vec::new();
        for id in file.instances {
            let root = self.instances_dir().join(&id.0);
            let mut record: InstanceRecord = match read_json(&root.join(RECORD_FILE)).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(instance_id = %id, error = %format!("{e:#}"), "skipping unreadable instance");
                    continue;
                }
            };
            let reset = match record.status {
                Status::Starting | Status::Running | Status::Stopping => Some(Status::Stopped),
                Status::Installing if record.installed => Some(Status::Stopped),
                Status::Installing => Some(Status::NotInstalled),
                _ => None,
            };
            if let Some(status) = reset {
                tracing::info!(instance_id = %id, from = %record.status, to = %status, "resetting status after restart");
                record.status = status;
                record.message = None;
            }
            let instance = Instance::new(root, record, &self.settings);
            if reset.is_some() {
                instance.persist().await?;
            }
            loaded.push(instance);
        }

        let n = loaded.len();
        {
            let mut c = self.write();
            for inst in loaded {
                let id = inst.id().clone();
                if c.by_id.insert(id.clone(), inst).is_none() {
                    c.order.push(id);
                }
            }
        }
        self.flush_catalog().await?;
        tracing::info!(instances = n, "instance catalog loaded");
        Ok(n)
    }
}
