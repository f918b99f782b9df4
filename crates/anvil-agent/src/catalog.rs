use std::path::{Path, PathBuf};

use anyhow::Context;

use crate::{
    error::{AnvilError, Result},
    fsutil::{copy_dir_recursive, validate_name},
};

/// Source of installable server versions.
#[async_trait::async_trait]
pub trait VersionCatalog: Send + Sync {
    async fn list_available_versions(&self) -> Result<Vec<String>>;

    /// Lay out the server files of `version` inside `target`.
    async fn install(&self, version: &str, target: &Path) -> Result<()>;
}

/// Pre-staged distributions: every subdirectory of `dist_root` is one version.
#[derive(Debug, Clone)]
pub struct DirectoryCatalog {
    dist_root: PathBuf,
}

impl DirectoryCatalog {
    pub fn new(dist_root: PathBuf) -> Self {
        Self { dist_root }
    }

    fn version_dir(&self, version: &str) -> Result<PathBuf> {
        let v = validate_name("version", version)?;
        let dir = self.dist_root.join(v);
        if !dir.is_dir() {
            return Err(AnvilError::NotFound {
                kind: "version",
                id: version.to_string(),
            });
        }
        Ok(dir)
    }
}

#[async_trait::async_trait]
impl VersionCatalog for DirectoryCatalog {
    async fn list_available_versions(&self) -> Result<Vec<String>> {
        let mut out = Vec::new();
        let mut rd = match tokio::fs::read_dir(&self.dist_root).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => {
                return Err(anyhow::Error::new(e)
                    .context(format!("read {}", self.dist_root.display()))
                    .into());
            }
        };
        while let Some(entry) = rd.next_entry().await? {
            if entry.file_type().await.is_ok_and(|t| t.is_dir())
                && let Some(name) = entry.file_name().to_str()
                && !name.starts_with('.')
            {
                out.push(name.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    async fn install(&self, version: &str, target: &Path) -> Result<()> {
        let src = self.version_dir(version)?;
        let target = target.to_path_buf();
        tracing::info!(version, target = %target.display(), "installing server distribution");
        tokio::task::spawn_blocking(move || copy_dir_recursive(&src, &target))
            .await
            .context("install task")?
            .context("copy distribution")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lists_and_installs_staged_versions() {
        let dir = tempfile::tempdir().unwrap();
        let dist = dir.path().join("dist");
        std::fs::create_dir_all(dist.join("1.20.1")).unwrap();
        std::fs::create_dir_all(dist.join("1.19.4")).unwrap();
        std::fs::create_dir_all(dist.join(".cache")).unwrap();
        std::fs::write(dist.join("README"), b"x").unwrap();
        std::fs::write(dist.join("1.20.1").join("server.jar"), b"jar").unwrap();

        let catalog = DirectoryCatalog::new(dist);
        assert_eq!(
            catalog.list_available_versions().await.unwrap(),
            vec!["1.19.4", "1.20.1"]
        );

        let target = dir.path().join("inst");
        catalog.install("1.20.1", &target).await.unwrap();
        assert_eq!(std::fs::read(target.join("server.jar")).unwrap(), b"jar");

        assert!(matches!(
            catalog.install("9.9", &target).await,
            Err(AnvilError::NotFound { kind: "version", .. })
        ));
    }

    #[tokio::test]
    async fn missing_dist_root_means_no_versions() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = DirectoryCatalog::new(dir.path().join("absent"));
        assert!(catalog.list_available_versions().await.unwrap().is_empty());
    }
}
