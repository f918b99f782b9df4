//! Content-addressed store of uploaded world archives.

use std::{io::Cursor, path::PathBuf};

use anvil_process::UploadId;
use anyhow::Context;
use sha1::{Digest, Sha1};

use crate::{
    archive::{extract_zip_safely, single_top_level_dir},
    error::{AnvilError, Result},
    fsutil::normalize_rel_path,
};

#[derive(Debug, Clone)]
pub struct UploadStore {
    root: PathBuf,
    world_marker: Option<String>,
}

impl UploadStore {
    pub fn new(root: PathBuf, world_marker: Option<String>) -> Self {
        Self { root, world_marker }
    }

    /// Store a zipped world. Identical bytes map to the same id; `created` is false then.
    pub async fn upload_world(&self, bytes: Vec<u8>) -> Result<(UploadId, bool)> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || -> Result<(UploadId, bool)> {
            let top = single_top_level_dir(Cursor::new(bytes.as_slice()))?;
            let id = UploadId(hex::encode(Sha1::digest(&bytes)));
            let dir = root.join(&id.0);
            if dir.join(&top).is_dir() {
                return Ok((id, false));
            }

            if dir.exists() && !dir.join(&top).is_dir() {
                std::fs::remove_dir_all(&dir)
                    .with_context(|| format!("remove stale upload {}", dir.display()))?;
            }

            // Each upload extracts into its own staging dir; the first rename wins.
            let staging = root.join(format!(".{}-{}.partial", id.0, uuid::Uuid::new_v4().simple()));
            if let Err(e) = extract_zip_safely(Cursor::new(bytes.as_slice()), &staging) {
                let _ = std::fs::remove_dir_all(&staging);
                return Err(AnvilError::InvalidArchiveShape(format!("{e:#}")));
            }
            if let Err(e) = std::fs::rename(&staging, &dir) {
                let _ = std::fs::remove_dir_all(&staging);
                if dir.join(&top).is_dir() {
                    return Ok((id, false));
                }
                return Err(anyhow::Error::new(e)
                    .context(format!("store upload {}", dir.display()))
                    .into());
            }
            Ok((id, true))
        })
        .await
        .context("upload task")?
    }

    /// Path of the single world directory inside an upload.
    pub fn resolve(&self, upload_id: &UploadId) -> Result<PathBuf> {
        let rel = normalize_rel_path(&upload_id.0)
            .map_err(|_| AnvilError::InvalidWorldSource(format!("bad upload id {upload_id}")))?;
        if rel.components().count() != 1 {
            return Err(AnvilError::InvalidWorldSource(format!(
                "bad upload id {upload_id}"
            )));
        }
        let dir = self.root.join(rel);
        let entries = std::fs::read_dir(&dir).map_err(|_| {
            AnvilError::InvalidWorldSource(format!("upload {upload_id} does not exist"))
        })?;
        let dirs: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n != "__MACOSX")
            })
            .collect();
        let [world] = dirs.as_slice() else {
            return Err(AnvilError::InvalidWorldSource(format!(
                "upload {upload_id} does not contain a single directory"
            )));
        };
        if let Some(marker) = self.world_marker.as_deref()
            && !world.join(marker).is_file()
        {
            return Err(AnvilError::InvalidWorldSource(format!(
                "upload {upload_id} is not a world (missing {marker})"
            )));
        }
        Ok(world.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn world_zip(top: &str, marker: bool) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        zip.add_directory(format!("{top}/"), options).unwrap();
        if marker {
            zip.start_file(format!("{top}/level.dat"), options).unwrap();
            zip.write_all(b"lvl").unwrap();
        }
        zip.start_file(format!("{top}/icon.png"), options).unwrap();
        zip.write_all(b"png").unwrap();
        zip.finish().unwrap().into_inner()
    }

    #[tokio::test]
    async fn identical_uploads_share_an_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path().to_path_buf(), Some("level.dat".to_string()));

        let (a, created) = store.upload_world(world_zip("Hub", true)).await.unwrap();
        assert!(created);
        let (b, created) = store.upload_world(world_zip("Hub", true)).await.unwrap();
        assert!(!created);
        assert_eq!(a, b);

        let path = store.resolve(&a).unwrap();
        assert!(path.ends_with("Hub"));
        assert_eq!(std::fs::read(path.join("level.dat")).unwrap(), b"lvl");
    }

    #[tokio::test]
    async fn concurrent_identical_uploads_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path().to_path_buf(), Some("level.dat".to_string()));

        let uploads = (0..4).map(|_| store.upload_world(world_zip("Hub", true)));
        let results: Vec<(UploadId, bool)> = futures_util::future::join_all(uploads)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(results.iter().filter(|(_, created)| *created).count(), 1);
        assert!(results.iter().all(|(id, _)| id == &results[0].0));

        let path = store.resolve(&results[0].0).unwrap();
        assert_eq!(std::fs::read(path.join("level.dat")).unwrap(), b"lvl");
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().flatten().collect();
        assert_eq!(entries.len(), 1, "staging dirs left behind");
    }

    #[tokio::test]
    async fn resolve_rejects_missing_and_non_world() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path().to_path_buf(), Some("level.dat".to_string()));

        assert!(matches!(
            store.resolve(&UploadId("nope".to_string())),
            Err(AnvilError::InvalidWorldSource(_))
        ));
        assert!(matches!(
            store.resolve(&UploadId("../etc".to_string())),
            Err(AnvilError::InvalidWorldSource(_))
        ));

        let (id, _) = store.upload_world(world_zip("Pics", false)).await.unwrap();
        assert!(matches!(
            store.resolve(&id),
            Err(AnvilError::InvalidWorldSource(_))
        ));
    }

    #[tokio::test]
    async fn badly_shaped_archive_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let store = UploadStore::new(dir.path().to_path_buf(), None);
        let err = store.upload_world(b"PK nope".to_vec()).await.unwrap_err();
        assert!(matches!(err, AnvilError::InvalidArchiveShape(_)));
    }
}
