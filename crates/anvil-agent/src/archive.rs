//! Zip snapshots of world directories.

use std::{
    collections::BTreeSet,
    fs,
    io::{Read, Seek, Write},
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::Context;
use sha1::{Digest, Sha1};

use crate::{
    error::{AnvilError, Result},
    fsutil::{list_files, normalize_rel_path},
};

const IGNORED_TOP_LEVEL: [&str; 2] = ["__MACOSX", ".DS_Store"];

/// Zip every file under `src` into `dst` and return the sha1 of paths + contents.
///
/// The archive is built next to `dst` and only renamed into place once complete;
/// a raised `cancel` flag aborts the snapshot and removes the partial file.
pub fn zip_dir(src: &Path, dst: &Path, salt: &str, cancel: &AtomicBool) -> Result<String> {
    let partial = dst.with_extension("zip.partial");
    match write_zip(src, &partial, salt, cancel) {
        Ok(Some(digest)) => {
            fs::rename(&partial, dst)
                .with_context(|| format!("persist archive {}", dst.display()))?;
            Ok(digest)
        }
        Ok(None) => {
            let _ = fs::remove_file(&partial);
            Err(AnvilError::Cancelled)
        }
        Err(e) => {
            let _ = fs::remove_file(&partial);
            Err(e.into())
        }
    }
}

fn write_zip(
    src: &Path,
    dst: &Path,
    salt: &str,
    cancel: &AtomicBool,
) -> anyhow::Result<Option<String>> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let files = list_files(src)?;
    let out = fs::File::create(dst).with_context(|| format!("create {}", dst.display()))?;
    let mut zip = zip::ZipWriter::new(out);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);

    let mut hasher = Sha1::new();
    hasher.update(salt.as_bytes());
    let mut buf = vec![0u8; 64 * 1024];

    for rel in files {
        if cancel.load(Ordering::Relaxed) {
            return Ok(None);
        }
        let name = rel.to_string_lossy().replace('\\', "/");
        hasher.update([0u8]);
        hasher.update(name.as_bytes());
        hasher.update([0u8]);

        zip.start_file(name.clone(), options)
            .with_context(|| format!("add {name} to archive"))?;
        let mut f = fs::File::open(src.join(&rel))
            .with_context(|| format!("open {}", src.join(&rel).display()))?;
        loop {
            let n = f.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            zip.write_all(&buf[..n])?;
        }
    }

    let out = zip.finish().context("finish archive")?;
    out.sync_all().ok();
    Ok(Some(hex::encode(hasher.finalize())))
}

/// Extract an archive into `out_dir`, refusing entries that would escape it.
pub fn extract_zip_safely<R: Read + Seek>(reader: R, out_dir: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(out_dir)?;
    let mut archive = zip::ZipArchive::new(reader)?;

    for i in 0..archive.len() {
        let mut file = archive.by_index(i)?;
        let name = file.name().to_string();
        let trimmed = name.trim_end_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        let rel = normalize_rel_path(trimmed)
            .map_err(|e| anyhow::anyhow!("invalid zip path {trimmed:?}: {e}"))?;
        if rel.as_os_str().is_empty() {
            continue;
        }

        let out_path = out_dir.join(&rel);
        if name.ends_with('/') {
            fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = out_path.with_extension("tmp");
        let mut out = fs::File::create(&tmp_path)?;
        std::io::copy(&mut file, &mut out)?;
        out.sync_all().ok();
        fs::rename(&tmp_path, &out_path)?;
    }
    Ok(())
}

pub fn extract_zip_file(zip_path: &Path, out_dir: &Path) -> anyhow::Result<()> {
    let f = fs::File::open(zip_path).with_context(|| format!("open {}", zip_path.display()))?;
    extract_zip_safely(f, out_dir)
}

/// Name of the one directory every entry of the archive lives under.
pub fn single_top_level_dir<R: Read + Seek>(reader: R) -> Result<String> {
    let mut archive = zip::ZipArchive::new(reader)
        .map_err(|e| AnvilError::InvalidArchiveShape(format!("not a zip archive: {e}")))?;

    let mut tops = BTreeSet::new();
    let mut nested = false;
    for i in 0..archive.len() {
        let file = archive
            .by_index_raw(i)
            .map_err(|e| AnvilError::InvalidArchiveShape(e.to_string()))?;
        let name = file.name().trim_start_matches("./");
        let mut parts = name.split('/').filter(|p| !p.is_empty());
        let Some(top) = parts.next() else {
            continue;
        };
        if IGNORED_TOP_LEVEL.contains(&top) {
            continue;
        }
        if parts.next().is_some() || name.ends_with('/') {
            nested = true;
        }
        tops.insert(top.to_string());
    }

    match (tops.len(), nested) {
        (1, true) => Ok(tops.into_iter().next().unwrap_or_default()),
        (0, _) => Err(AnvilError::InvalidArchiveShape("archive is empty".to_string())),
        (1, false) => Err(AnvilError::InvalidArchiveShape(
            "archive must contain a directory, not a single file".to_string(),
        )),
        (n, _) => Err(AnvilError::InvalidArchiveShape(format!(
            "archive must contain exactly one top-level directory, found {n} entries"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in entries {
            if name.ends_with('/') {
                zip.add_directory(name.to_string(), options).unwrap();
            } else {
                zip.start_file(name.to_string(), options).unwrap();
                zip.write_all(data).unwrap();
            }
        }
        zip.finish().unwrap().into_inner()
    }

    fn sample_world(root: &Path) {
        fs::create_dir_all(root.join("region")).unwrap();
        fs::write(root.join("level.dat"), b"\x0a\x00level").unwrap();
        fs::write(root.join("region").join("r.0.0.mca"), vec![7u8; 200_000]).unwrap();
    }

    #[test]
    fn snapshot_restores_byte_for_byte() {
        let dir = tempfile::tempdir().unwrap();
        let world = dir.path().join("world");
        sample_world(&world);

        let archive = dir.path().join("b").join("x.zip");
        let cancel = AtomicBool::new(false);
        let digest = zip_dir(&world, &archive, "inst/world", &cancel).unwrap();
        assert_eq!(digest.len(), 40);

        let restored = dir.path().join("restored");
        extract_zip_file(&archive, &restored).unwrap();
        assert_eq!(list_files(&restored).unwrap(), list_files(&world).unwrap());
        for rel in list_files(&world).unwrap() {
            assert_eq!(
                fs::read(world.join(&rel)).unwrap(),
                fs::read(restored.join(&rel)).unwrap()
            );
        }
    }

    #[test]
    fn digest_follows_content() {
        let dir = tempfile::tempdir().unwrap();
        let world = dir.path().join("world");
        sample_world(&world);
        let cancel = AtomicBool::new(false);

        let a = zip_dir(&world, &dir.path().join("a.zip"), "s", &cancel).unwrap();
        let b = zip_dir(&world, &dir.path().join("b.zip"), "s", &cancel).unwrap();
        assert_eq!(a, b);

        fs::write(world.join("level.dat"), b"changed").unwrap();
        let c = zip_dir(&world, &dir.path().join("c.zip"), "s", &cancel).unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn cancelled_snapshot_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let world = dir.path().join("world");
        sample_world(&world);
        let archive = dir.path().join("x.zip");

        let cancel = AtomicBool::new(true);
        let err = zip_dir(&world, &archive, "s", &cancel).unwrap_err();
        assert!(matches!(err, AnvilError::Cancelled));
        assert!(!archive.exists());
        assert!(!archive.with_extension("zip.partial").exists());
    }

    #[test]
    fn top_level_shape() {
        let ok = zip_bytes(&[("MyWorld/", b""), ("MyWorld/level.dat", b"x")]);
        assert_eq!(single_top_level_dir(Cursor::new(ok)).unwrap(), "MyWorld");

        let mac = zip_bytes(&[("w/level.dat", b"x"), ("__MACOSX/w/._level.dat", b"y")]);
        assert_eq!(single_top_level_dir(Cursor::new(mac)).unwrap(), "w");

        let two = zip_bytes(&[("a/level.dat", b"x"), ("b/level.dat", b"y")]);
        assert!(matches!(
            single_top_level_dir(Cursor::new(two)),
            Err(AnvilError::InvalidArchiveShape(_))
        ));

        let flat = zip_bytes(&[("level.dat", b"x")]);
        assert!(matches!(
            single_top_level_dir(Cursor::new(flat)),
            Err(AnvilError::InvalidArchiveShape(_))
        ));

        assert!(matches!(
            single_top_level_dir(Cursor::new(b"not a zip".to_vec())),
            Err(AnvilError::InvalidArchiveShape(_))
        ));
    }

    #[test]
    fn extraction_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let evil = zip_bytes(&[("../evil.txt", b"x")]);
        assert!(extract_zip_safely(Cursor::new(evil), &dir.path().join("out")).is_err());
        assert!(!dir.path().join("evil.txt").exists());
    }
}
