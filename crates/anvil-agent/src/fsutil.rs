use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use tokio::io::AsyncWriteExt;

use crate::error::AnvilError;

pub fn normalize_rel_path(rel: &str) -> Result<PathBuf, AnvilError> {
    if rel.is_empty() {
        return Ok(PathBuf::new());
    }
    let p = Path::new(rel);
    if p.is_absolute() {
        return Err(AnvilError::InvalidArgument("path must be relative".to_string()));
    }

    let mut out = PathBuf::new();
    for c in p.components() {
        match c {
            Component::CurDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => {
                return Err(AnvilError::InvalidArgument(
                    "path traversal is not allowed".to_string(),
                ));
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(AnvilError::InvalidArgument("path must be relative".to_string()));
            }
        }
    }
    Ok(out)
}

/// A single path segment usable as a world or directory name.
pub fn validate_name(kind: &str, name: &str) -> Result<String, AnvilError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(AnvilError::InvalidArgument(format!("{kind} must be non-empty")));
    }
    if name.len() > 128 {
        return Err(AnvilError::InvalidArgument(format!("{kind} is too long")));
    }
    if name == "." || name == ".." || name.starts_with('.') {
        return Err(AnvilError::InvalidArgument(format!("invalid {kind}: {name}")));
    }
    if !name
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '-' | '_' | '.' | ' '))
    {
        return Err(AnvilError::InvalidArgument(format!("invalid {kind}: {name}")));
    }
    Ok(name.to_string())
}

/// Write JSON via a temp file + rename so readers never see a torn file.
pub async fn write_json_atomic<T: serde::Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create {}", parent.display()))?;
    }
    let tmp = path.with_extension("json.tmp");
    let data = serde_json::to_vec_pretty(value).context("serialize json")?;
    let mut f = tokio::fs::File::create(&tmp)
        .await
        .with_context(|| format!("create {}", tmp.display()))?;
    f.write_all(&data)
        .await
        .with_context(|| format!("write {}", tmp.display()))?;
    f.flush().await.ok();
    f.sync_all().await.ok();
    tokio::fs::rename(&tmp, path)
        .await
        .with_context(|| format!("persist {}", path.display()))?;
    Ok(())
}

pub async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<T> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parse {}", path.display()))
}

/// Recursive copy; symlinks are skipped so a world cannot smuggle links out of its root.
pub fn copy_dir_recursive(src: &Path, dst: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dst).with_context(|| format!("create {}", dst.display()))?;
    for entry in std::fs::read_dir(src).with_context(|| format!("read {}", src.display()))? {
        let entry = entry?;
        let path = entry.path();
        let meta = std::fs::symlink_metadata(&path)?;
        if meta.file_type().is_symlink() {
            continue;
        }
        let target = dst.join(entry.file_name());
        if meta.is_dir() {
            copy_dir_recursive(&path, &target)?;
        } else if meta.is_file() {
            std::fs::copy(&path, &target)
                .with_context(|| format!("copy {} -> {}", path.display(), target.display()))?;
        }
    }
    Ok(())
}

/// All regular files under `root` as sorted relative paths.
pub fn list_files(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    fn walk(root: &Path, cur: &Path, out: &mut Vec<PathBuf>) -> anyhow::Result<()> {
        for entry in std::fs::read_dir(cur).with_context(|| format!("read {}", cur.display()))? {
            let entry = entry?;
            let path = entry.path();
            let meta = std::fs::symlink_metadata(&path)?;
            if meta.file_type().is_symlink() {
                continue;
            }
            if meta.is_dir() {
                walk(root, &path, out)?;
            } else if meta.is_file()
                && let Ok(rel) = path.strip_prefix(root)
            {
                out.push(rel.to_path_buf());
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    walk(root, root, &mut out)?;
    out.sort();
    Ok(out)
}

/// Hidden sibling `.<name>.anvil-old`; valid names never start with a dot.
fn set_aside_path(target: &Path) -> anyhow::Result<PathBuf> {
    let name = target
        .file_name()
        .with_context(|| format!("no directory name in {}", target.display()))?;
    let mut aside = std::ffi::OsString::from(".");
    aside.push(name);
    aside.push(".anvil-old");
    Ok(target.with_file_name(aside))
}

/// Swap `staged` into `target`, keeping `target` intact if the swap fails half way.
pub fn replace_dir(staged: &Path, target: &Path) -> anyhow::Result<()> {
    let old = set_aside_path(target)?;
    if old.exists() {
        std::fs::remove_dir_all(&old).with_context(|| format!("remove {}", old.display()))?;
    }
    let had_target = target.exists();
    if had_target {
        std::fs::rename(target, &old)
            .with_context(|| format!("move aside {}", target.display()))?;
    }
    if let Err(e) = std::fs::rename(staged, target) {
        if had_target {
            let _ = std::fs::rename(&old, target);
        }
        return Err(e).with_context(|| format!("move into place {}", target.display()));
    }
    if had_target {
        std::fs::remove_dir_all(&old).ok();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rel_paths_cannot_escape() {
        assert_eq!(normalize_rel_path("a/./b").unwrap(), PathBuf::from("a/b"));
        assert!(normalize_rel_path("../etc").is_err());
        assert!(normalize_rel_path("/etc/passwd").is_err());
        assert_eq!(normalize_rel_path("").unwrap(), PathBuf::new());
    }

    #[test]
    fn names_are_single_segments() {
        assert_eq!(validate_name("world", " My World ").unwrap(), "My World");
        assert!(validate_name("world", "a/b").is_err());
        assert!(validate_name("world", "..").is_err());
        assert!(validate_name("world", ".hidden").is_err());
        assert!(validate_name("world", "").is_err());
    }

    #[test]
    fn copy_and_list_files() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        std::fs::create_dir_all(src.join("region")).unwrap();
        std::fs::write(src.join("level.dat"), b"lvl").unwrap();
        std::fs::write(src.join("region").join("r.0.0.mca"), b"mca").unwrap();

        let dst = dir.path().join("dst");
        copy_dir_recursive(&src, &dst).unwrap();
        assert_eq!(
            list_files(&dst).unwrap(),
            vec![PathBuf::from("level.dat"), PathBuf::from("region/r.0.0.mca")]
        );
        assert_eq!(std::fs::read(dst.join("region/r.0.0.mca")).unwrap(), b"mca");
    }

    #[test]
    fn replace_dir_swaps_contents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("world");
        let staged = dir.path().join("staged");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("old.txt"), b"old").unwrap();
        std::fs::create_dir_all(&staged).unwrap();
        std::fs::write(staged.join("new.txt"), b"new").unwrap();

        replace_dir(&staged, &target).unwrap();
        assert!(!staged.exists());
        assert!(!target.join("old.txt").exists());
        assert_eq!(std::fs::read(target.join("new.txt")).unwrap(), b"new");
    }

    #[test]
    fn replace_dir_leaves_dotted_siblings_alone() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.x", "a.y", "a.anvil-old"] {
            std::fs::create_dir_all(dir.path().join(name)).unwrap();
            std::fs::write(dir.path().join(name).join("keep"), name).unwrap();
        }
        let staged = dir.path().join("staged");
        std::fs::create_dir_all(&staged).unwrap();
        std::fs::write(staged.join("new.txt"), b"new").unwrap();

        let target = dir.path().join("a.x");
        assert_ne!(
            set_aside_path(&target).unwrap(),
            set_aside_path(&dir.path().join("a.y")).unwrap()
        );
        replace_dir(&staged, &target).unwrap();

        assert_eq!(std::fs::read(target.join("new.txt")).unwrap(), b"new");
        for name in ["a.y", "a.anvil-old"] {
            assert_eq!(
                std::fs::read_to_string(dir.path().join(name).join("keep")).unwrap(),
                name
            );
        }
        assert!(!dir.path().join(".a.x.anvil-old").exists());
    }

    #[tokio::test]
    async fn json_round_trips_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("x.json");
        write_json_atomic(&path, &vec![1, 2, 3]).await.unwrap();
        let back: Vec<i32> = read_json(&path).await.unwrap();
        assert_eq!(back, vec![1, 2, 3]);
        assert!(!path.with_extension("json.tmp").exists());
    }
}
