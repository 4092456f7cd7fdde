//! Filesystem primitives shared by every pipeline.
//!
//! Durable writes go through [`atomic_write`]: temp sibling, fsync, rename
//! over the target, fsync of the parent directory. Staging directories and
//! temp files all carry a `.tmp-<hex>` suffix so doctor can recognize and
//! reap partial work unambiguously.

use std::fs::{self, File, OpenOptions};
use std::io::Write as IoWrite;
use std::path::{Component, Path, PathBuf};

use rand::Rng as _;

use crate::error::{JvsError, Result};

/// Prefix shared by every transient artifact (`<name>.tmp-<hex>`).
pub const TMP_INFIX: &str = ".tmp-";

// ---------------------------------------------------------------------------
// Random suffixes
// ---------------------------------------------------------------------------

/// `n` lowercase hex characters from the thread RNG.
#[must_use]
pub fn rand_hex(n: usize) -> String {
    let mut rng = rand::rng();
    (0..n)
        .map(|_| char::from_digit(rng.random_range(0..16), 16).unwrap_or('0'))
        .collect()
}

/// Sibling temp path for `path`: `<path>.tmp-<8 hex>`.
#[must_use]
pub fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!("{}{}", TMP_INFIX, rand_hex(8)));
    PathBuf::from(name)
}

/// Whether a file name marks a transient staging artifact.
#[must_use]
pub fn is_tmp_name(name: &str) -> bool {
    name.contains(TMP_INFIX)
}

// ---------------------------------------------------------------------------
// Atomic write
// ---------------------------------------------------------------------------

/// Durably replace `path` with `bytes`.
///
/// Write to a temp sibling, fsync the file, rename over `path`, fsync the
/// parent directory. The rename is the commit point; a crash at any earlier
/// step leaves only a reapable `.tmp-*` sibling.
///
/// # Errors
/// Any I/O failure; the temp sibling is removed best-effort on error.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = temp_sibling(path);
    let write = || -> std::io::Result<()> {
        let mut f = File::create(&tmp)?;
        f.write_all(bytes)?;
        f.sync_all()?;
        drop(f);
        fs::rename(&tmp, path)?;
        sync_parent(path);
        Ok(())
    };
    write().map_err(|e| {
        let _ = fs::remove_file(&tmp);
        JvsError::Io(e)
    })
}

/// Fsync the parent directory of `path` (best-effort; required for the rename
/// to be durable on crash).
pub fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

/// Append one line to `path`, creating it if absent, and flush to disk.
///
/// # Errors
/// Any I/O failure.
pub fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut f = OpenOptions::new().create(true).append(true).open(path)?;
    f.write_all(line.as_bytes())?;
    f.write_all(b"\n")?;
    f.sync_all()?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Path containment
// ---------------------------------------------------------------------------

/// Join `rel` under `root`, rejecting any component that would escape it.
///
/// # Errors
/// `E_PATH_ESCAPE` if `rel` is absolute or contains `..`.
pub fn join_under(root: &Path, rel: &Path) -> Result<PathBuf> {
    if rel.is_absolute() {
        return Err(JvsError::PathEscape {
            path: rel.to_path_buf(),
        });
    }
    for comp in rel.components() {
        match comp {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(JvsError::PathEscape {
                    path: rel.to_path_buf(),
                });
            }
        }
    }
    Ok(root.join(rel))
}

// ---------------------------------------------------------------------------
// Deep copy
// ---------------------------------------------------------------------------

/// Recursive copy of a directory tree, preserving permissions and best-effort
/// modification times. Symlinks and special files are refused — payload trees
/// contain regular files and directories only.
///
/// `dst` must not already exist.
///
/// # Errors
/// Any I/O failure, or `E_NAME_INVALID` on a non-regular entry.
pub fn deep_copy(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;
    copy_entries(src, dst)?;
    Ok(())
}

fn copy_entries(src: &Path, dst: &Path) -> Result<()> {
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        if meta.is_dir() {
            fs::create_dir(&to)?;
            fs::set_permissions(&to, meta.permissions())?;
            copy_entries(&from, &to)?;
        } else if meta.is_file() {
            copy_file_preserving(&from, &to, &meta)?;
        } else {
            return Err(non_regular(&from));
        }
    }
    Ok(())
}

/// Copy one regular file, carrying over permissions and mtime.
///
/// # Errors
/// Any I/O failure.
pub fn copy_file_preserving(from: &Path, to: &Path, meta: &fs::Metadata) -> Result<()> {
    fs::copy(from, to)?;
    fs::set_permissions(to, meta.permissions())?;
    if let Ok(mtime) = meta.modified() {
        if let Ok(f) = File::options().write(true).open(to) {
            let _ = f.set_modified(mtime);
        }
    }
    Ok(())
}

/// The error for symlinks and other non-regular payload entries.
#[must_use]
pub fn non_regular(path: &Path) -> JvsError {
    JvsError::NameInvalid {
        value: path.display().to_string(),
        reason: "symlinks and special files are not supported in payload trees".to_owned(),
    }
}

// ---------------------------------------------------------------------------
// File walks
// ---------------------------------------------------------------------------

/// All regular files under `root` as `/`-separated relative UTF-8 paths,
/// unsorted. Symlinks and special files are refused; so are non-UTF-8 names.
///
/// # Errors
/// Any I/O failure, or `E_NAME_INVALID` on a non-regular or non-UTF-8 entry.
pub fn walk_regular_files(root: &Path) -> Result<Vec<String>> {
    let mut files = Vec::new();
    walk_inner(root, root, &mut files)?;
    Ok(files)
}

fn walk_inner(root: &Path, dir: &Path, files: &mut Vec<String>) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let meta = fs::symlink_metadata(&path)?;
        if meta.is_dir() {
            walk_inner(root, &path, files)?;
        } else if meta.is_file() {
            let rel = path
                .strip_prefix(root)
                .map_err(|_| non_regular(&path))?;
            let Some(rel_str) = rel.to_str() else {
                return Err(JvsError::NameInvalid {
                    value: rel.display().to_string(),
                    reason: "payload paths must be valid UTF-8".to_owned(),
                });
            };
            files.push(rel_str.replace(std::path::MAIN_SEPARATOR, "/"));
        } else {
            return Err(non_regular(&path));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn rand_hex_shape() {
        let s = rand_hex(8);
        assert_eq!(s.len(), 8);
        assert!(s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_uppercase()));
    }

    #[test]
    fn temp_sibling_is_recognizable() {
        let t = temp_sibling(Path::new("/a/b/config.json"));
        let name = t.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("config.json.tmp-"));
        assert!(is_tmp_name(name));
        assert!(!is_tmp_name("config.json"));
    }

    #[test]
    fn atomic_write_replaces_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("value");
        atomic_write(&path, b"one").unwrap();
        atomic_write(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
        // No temp siblings left behind.
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| is_tmp_name(&e.file_name().to_string_lossy()))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn append_line_accumulates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("log");
        append_line(&path, "a").unwrap();
        append_line(&path, "b").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "a\nb\n");
    }

    #[test]
    fn join_under_accepts_nested() {
        let joined = join_under(Path::new("/repo"), Path::new("a/b/c.txt")).unwrap();
        assert_eq!(joined, PathBuf::from("/repo/a/b/c.txt"));
    }

    #[test]
    fn join_under_rejects_escape() {
        let err = join_under(Path::new("/repo"), Path::new("../evil")).unwrap_err();
        assert_eq!(err.code(), "E_PATH_ESCAPE");

        let err = join_under(Path::new("/repo"), Path::new("/abs")).unwrap_err();
        assert_eq!(err.code(), "E_PATH_ESCAPE");

        let err = join_under(Path::new("/repo"), Path::new("a/../../evil")).unwrap_err();
        assert_eq!(err.code(), "E_PATH_ESCAPE");
    }

    #[test]
    fn deep_copy_mirrors_tree() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("a.txt"), "a").unwrap();
        fs::write(src.join("sub/b.txt"), "b").unwrap();

        deep_copy(&src, &dst).unwrap();
        assert_eq!(fs::read_to_string(dst.join("a.txt")).unwrap(), "a");
        assert_eq!(fs::read_to_string(dst.join("sub/b.txt")).unwrap(), "b");
    }

    #[cfg(unix)]
    #[test]
    fn deep_copy_refuses_symlinks() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("real"), "x").unwrap();
        std::os::unix::fs::symlink(src.join("real"), src.join("link")).unwrap();

        let err = deep_copy(&src, &dir.path().join("dst")).unwrap_err();
        assert_eq!(err.code(), "E_NAME_INVALID");
    }

    #[test]
    fn walk_returns_slash_relative_paths() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("x/y")).unwrap();
        fs::write(dir.path().join("top.txt"), "1").unwrap();
        fs::write(dir.path().join("x/y/deep.txt"), "2").unwrap();

        let mut files = walk_regular_files(dir.path()).unwrap();
        files.sort();
        assert_eq!(files, vec!["top.txt".to_owned(), "x/y/deep.txt".to_owned()]);
    }
}
