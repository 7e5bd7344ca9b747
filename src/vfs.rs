//! Filesystem collaborator: the narrow seam the engine reads and writes
//! through. One concrete implementation (`LocalFs`); remote stores implement
//! the same trait out of tree.

use color_eyre::eyre::Report;
use color_eyre::Result;
use std::fs;
use std::io::{Read, Seek, Write};
use std::path::Path;

use crate::error::MergeError;

/// Readers handed out by `open_read` must support seeking (parquet footers
/// live at the end of the file).
pub trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

impl std::fmt::Debug for dyn ReadSeek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("<dyn ReadSeek>")
    }
}

/// Narrow filesystem interface consumed by the engine.
///
/// `rename` may be realized as copy+delete on stores without native rename;
/// implementations must not delete the source until the copy succeeded.
pub trait Vfs: Send + Sync {
    /// Recursively list files under `root`, lexicographically sorted.
    fn list(&self, root: &str) -> Result<Vec<String>>;
    fn open_read(&self, path: &str) -> Result<Box<dyn ReadSeek>>;
    /// Open for writing, creating parent directories on demand.
    fn open_write(&self, path: &str) -> Result<Box<dyn Write + Send>>;
    fn rename(&self, src: &str, dst: &str) -> Result<()>;
    fn remove(&self, path: &str) -> Result<()>;
    fn remove_tree(&self, path: &str) -> Result<()>;
    /// Byte size of a file, `None` when the store cannot answer cheaply.
    fn size(&self, path: &str) -> Result<Option<u64>>;
}

fn fs_err(op: &'static str, path: &str, err: std::io::Error) -> Report {
    Report::new(MergeError::Filesystem {
        op,
        path: path.to_string(),
        message: err.to_string(),
    })
}

/// Local disk implementation.
#[derive(Debug, Clone, Default)]
pub struct LocalFs;

impl LocalFs {
    fn walk(dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                Self::walk(&path, out)?;
            } else {
                out.push(path.to_string_lossy().into_owned());
            }
        }
        Ok(())
    }
}

impl Vfs for LocalFs {
    fn list(&self, root: &str) -> Result<Vec<String>> {
        let dir = Path::new(root);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        Self::walk(dir, &mut out).map_err(|e| fs_err("list", root, e))?;
        out.sort();
        Ok(out)
    }

    fn open_read(&self, path: &str) -> Result<Box<dyn ReadSeek>> {
        let file = fs::File::open(path).map_err(|e| fs_err("read", path, e))?;
        Ok(Box::new(file))
    }

    fn open_write(&self, path: &str) -> Result<Box<dyn Write + Send>> {
        if let Some(parent) = Path::new(path).parent() {
            fs::create_dir_all(parent).map_err(|e| fs_err("write", path, e))?;
        }
        let file = fs::File::create(path).map_err(|e| fs_err("write", path, e))?;
        Ok(Box::new(std::io::BufWriter::new(file)))
    }

    fn rename(&self, src: &str, dst: &str) -> Result<()> {
        if let Some(parent) = Path::new(dst).parent() {
            fs::create_dir_all(parent).map_err(|e| fs_err("rename", dst, e))?;
        }
        match fs::rename(src, dst) {
            Ok(()) => Ok(()),
            // Cross-device rename: copy, then delete only after the copy
            // succeeded so the destination always has a replacement first.
            Err(_) => {
                fs::copy(src, dst).map_err(|e| fs_err("rename", dst, e))?;
                fs::remove_file(src).map_err(|e| fs_err("rename", src, e))?;
                Ok(())
            }
        }
    }

    fn remove(&self, path: &str) -> Result<()> {
        fs::remove_file(path).map_err(|e| fs_err("remove", path, e))
    }

    fn remove_tree(&self, path: &str) -> Result<()> {
        if Path::new(path).exists() {
            fs::remove_dir_all(path).map_err(|e| fs_err("remove_tree", path, e))?;
        }
        Ok(())
    }

    fn size(&self, path: &str) -> Result<Option<u64>> {
        Ok(fs::metadata(path).ok().map(|m| m.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::merge_error_kind;

    #[test]
    fn list_missing_root_is_empty() {
        let fs = LocalFs;
        let listed = fs.list("/definitely/not/a/real/dir").unwrap();
        assert!(listed.is_empty());
    }

    #[test]
    fn list_is_recursive_and_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("b/inner")).unwrap();
        std::fs::write(root.join("b/inner/two.txt"), b"2").unwrap();
        std::fs::write(root.join("a.txt"), b"1").unwrap();
        let fs = LocalFs;
        let listed = fs.list(root.to_str().unwrap()).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed[0].ends_with("a.txt"));
        assert!(listed[1].ends_with("two.txt"));
    }

    #[test]
    fn open_write_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x/y/z.bin");
        let fs = LocalFs;
        let mut w = fs.open_write(path.to_str().unwrap()).unwrap();
        w.write_all(b"abc").unwrap();
        drop(w);
        assert_eq!(std::fs::read(&path).unwrap(), b"abc");
    }

    #[test]
    fn rename_replaces_destination() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.bin");
        let dst = dir.path().join("dst.bin");
        std::fs::write(&src, b"new").unwrap();
        std::fs::write(&dst, b"old").unwrap();
        let fs = LocalFs;
        fs.rename(src.to_str().unwrap(), dst.to_str().unwrap())
            .unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"new");
        assert!(!src.exists());
    }

    #[test]
    fn read_error_is_filesystem_kind() {
        let fs = LocalFs;
        let err = fs.open_read("/no/such/file.parquet").unwrap_err();
        assert!(matches!(
            merge_error_kind(&err),
            Some(MergeError::Filesystem { op: "read", .. })
        ));
    }
}
