//! Transfer mechanisms: hard links and symlinks, selected by name.
//!
//! Every mechanism creates missing parent directories, clobbers an existing
//! destination and returns the resolved origin file (useful when the source
//! is itself a link).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{Error, Result};

pub trait FileTransfer: Send + Sync {
    fn transfer(&self, src: &Path, dst: &Path) -> Result<PathBuf>;
}

fn prepare_destination(dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        if !parent.exists() {
            create_dir_all_mode(parent)?;
        }
    }
    if dst.exists() || dst.symlink_metadata().is_ok() {
        std::fs::remove_file(dst)
            .map_err(|e| Error::Internal(anyhow::anyhow!("remove existing target: {e}")))?;
    }
    Ok(())
}

#[cfg(unix)]
fn create_dir_all_mode(dir: &Path) -> Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o777)
        .create(dir)
        .map_err(|e| Error::Internal(anyhow::anyhow!("create target directory: {e}")))
}

#[cfg(not(unix))]
fn create_dir_all_mode(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| Error::Internal(anyhow::anyhow!("create target directory: {e}")))
}

pub struct HardLink;

impl FileTransfer for HardLink {
    fn transfer(&self, src: &Path, dst: &Path) -> Result<PathBuf> {
        prepare_destination(dst)?;
        // Hard links need the real file; resolve a symlinked source first.
        let origin = std::fs::canonicalize(src)
            .map_err(|e| Error::Internal(anyhow::anyhow!("resolve source file: {e}")))?;
        std::fs::hard_link(&origin, dst)
            .map_err(|e| Error::Internal(anyhow::anyhow!("create hard link: {e}")))?;
        Ok(origin)
    }
}

pub struct SymLink;

impl FileTransfer for SymLink {
    fn transfer(&self, src: &Path, dst: &Path) -> Result<PathBuf> {
        prepare_destination(dst)?;
        #[cfg(unix)]
        std::os::unix::fs::symlink(src, dst)
            .map_err(|e| Error::Internal(anyhow::anyhow!("create symlink: {e}")))?;
        #[cfg(not(unix))]
        return Err(Error::Internal(anyhow::anyhow!(
            "symlink transfer is unsupported on this platform"
        )));
        #[cfg(unix)]
        Ok(src.to_path_buf())
    }
}

struct EmptyTransfer;

impl FileTransfer for EmptyTransfer {
    fn transfer(&self, _src: &Path, _dst: &Path) -> Result<PathBuf> {
        Err(Error::bad_request("configure a transfer type first"))
    }
}

/// Mechanism registry; unknown names fall back to the erroring stub.
pub fn file_transfer(name: &str) -> Arc<dyn FileTransfer> {
    match name {
        "hardlink" => Arc::new(HardLink),
        "softlink" | "symlink" => Arc::new(SymLink),
        _ => Arc::new(EmptyTransfer),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardlink_creates_parents_and_clobbers() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.mkv");
        std::fs::write(&src, b"media").unwrap();
        let dst = dir.path().join("tv/Foo/Season 1/Foo S01E01.mkv");

        let origin = file_transfer("hardlink").transfer(&src, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"media");
        assert_eq!(origin, std::fs::canonicalize(&src).unwrap());

        // Existing destination is replaced.
        std::fs::write(&src, b"media2").unwrap();
        std::fs::remove_file(&dst).unwrap();
        std::fs::write(&dst, b"stale").unwrap();
        file_transfer("hardlink").transfer(&src, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"media2");
    }

    #[cfg(unix)]
    #[test]
    fn symlink_points_at_source() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src.mkv");
        std::fs::write(&src, b"media").unwrap();
        let dst = dir.path().join("lib/Foo.mkv");

        let origin = file_transfer("softlink").transfer(&src, &dst).unwrap();
        assert_eq!(origin, src);
        assert_eq!(std::fs::read_link(&dst).unwrap(), src);
    }

    #[test]
    fn unknown_mechanism_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = file_transfer("")
            .transfer(&dir.path().join("a"), &dir.path().join("b"))
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }
}
