use foreman_core::{ForemanError, ForemanResult};
use std::io::Write;
use std::path::Path;

/// Replace `path` with `bytes` so readers see either the old or the new
/// content, never a mix.
///
/// The temp file lives in the target's directory so the final rename stays on
/// one filesystem.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> ForemanResult<()> {
    let dir = path.parent().ok_or_else(|| {
        ForemanError::Io(std::io::Error::other(format!(
            "no parent directory for {}",
            path.display()
        )))
    })?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| ForemanError::Io(e.error))?;
    sync_dir(dir)?;
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    std::fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_atomic(&path, b"first").unwrap();
        write_atomic(&path, b"second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
    }

    #[test]
    fn test_write_atomic_leaves_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");
        write_atomic(&path, b"{}").unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
