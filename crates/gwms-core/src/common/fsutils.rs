use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tempfile::NamedTempFile;

/// Permissions of every file holding secret material.
pub const PRIVATE_FILE_MODE: u32 = 0o600;

/// Writes `data` to `path` through a temporary file in the same directory followed by a
/// rename, so that readers observe either the previous or the new content, never a mix.
///
/// With `backup`, the previous content (if any) is copied to `<path>.old` before the rename.
pub fn atomic_write(path: &Path, data: &[u8], mode: u32, backup: bool) -> crate::Result<()> {
    let directory = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(directory)?;
    file.as_file()
        .set_permissions(fs::Permissions::from_mode(mode))?;
    file.write_all(data)?;
    file.as_file().sync_all()?;

    if backup {
        match fs::copy(path, backup_path(path)) {
            Ok(_) => {}
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                log::debug!(
                    "Nothing to back up at {}, probably the first write",
                    path.display()
                );
            }
            Err(error) => return Err(error.into()),
        }
    }
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".old");
    PathBuf::from(name)
}

pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> crate::Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    atomic_write(path, &data, PRIVATE_FILE_MODE, false)
}

/// Loads a JSON state file. A missing file yields the default value.
pub fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> crate::Result<T> {
    match fs::read(path) {
        Ok(data) => Ok(serde_json::from_slice(&data)?),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(error) => Err(error.into()),
    }
}

/// Time since the last modification of `path`, `None` if the file does not exist.
pub fn file_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(
        SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_sets_private_mode() {
        let dir = TempDir::with_prefix("gwms").unwrap();
        let path = dir.path().join("secret");
        atomic_write(&path, b"abc", PRIVATE_FILE_MODE, false).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(fs::read(&path).unwrap(), b"abc");
    }

    #[test]
    fn atomic_write_keeps_backup() {
        let dir = TempDir::with_prefix("gwms").unwrap();
        let path = dir.path().join("secret");
        atomic_write(&path, b"first", PRIVATE_FILE_MODE, true).unwrap();
        assert!(!backup_path(&path).exists());
        atomic_write(&path, b"second", PRIVATE_FILE_MODE, true).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"second");
        assert_eq!(fs::read(backup_path(&path)).unwrap(), b"first");
    }

    #[test]
    fn readers_never_see_partial_content() {
        let dir = TempDir::with_prefix("gwms").unwrap();
        let path = dir.path().join("cred");
        let old = vec![b'a'; 64 * 1024];
        let new = vec![b'b'; 64 * 1024];
        atomic_write(&path, &old, PRIVATE_FILE_MODE, false).unwrap();

        let reader_path = path.clone();
        let (o, n) = (old.clone(), new.clone());
        let reader = std::thread::spawn(move || {
            for _ in 0..200 {
                let content = fs::read(&reader_path).unwrap();
                assert!(content == o || content == n);
            }
        });
        for i in 0..50 {
            let data = if i % 2 == 0 { &new } else { &old };
            atomic_write(&path, data, PRIVATE_FILE_MODE, false).unwrap();
        }
        reader.join().unwrap();
    }

    #[test]
    fn missing_json_gives_default() {
        let dir = TempDir::with_prefix("gwms").unwrap();
        let value: BTreeMap<String, u32> =
            read_json_or_default(&dir.path().join("missing.json")).unwrap();
        assert!(value.is_empty());
    }
}
