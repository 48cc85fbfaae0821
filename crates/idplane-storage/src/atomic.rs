use crate::{Result, StorageError};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const DEFAULT_FILE_MODE: u32 = 0o600;

type RenameFn<'a> = &'a dyn Fn(&Path, &Path) -> io::Result<()>;

/// Write `data` to `path` so concurrent readers observe either the previous
/// contents or the complete new contents.
///
/// The data goes to a sibling temp file that is fsynced, closed, given `mode`
/// and renamed over the target. Platforms that refuse rename-over-existing get
/// exactly one retry after moving the target aside; if that retry fails the
/// previous file is put back. No temp file survives any exit path.
///
/// ```
/// let dir = tempfile::tempdir().unwrap();
/// let path = dir.path().join("tenant.yaml");
/// idplane_storage::atomic_write(&path, b"name: acme\n", 0o600).unwrap();
/// assert_eq!(std::fs::read(&path).unwrap(), b"name: acme\n");
/// ```
pub fn atomic_write(path: &Path, data: &[u8], mode: u32) -> Result<()> {
    atomic_write_with(path, data, mode, &|from, to| fs::rename(from, to))
}

/// Read a file, mapping "not found" to `None`.
pub fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn atomic_write_with(path: &Path, data: &[u8], mode: u32, rename: RenameFn<'_>) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| StorageError::InvalidPath(path.to_path_buf()))?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let mut temp = TempFile::create(&dir, file_name)?;
    temp.write_and_sync(data)?;
    set_mode(&temp.path, mode)?;

    match rename(&temp.path, path) {
        Ok(()) => temp.disarm(),
        Err(err) if refuses_overwrite(&err) && path.exists() => {
            replace_existing(&temp.path, path, file_name, &dir, rename)?;
            temp.disarm();
        }
        Err(source) => {
            return Err(StorageError::Rename {
                path: path.to_path_buf(),
                source,
            });
        }
    }
    sync_dir(&dir);
    Ok(())
}

/// Move the old target aside, retry the rename once, and restore the old
/// target when the retry fails.
fn replace_existing(
    temp: &Path,
    path: &Path,
    file_name: &str,
    dir: &Path,
    rename: RenameFn<'_>,
) -> Result<()> {
    let backup = dir.join(format!(".{file_name}.bak-{:016x}", rand::random::<u64>()));
    fs::rename(path, &backup)?;
    match rename(temp, path) {
        Ok(()) => {
            let _ = fs::remove_file(&backup);
            Ok(())
        }
        Err(source) => {
            if let Err(restore_err) = fs::rename(&backup, path) {
                tracing::error!(
                    path = %path.display(),
                    error = %restore_err,
                    "failed to restore previous file after rename retry"
                );
            }
            Err(StorageError::Rename {
                path: path.to_path_buf(),
                source,
            })
        }
    }
}

fn refuses_overwrite(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::PermissionDenied | io::ErrorKind::AlreadyExists
    )
}

struct TempFile {
    path: PathBuf,
    file: Option<File>,
    armed: bool,
}

impl TempFile {
    fn create(dir: &Path, file_name: &str) -> Result<Self> {
        let path = dir.join(format!(".{file_name}.tmp-{:016x}", rand::random::<u64>()));
        let file = OpenOptions::new().write(true).create_new(true).open(&path)?;
        Ok(Self {
            path,
            file: Some(file),
            armed: true,
        })
    }

    fn write_and_sync(&mut self, data: &[u8]) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.write_all(data)?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        self.file.take();
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn writes_new_file_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tenants/acme/tenant.yaml");
        atomic_write(&path, b"slug: acme\n", DEFAULT_FILE_MODE).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"slug: acme\n");
        assert_eq!(entries(path.parent().unwrap()), vec!["tenant.yaml"]);
    }

    #[test]
    fn overwrites_existing_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clients.yaml");
        atomic_write(&path, b"old", DEFAULT_FILE_MODE).unwrap();
        atomic_write(&path, b"new contents", DEFAULT_FILE_MODE).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new contents");
        assert_eq!(entries(dir.path()), vec!["clients.yaml"]);
    }

    #[cfg(unix)]
    #[test]
    fn applies_requested_mode() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("active.json");
        atomic_write(&path, b"{}", 0o640).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);
    }

    #[test]
    fn retries_once_when_rename_over_existing_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scopes.yaml");
        fs::write(&path, b"old").unwrap();

        let calls = Cell::new(0);
        let rename = |from: &Path, to: &Path| {
            calls.set(calls.get() + 1);
            if to.exists() {
                return Err(io::Error::from(io::ErrorKind::PermissionDenied));
            }
            fs::rename(from, to)
        };
        atomic_write_with(&path, b"new", DEFAULT_FILE_MODE, &rename).unwrap();
        assert_eq!(calls.get(), 2);
        assert_eq!(fs::read(&path).unwrap(), b"new");
        assert_eq!(entries(dir.path()), vec!["scopes.yaml"]);
    }

    #[test]
    fn failed_retry_preserves_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("claims.yaml");
        fs::write(&path, b"previous").unwrap();

        let rename =
            |_: &Path, _: &Path| -> io::Result<()> { Err(io::Error::from(io::ErrorKind::PermissionDenied)) };
        let err = atomic_write_with(&path, b"next", DEFAULT_FILE_MODE, &rename).unwrap_err();
        assert!(matches!(err, StorageError::Rename { .. }));
        assert_eq!(fs::read(&path).unwrap(), b"previous");
        assert_eq!(entries(dir.path()), vec!["claims.yaml"]);
    }

    #[test]
    fn other_rename_errors_leave_no_temp_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("admins.yaml");
        let rename =
            |_: &Path, _: &Path| -> io::Result<()> { Err(io::Error::other("disk on fire")) };
        assert!(atomic_write_with(&path, b"x", DEFAULT_FILE_MODE, &rename).is_err());
        assert!(entries(dir.path()).is_empty());
    }

    #[test]
    fn read_optional_maps_missing_to_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_optional(&dir.path().join("missing")).unwrap().is_none());
        let path = dir.path().join("present");
        fs::write(&path, b"x").unwrap();
        assert_eq!(read_optional(&path).unwrap(), Some(b"x".to_vec()));
    }
}
