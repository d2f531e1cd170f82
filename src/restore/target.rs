// instancemanager/src/restore/target.rs
use chrono::Local;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::errors::{AppError, Result, ValidationError};
use crate::utils::is_empty_directory;

/// Makes sure `target` can receive a restore.
///
/// A missing or empty directory is accepted as is. A directory holding a
/// PostgreSQL instance is refused. Any other leftover content is moved aside
/// to `<target>_<timestamp>` and the location is returned.
pub fn prepare_target_directory(target: &Path) -> Result<Option<PathBuf>> {
    let metadata = match fs::symlink_metadata(target) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(ValidationError::Inaccessible {
                path: target.to_path_buf(),
                source,
            }
            .into());
        }
    };

    if !metadata.is_dir() {
        return Err(ValidationError::TargetNotADirectory(target.to_path_buf()).into());
    }

    let empty = is_empty_directory(target).map_err(|source| ValidationError::Inaccessible {
        path: target.to_path_buf(),
        source,
    })?;
    if empty {
        return Ok(None);
    }

    if target.join("PG_VERSION").exists() {
        return Err(ValidationError::TargetContainsInstance(target.to_path_buf()).into());
    }

    let timestamp = Local::now().format("%Y-%m-%d_%H_%M_%S").to_string();
    let mut aside = target.as_os_str().to_os_string();
    aside.push(format!("_{}", timestamp));
    let aside = PathBuf::from(aside);

    warn!(
        target = %target.display(),
        moved_to = %aside.display(),
        "Restore target is not empty, moving its content aside"
    );
    fs::rename(target, &aside).map_err(|e| {
        AppError::io(format!("moving {} aside", target.display()), e)
    })?;
    Ok(Some(aside))
}

fn copy_tree(source: &Path, destination: &Path) -> io::Result<()> {
    let metadata = fs::symlink_metadata(source)?;
    if metadata.is_dir() {
        fs::create_dir_all(destination)?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            copy_tree(&entry.path(), &destination.join(entry.file_name()))?;
        }
    } else {
        fs::copy(source, destination)?;
    }
    Ok(())
}

/// Moves `source` to `destination`, copying when they live on different
/// filesystems.
fn move_entry(source: &Path, destination: &Path) -> io::Result<()> {
    if fs::rename(source, destination).is_ok() {
        return Ok(());
    }
    copy_tree(source, destination)?;
    if fs::symlink_metadata(source)?.is_dir() {
        fs::remove_dir_all(source)
    } else {
        fs::remove_file(source)
    }
}

/// Relocates the restored `pg_wal` into `wal_directory` and leaves a
/// symlink behind.
pub fn link_wal_directory(data_directory: &Path, wal_directory: &Path) -> io::Result<()> {
    let pg_wal = data_directory.join("pg_wal");
    fs::create_dir_all(wal_directory)?;

    match fs::symlink_metadata(&pg_wal) {
        Ok(metadata) if metadata.file_type().is_symlink() => {
            if fs::read_link(&pg_wal)? == wal_directory {
                return Ok(());
            }
            fs::remove_file(&pg_wal)?;
        }
        Ok(metadata) if metadata.is_dir() => {
            for entry in fs::read_dir(&pg_wal)? {
                let entry = entry?;
                move_entry(&entry.path(), &wal_directory.join(entry.file_name()))?;
            }
            fs::remove_dir(&pg_wal)?;
        }
        Ok(_) => fs::remove_file(&pg_wal)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    info!(
        pg_wal = %pg_wal.display(),
        wal_directory = %wal_directory.display(),
        "Linking WAL directory"
    );
    symlink_dir(wal_directory, &pg_wal)
}

#[cfg(unix)]
fn symlink_dir(original: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(not(unix))]
fn symlink_dir(_original: &Path, _link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "a separate WAL directory needs symlink support",
    ))
}
