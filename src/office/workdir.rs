//! # Instance working directories.
//!
//! Every spawned worker owns one directory under the configured working-dir
//! root, named deterministically from its connect URL
//! (`.officevisor_socket_host-127.0.0.1_port-2002` style), holding its user
//! profile. The directory is owned solely by the supervisor that created it.
//!
//! ## Rules
//! - A stale directory from a previous run is deleted and recreated before
//!   spawn; a planned restart preserves it for a faster respawn.
//! - When deletion fails (an antivirus or a dying worker still holds a file
//!   open), the directory is renamed with a `.old.<millis>` suffix so the
//!   next spawn still gets a clean path.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::error::OfficeError;
use crate::transport::ConnectUrl;

const DIR_PREFIX: &str = ".officevisor_";

/// Path of the instance directory for the worker bound to `url`.
pub(crate) fn instance_dir(working_dir: &Path, url: &ConnectUrl) -> PathBuf {
    working_dir.join(format!("{DIR_PREFIX}{}", url.dir_fragment()))
}

/// Prepares a fresh instance directory: removes any stale one, recreates it,
/// and seeds it from the template profile when configured.
pub(crate) async fn prepare(
    working_dir: &Path,
    url: &ConnectUrl,
    template_profile_dir: Option<&Path>,
) -> Result<PathBuf, OfficeError> {
    let dir = instance_dir(working_dir, url);

    if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
        debug!(dir = %dir.display(), "removing stale instance directory");
        remove(&dir).await?;
    }

    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|err| OfficeError::Start {
            message: format!("could not create instance directory {}: {err}", dir.display()),
        })?;

    if let Some(template) = template_profile_dir {
        debug!(template = %template.display(), dir = %dir.display(), "seeding profile from template");
        copy_tree(template, &dir).await.map_err(|err| OfficeError::Start {
            message: format!(
                "could not seed profile from {}: {err}",
                template.display()
            ),
        })?;
    }

    Ok(dir)
}

/// Removes an instance directory, falling back to a timestamped rename when
/// deletion fails.
pub(crate) async fn remove(dir: &Path) -> Result<(), OfficeError> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            let renamed = retired_name(dir);
            warn!(
                dir = %dir.display(),
                renamed = %renamed.display(),
                error = %err,
                "instance directory deletion failed; renaming instead"
            );
            tokio::fs::rename(dir, &renamed)
                .await
                .map_err(|err| OfficeError::Stop {
                    message: format!(
                        "could not delete or rename instance directory {}: {err}",
                        dir.display()
                    ),
                })
        }
    }
}

fn retired_name(dir: &Path) -> PathBuf {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis())
        .unwrap_or(0);
    let mut name = dir.as_os_str().to_os_string();
    name.push(format!(".old.{millis}"));
    PathBuf::from(name)
}

/// Copies `src` into `dst` recursively. Iterative with an explicit queue;
/// symlinks are skipped, matching what a profile template contains.
async fn copy_tree(src: &Path, dst: &Path) -> std::io::Result<()> {
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        tokio::fs::create_dir_all(&to).await?;
        let mut entries = tokio::fs::read_dir(&from).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = to.join(entry.file_name());
            let kind = entry.file_type().await?;
            if kind.is_dir() {
                pending.push((entry.path(), target));
            } else if kind.is_file() {
                tokio::fs::copy(entry.path(), target).await?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_instance_dir_is_deterministic() {
        let root = Path::new("/var/office");
        let url = ConnectUrl::socket(2002);
        assert_eq!(
            instance_dir(root, &url),
            PathBuf::from("/var/office/.officevisor_socket_host-127.0.0.1_port-2002")
        );
        assert_eq!(instance_dir(root, &url), instance_dir(root, &url));
    }

    #[tokio::test]
    async fn test_prepare_creates_empty_directory() {
        let root = tempdir().unwrap();
        let url = ConnectUrl::socket(2002);

        let dir = prepare(root.path(), &url, None).await.unwrap();
        assert!(dir.is_dir());
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_prepare_replaces_stale_directory() {
        let root = tempdir().unwrap();
        let url = ConnectUrl::socket(2002);

        let dir = prepare(root.path(), &url, None).await.unwrap();
        std::fs::write(dir.join("stale.lock"), b"x").unwrap();

        let dir = prepare(root.path(), &url, None).await.unwrap();
        assert!(!dir.join("stale.lock").exists());
    }

    #[tokio::test]
    async fn test_prepare_seeds_template_profile() {
        let root = tempdir().unwrap();
        let template = tempdir().unwrap();
        std::fs::create_dir(template.path().join("user")).unwrap();
        std::fs::write(template.path().join("user/registrymodifications.xcu"), b"<x/>").unwrap();

        let url = ConnectUrl::socket(2002);
        let dir = prepare(root.path(), &url, Some(template.path())).await.unwrap();

        assert!(dir.join("user/registrymodifications.xcu").is_file());
    }

    #[tokio::test]
    async fn test_remove_missing_directory_is_ok() {
        let root = tempdir().unwrap();
        remove(&root.path().join("never-created")).await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_falls_back_to_rename() {
        let root = tempdir().unwrap();
        // A regular file makes remove_dir_all fail the way a held-open
        // profile does, without platform-specific permission games.
        let path = root.path().join("instance");
        std::fs::write(&path, b"still held open").unwrap();

        remove(&path).await.unwrap();

        assert!(!path.exists());
        let retired = std::fs::read_dir(root.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.starts_with("instance.old."))
            .count();
        assert_eq!(retired, 1);
    }

    #[tokio::test]
    async fn test_remove_deletes_directory() {
        let root = tempdir().unwrap();
        let url = ConnectUrl::socket(2002);
        let dir = prepare(root.path(), &url, None).await.unwrap();

        remove(&dir).await.unwrap();
        assert!(!dir.exists());
    }
}
