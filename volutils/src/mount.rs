use std::{fs, path::Path, process::Command};

use anyhow::{bail, Context, Error};
use log::warn;

use crate::exe::RunAndCheck;

/// Filesystem types helper partitions are expected to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountFsType {
    Auto,
    Hfsplus,
    Vfat,
}

impl MountFsType {
    pub fn name(&self) -> &'static str {
        match self {
            MountFsType::Auto => "auto",
            MountFsType::Hfsplus => "hfsplus",
            MountFsType::Vfat => "vfat",
        }
    }
}

/// Mounts a block device onto `mount_dir`.
pub fn mount(
    device: impl AsRef<Path>,
    mount_dir: impl AsRef<Path>,
    fstype: MountFsType,
    options: &[String],
) -> Result<(), Error> {
    let mut command = Command::new("mount");
    if !options.is_empty() {
        command.arg("-o").arg(options.join(","));
    }
    command
        .arg("-t")
        .arg(fstype.name())
        .arg(device.as_ref())
        .arg(mount_dir.as_ref())
        .run_and_check()
        .context(format!(
            "Failed to mount {} at {}",
            device.as_ref().display(),
            mount_dir.as_ref().display(),
        ))
}

/// Unmounts `mount_dir`.
pub fn umount(mount_dir: impl AsRef<Path>) -> Result<(), Error> {
    Command::new("umount")
        .arg(mount_dir.as_ref())
        .run_and_check()
        .context(format!(
            "Failed to unmount {}",
            mount_dir.as_ref().display()
        ))
}

/// Unmounts the held directory when dropped, so an early return from a
/// helper update cannot leave the helper mounted.
pub struct MountGuard<'a> {
    pub mount_dir: &'a Path,
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = umount(self.mount_dir) {
            warn!(
                "Failed to unmount {} on teardown: {}",
                self.mount_dir.display(),
                e
            );
        }
    }
}

/// Ensures `target` exists, is a directory, and is empty.
pub fn ensure_mount_directory(target: &Path) -> Result<(), Error> {
    if target.exists() {
        if !target.is_dir() {
            bail!("Mount path '{}' is not a directory", target.display());
        }
        if let Ok(entries) = fs::read_dir(target) {
            if entries.count() > 0 {
                bail!("Mount path '{}' is not empty", target.display());
            }
        }
    } else {
        fs::create_dir_all(target).context(format!(
            "Failed to create mount path '{}'",
            target.display()
        ))?;
    }
    Ok(())
}

/// Returns the mount options currently in effect for `mount_dir`, or None
/// if nothing is mounted there.
pub fn current_options(mount_dir: &Path) -> Result<Option<String>, Error> {
    let mounts = fs::read_to_string("/proc/self/mounts").context("Failed to read mount table")?;
    for line in mounts.lines() {
        let mut fields = line.split_whitespace();
        let (Some(_dev), Some(mnt), Some(_fstype), Some(opts)) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if Path::new(mnt) == mount_dir {
            return Ok(Some(opts.to_string()));
        }
    }
    Ok(None)
}

/// Whether the mount's options mask file ownership behind a fixed uid/gid
/// (the common default for removable and FAT-class volumes).
pub fn ownership_ignored(options: &str) -> bool {
    options.split(',').any(|opt| {
        let masked = |prefix: &str| {
            opt.strip_prefix(prefix)
                .is_some_and(|v| v.parse::<u32>().map_or(true, |id| id != 0))
        };
        masked("uid=") || masked("gid=")
    })
}

/// Remounts `mount_dir` so file ownership is honored (uid/gid overrides
/// forced to root). Returns the prior option string for a later
/// `restore_options` call, or None when ownership was already in effect.
pub fn enable_ownership(mount_dir: &Path) -> Result<Option<String>, Error> {
    let Some(options) = current_options(mount_dir)? else {
        bail!("'{}' is not a mount point", mount_dir.display());
    };
    if !ownership_ignored(&options) {
        return Ok(None);
    }

    let forced: Vec<String> = options
        .split(',')
        .map(|opt| {
            if opt.starts_with("uid=") {
                "uid=0".to_string()
            } else if opt.starts_with("gid=") {
                "gid=0".to_string()
            } else {
                opt.to_string()
            }
        })
        .collect();
    remount_with_options(mount_dir, &forced.join(","))?;
    Ok(Some(options))
}

/// Reverts a prior `enable_ownership`.
pub fn restore_options(mount_dir: &Path, saved: &str) -> Result<(), Error> {
    remount_with_options(mount_dir, saved)
}

fn remount_with_options(mount_dir: &Path, options: &str) -> Result<(), Error> {
    Command::new("mount")
        .arg("-o")
        .arg(format!("remount,{}", options))
        .arg(mount_dir)
        .run_and_check()
        .context(format!(
            "Failed to remount {} with options {}",
            mount_dir.display(),
            options
        ))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::File;

    use tempfile::TempDir;

    #[test]
    fn test_ensure_mount_directory() {
        let tmp = TempDir::new().unwrap();

        // Existing empty directory passes.
        ensure_mount_directory(tmp.path()).unwrap();

        // Missing directory is created.
        let fresh = tmp.path().join("fresh");
        ensure_mount_directory(&fresh).unwrap();
        assert!(fresh.is_dir());

        // Non-empty directory is refused.
        assert!(ensure_mount_directory(tmp.path())
            .unwrap_err()
            .to_string()
            .contains("not empty"));

        // A file is refused.
        let file = tmp.path().join("file");
        File::create(&file).unwrap();
        assert!(ensure_mount_directory(&file)
            .unwrap_err()
            .to_string()
            .contains("not a directory"));
    }

    #[test]
    fn test_ownership_ignored() {
        assert!(ownership_ignored("rw,uid=501,gid=20"));
        assert!(ownership_ignored("rw,gid=1000"));
        assert!(!ownership_ignored("rw,uid=0,gid=0"));
        assert!(!ownership_ignored("rw,relatime,errors=remount-ro"));
    }

    #[test]
    fn test_current_options_for_root() {
        // "/" is always mounted; its options must be readable.
        let opts = current_options(Path::new("/")).unwrap();
        assert!(opts.is_some());
    }

    #[test]
    fn test_current_options_missing_mount() {
        let tmp = TempDir::new().unwrap();
        assert!(current_options(tmp.path()).unwrap().is_none());
    }
}
