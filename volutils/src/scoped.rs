//! Scope-confined filesystem primitives.
//!
//! Every mutating operation takes a [`Scope`], a file descriptor on the
//! volume being modified that serves purely as a device-identity witness.
//! Before anything is touched, the target's parent directory is opened and
//! its `st_dev` compared against the scope's; a mismatch fails the
//! operation. The mutation itself is then performed dirfd-relative to the
//! opened parent using only the target's base name, so a symlink or mount
//! swapped in anywhere along the absolute path cannot redirect the
//! operation off the volume.

use std::{
    ffi::{CStr, CString},
    fs::File,
    io::{Read, Write},
    os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd},
    os::unix::ffi::OsStrExt,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use nix::{
    errno::Errno,
    fcntl::{open, openat, renameat, OFlag},
    sys::stat::{fchmod, Mode},
    unistd::{unlinkat, UnlinkatFlags},
};

/// Fixed copy buffer, one maximum-size filesystem block.
pub const COPY_BUF_BYTES: usize = 1 << 20;

#[derive(Debug, thiserror::Error)]
pub enum ScopedError {
    /// The target's parent directory is not on the scope's device.
    /// Deliberately surfaced with permission-denied flavor.
    #[error("'{path}' is outside the scoped volume: permission denied")]
    CrossDevice { path: PathBuf },

    #[error("'{path}' has no usable parent directory")]
    NoParent { path: PathBuf },

    #[error("'{path}' exists and is not a directory")]
    NotADirectory { path: PathBuf },

    #[error("{op} '{path}': {errno}")]
    Syscall {
        op: &'static str,
        path: PathBuf,
        #[source]
        errno: Errno,
    },

    #[error("{op} '{path}': {source}")]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ScopedError>;

impl ScopedError {
    pub fn errno(&self) -> Option<Errno> {
        match self {
            ScopedError::Syscall { errno, .. } => Some(*errno),
            _ => None,
        }
    }
}

fn syscall<T>(op: &'static str, path: &Path, res: nix::Result<T>) -> Result<T> {
    res.map_err(|errno| ScopedError::Syscall {
        op,
        path: path.to_path_buf(),
        errno,
    })
}

// Thin wrappers where a stable libc call beats second-guessing binding
// signatures; shapes follow the rest of the module.

fn fstat_fd(fd: RawFd) -> nix::Result<libc::stat> {
    let mut st = std::mem::MaybeUninit::uninit();
    let ret = unsafe { libc::fstat(fd, st.as_mut_ptr()) };
    Errno::result(ret).map(|_| unsafe { st.assume_init() })
}

fn fstatat_nofollow(dirfd: RawFd, name: &CStr) -> nix::Result<libc::stat> {
    let mut st = std::mem::MaybeUninit::uninit();
    let ret =
        unsafe { libc::fstatat(dirfd, name.as_ptr(), st.as_mut_ptr(), libc::AT_SYMLINK_NOFOLLOW) };
    Errno::result(ret).map(|_| unsafe { st.assume_init() })
}

fn mkdirat_raw(dirfd: RawFd, name: &CStr, mode: libc::mode_t) -> nix::Result<()> {
    let ret = unsafe { libc::mkdirat(dirfd, name.as_ptr(), mode) };
    Errno::result(ret).map(drop)
}

/// A device-identity witness for one volume. The descriptor is never used
/// for I/O; it exists so `st_dev` comparisons pin every mutation to the
/// filesystem it was opened on, and so the volume cannot be unmounted and
/// swapped unnoticed while held.
#[derive(Debug)]
pub struct Scope {
    fd: OwnedFd,
}

impl Scope {
    /// Opens a witness on the volume containing `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let raw = syscall(
            "open scope",
            path,
            open(path, OFlag::O_RDONLY | OFlag::O_CLOEXEC, Mode::empty()),
        )?;
        Ok(Scope {
            fd: unsafe { OwnedFd::from_raw_fd(raw) },
        })
    }

    /// Adopts an already-open descriptor as the witness.
    pub fn from_fd(fd: OwnedFd) -> Self {
        Scope { fd }
    }

    pub fn stat(&self) -> Result<libc::stat> {
        syscall(
            "stat scope",
            Path::new("<scope>"),
            fstat_fd(self.fd.as_raw_fd()),
        )
    }

    pub fn dev(&self) -> Result<u64> {
        Ok(self.stat()?.st_dev as u64)
    }
}

impl AsRawFd for Scope {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

struct ScopedParent {
    fd: OwnedFd,
    base: CString,
}

/// The common prologue: open the parent, prove it lives on the scope's
/// device, and reduce the target to its base name.
fn open_parent(scope: &Scope, target: &Path) -> Result<ScopedParent> {
    let parent = target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| ScopedError::NoParent {
            path: target.to_path_buf(),
        })?;
    let name = target.file_name().ok_or_else(|| ScopedError::NoParent {
        path: target.to_path_buf(),
    })?;

    let raw = syscall(
        "open parent of",
        target,
        open(
            parent,
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        ),
    )?;
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };

    let parent_stat = syscall("stat parent of", target, fstat_fd(fd.as_raw_fd()))?;
    let scope_stat = scope.stat()?;
    if parent_stat.st_dev != scope_stat.st_dev {
        return Err(ScopedError::CrossDevice {
            path: target.to_path_buf(),
        });
    }

    let base = CString::new(name.as_bytes()).map_err(|_| ScopedError::NoParent {
        path: target.to_path_buf(),
    })?;
    Ok(ScopedParent { fd, base })
}

/// Opens `path` within the scope. `O_EXCL` is forced whenever `O_CREAT`
/// is requested, and symlinks at the final component are never followed.
pub fn sopen(scope: &Scope, path: &Path, oflag: OFlag, mode: Mode) -> Result<File> {
    let mut flags = oflag | OFlag::O_CLOEXEC | OFlag::O_NOFOLLOW;
    if flags.contains(OFlag::O_CREAT) {
        flags |= OFlag::O_EXCL;
    }
    let parent = open_parent(scope, path)?;
    let raw = syscall(
        "open",
        path,
        openat(
            Some(parent.fd.as_raw_fd()),
            parent.base.as_c_str(),
            flags,
            mode,
        ),
    )?;
    Ok(unsafe { File::from_raw_fd(raw) })
}

/// Creates the directory `path` within the scope, with exactly `mode`
/// (the process umask does not water it down).
pub fn smkdir(scope: &Scope, path: &Path, mode: Mode) -> Result<()> {
    let parent = open_parent(scope, path)?;
    syscall(
        "mkdir",
        path,
        mkdirat_raw(parent.fd.as_raw_fd(), parent.base.as_c_str(), mode.bits()),
    )?;
    let raw = syscall(
        "open",
        path,
        openat(
            Some(parent.fd.as_raw_fd()),
            parent.base.as_c_str(),
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
            Mode::empty(),
        ),
    )?;
    let dir = unsafe { OwnedFd::from_raw_fd(raw) };
    syscall("chmod", path, fchmod(dir.as_raw_fd(), mode))
}

/// Removes the empty directory `path` within the scope.
pub fn srmdir(scope: &Scope, path: &Path) -> Result<()> {
    let parent = open_parent(scope, path)?;
    syscall(
        "rmdir",
        path,
        unlinkat(
            Some(parent.fd.as_raw_fd()),
            parent.base.as_c_str(),
            UnlinkatFlags::RemoveDir,
        ),
    )
}

/// Unlinks the file `path` within the scope.
pub fn sunlink(scope: &Scope, path: &Path) -> Result<()> {
    let parent = open_parent(scope, path)?;
    syscall(
        "unlink",
        path,
        unlinkat(
            Some(parent.fd.as_raw_fd()),
            parent.base.as_c_str(),
            UnlinkatFlags::NoRemoveDir,
        ),
    )
}

/// Unlinks `path` if it exists; reports whether anything was removed.
pub fn sunlink_if_present(scope: &Scope, path: &Path) -> Result<bool> {
    match sunlink(scope, path) {
        Ok(()) => Ok(true),
        Err(e) if e.errno() == Some(Errno::ENOENT) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Renames within the scope. Both parents must live on the scope's device.
pub fn srename(scope: &Scope, from: &Path, to: &Path) -> Result<()> {
    let from_parent = open_parent(scope, from)?;
    let to_parent = open_parent(scope, to)?;
    syscall(
        "rename",
        from,
        renameat(
            Some(from_parent.fd.as_raw_fd()),
            from_parent.base.as_c_str(),
            Some(to_parent.fd.as_raw_fd()),
            to_parent.base.as_c_str(),
        ),
    )
}

/// Renames if the source exists; reports whether a rename happened.
pub fn srename_if_present(scope: &Scope, from: &Path, to: &Path) -> Result<bool> {
    match srename(scope, from, to) {
        Ok(()) => Ok(true),
        Err(e) if e.errno() == Some(Errno::ENOENT) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Creates `path` and any missing ancestors within the scope, all with
/// `mode`. An existing non-directory component fails.
pub fn sdeepmkdir(scope: &Scope, path: &Path, mode: Mode) -> Result<()> {
    match smkdir(scope, path, mode) {
        Ok(()) => Ok(()),
        Err(e) if e.errno() == Some(Errno::EEXIST) => {
            let meta = std::fs::symlink_metadata(path).map_err(|source| ScopedError::Io {
                op: "stat",
                path: path.to_path_buf(),
                source,
            })?;
            if !meta.is_dir() {
                return Err(ScopedError::NotADirectory {
                    path: path.to_path_buf(),
                });
            }
            if meta.dev() != scope.dev()? {
                return Err(ScopedError::CrossDevice {
                    path: path.to_path_buf(),
                });
            }
            Ok(())
        }
        // Missing ancestry; build it and try once more.
        Err(e) if e.errno() == Some(Errno::ENOENT) => {
            let parent = path.parent().ok_or_else(|| ScopedError::NoParent {
                path: path.to_path_buf(),
            })?;
            sdeepmkdir(scope, parent, mode)?;
            smkdir(scope, path, mode)
        }
        Err(e) if e.errno() == Some(Errno::ENOTDIR) => Err(ScopedError::NotADirectory {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(e),
    }
}

struct DirStream(*mut libc::DIR);

impl Drop for DirStream {
    fn drop(&mut self) {
        unsafe { libc::closedir(self.0) };
    }
}

fn dir_entry_names(dirfd: RawFd, path: &Path) -> Result<(DirStream, Vec<CString>)> {
    let dirp = unsafe { libc::fdopendir(dirfd) };
    if dirp.is_null() {
        let errno = Errno::last();
        unsafe { libc::close(dirfd) };
        return Err(ScopedError::Syscall {
            op: "read directory",
            path: path.to_path_buf(),
            errno,
        });
    }
    let stream = DirStream(dirp);

    let mut names = Vec::new();
    loop {
        unsafe { *libc::__errno_location() = 0 };
        let entry = unsafe { libc::readdir(dirp) };
        if entry.is_null() {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error().unwrap_or(0) != 0 {
                return Err(ScopedError::Io {
                    op: "read directory",
                    path: path.to_path_buf(),
                    source: err,
                });
            }
            break;
        }
        let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
        if name.to_bytes() == b"." || name.to_bytes() == b".." {
            continue;
        }
        names.push(name.to_owned());
    }
    Ok((stream, names))
}

fn remove_tree_contents(dirfd: OwnedFd, scope_dev: u64, path: &Path) -> Result<()> {
    let raw = dirfd.into_raw_fd();
    // The DIR stream owns `raw` from here; it stays open while entries
    // are removed through it and is closed when the stream drops.
    let (_stream, names) = dir_entry_names(raw, path)?;

    for name in names {
        let entry_path = path.join(std::ffi::OsStr::from_bytes(name.to_bytes()));
        let st = syscall("stat", &entry_path, fstatat_nofollow(raw, name.as_c_str()))?;

        if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
            if st.st_dev as u64 != scope_dev {
                return Err(ScopedError::CrossDevice { path: entry_path });
            }
            let child_raw = syscall(
                "open",
                &entry_path,
                openat(
                    Some(raw),
                    name.as_c_str(),
                    OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
                    Mode::empty(),
                ),
            )?;
            let child = unsafe { OwnedFd::from_raw_fd(child_raw) };
            remove_tree_contents(child, scope_dev, &entry_path)?;
            syscall(
                "rmdir",
                &entry_path,
                unlinkat(Some(raw), name.as_c_str(), UnlinkatFlags::RemoveDir),
            )?;
        } else {
            // Symlinks are unlinked, never followed.
            syscall(
                "unlink",
                &entry_path,
                unlinkat(Some(raw), name.as_c_str(), UnlinkatFlags::NoRemoveDir),
            )?;
        }
    }
    Ok(())
}

/// Removes `path` and everything beneath it within the scope. The walk is
/// fd-relative throughout, never follows symlinks, and refuses to cross
/// onto another device.
pub fn sdeepunlink(scope: &Scope, path: &Path) -> Result<()> {
    let parent = open_parent(scope, path)?;
    let scope_dev = scope.dev()?;

    match openat(
        Some(parent.fd.as_raw_fd()),
        parent.base.as_c_str(),
        OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_NOFOLLOW | OFlag::O_CLOEXEC,
        Mode::empty(),
    ) {
        Ok(raw) => {
            let dirfd = unsafe { OwnedFd::from_raw_fd(raw) };
            let st = syscall("stat", path, fstat_fd(dirfd.as_raw_fd()))?;
            if st.st_dev as u64 != scope_dev {
                return Err(ScopedError::CrossDevice {
                    path: path.to_path_buf(),
                });
            }
            remove_tree_contents(dirfd, scope_dev, path)?;
            syscall(
                "rmdir",
                path,
                unlinkat(
                    Some(parent.fd.as_raw_fd()),
                    parent.base.as_c_str(),
                    UnlinkatFlags::RemoveDir,
                ),
            )
        }
        // Not a directory (or a symlink): plain unlink.
        Err(Errno::ENOTDIR) | Err(Errno::ELOOP) => syscall(
            "unlink",
            path,
            unlinkat(
                Some(parent.fd.as_raw_fd()),
                parent.base.as_c_str(),
                UnlinkatFlags::NoRemoveDir,
            ),
        ),
        Err(errno) => Err(ScopedError::Syscall {
            op: "open",
            path: path.to_path_buf(),
            errno,
        }),
    }
}

/// Like [`sdeepunlink`] but tolerates an already-missing target.
pub fn sdeepunlink_if_present(scope: &Scope, path: &Path) -> Result<bool> {
    match sdeepunlink(scope, path) {
        Ok(()) => Ok(true),
        Err(e) if e.errno() == Some(Errno::ENOENT) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Copies `src` (opened read-only, unscoped) to `dst` within the scope.
/// Missing ancestors of `dst` are created with a mode derived from the
/// source: source mode with owner write/execute added, plus execute bits
/// mirroring any group/other read bits. The file itself lands with the
/// source mode plus owner write, applied through the open descriptor.
/// Returns the number of bytes copied.
pub fn scopy(scope: &Scope, src: &Path, dst: &Path) -> Result<u64> {
    let mut reader = File::open(src).map_err(|source| ScopedError::Io {
        op: "open source",
        path: src.to_path_buf(),
        source,
    })?;
    let meta = reader.metadata().map_err(|source| ScopedError::Io {
        op: "stat source",
        path: src.to_path_buf(),
        source,
    })?;
    let src_mode = meta.mode() & 0o7777;

    let mut dir_mode = src_mode | 0o300;
    if src_mode & 0o040 != 0 {
        dir_mode |= 0o010;
    }
    if src_mode & 0o004 != 0 {
        dir_mode |= 0o001;
    }
    if let Some(parent) = dst.parent().filter(|p| !p.as_os_str().is_empty()) {
        sdeepmkdir(scope, parent, Mode::from_bits_truncate(dir_mode))?;
    }

    sunlink_if_present(scope, dst)?;
    let file_mode = Mode::from_bits_truncate(src_mode | 0o200);
    let mut out = sopen(scope, dst, OFlag::O_WRONLY | OFlag::O_CREAT, file_mode)?;

    let mut buf = vec![0u8; COPY_BUF_BYTES];
    let mut total: u64 = 0;
    loop {
        let n = reader.read(&mut buf).map_err(|source| ScopedError::Io {
            op: "read",
            path: src.to_path_buf(),
            source,
        })?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n]).map_err(|source| ScopedError::Io {
            op: "write",
            path: dst.to_path_buf(),
            source,
        })?;
        total += n as u64;
    }

    syscall("chmod", dst, fchmod(out.as_raw_fd(), file_mode))?;
    Ok(total)
}

/// Pushes the file's bytes, then the whole filesystem, to stable storage.
pub fn full_sync<F: AsRawFd>(file: &F, path: &Path) -> Result<()> {
    syscall("fsync", path, nix::unistd::fsync(file.as_raw_fd()))?;
    let ret = unsafe { libc::syncfs(file.as_raw_fd()) };
    syscall("syncfs", path, Errno::result(ret).map(drop))
}

/// Applies nanosecond-precision timestamps through an open descriptor.
pub fn set_times_ns<F: AsRawFd>(
    file: &F,
    atime: (i64, i64),
    mtime: (i64, i64),
    path: &Path,
) -> Result<()> {
    let times = [
        libc::timespec {
            tv_sec: atime.0,
            tv_nsec: atime.1,
        },
        libc::timespec {
            tv_sec: mtime.0,
            tv_nsec: mtime.1,
        },
    ];
    let ret = unsafe { libc::futimens(file.as_raw_fd(), times.as_ptr()) };
    syscall("futimens", path, Errno::result(ret).map(drop))
}
