//! Finder-info extended attributes.
//!
//! Booters and disk labels carry a legacy type/creator pair so firmware
//! and pickers recognize them. The pair rides in the first eight bytes of
//! a 32-byte finder-info record stored as a user xattr on the file.

use std::{
    ffi::CString,
    os::fd::{AsRawFd, RawFd},
};

use nix::errno::Errno;

/// Xattr under which the finder-info record is stored.
pub const XATTR_FINDER_INFO: &str = "user.finderinfo";

pub const FINDER_INFO_LEN: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeCreator {
    pub file_type: [u8; 4],
    pub creator: [u8; 4],
}

/// Booter binaries: type `tbxi`, creator `chrp`.
pub const BOOTER_TYPE_CREATOR: TypeCreator = TypeCreator {
    file_type: *b"tbxi",
    creator: *b"chrp",
};

/// Disk labels: type `labl`, creator `chrp`.
pub const LABEL_TYPE_CREATOR: TypeCreator = TypeCreator {
    file_type: *b"labl",
    creator: *b"chrp",
};

fn fsetxattr(fd: RawFd, name: &str, value: &[u8]) -> nix::Result<()> {
    let name = CString::new(name).expect("xattr name has no NUL");
    let ret = unsafe {
        libc::fsetxattr(
            fd,
            name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            0,
        )
    };
    Errno::result(ret).map(drop)
}

fn fgetxattr(fd: RawFd, name: &str, value: &mut [u8]) -> nix::Result<usize> {
    let name = CString::new(name).expect("xattr name has no NUL");
    let ret = unsafe {
        libc::fgetxattr(
            fd,
            name.as_ptr(),
            value.as_mut_ptr().cast(),
            value.len(),
        )
    };
    Errno::result(ret).map(|n| n as usize)
}

/// Writes the finder-info record carrying `tc` onto the open file.
pub fn set_type_creator<F: AsRawFd>(file: &F, tc: &TypeCreator) -> nix::Result<()> {
    let mut info = [0u8; FINDER_INFO_LEN];
    info[0..4].copy_from_slice(&tc.file_type);
    info[4..8].copy_from_slice(&tc.creator);
    fsetxattr(file.as_raw_fd(), XATTR_FINDER_INFO, &info)
}

/// Reads back the type/creator pair, if the file carries one.
pub fn get_type_creator<F: AsRawFd>(file: &F) -> nix::Result<Option<TypeCreator>> {
    let mut info = [0u8; FINDER_INFO_LEN];
    match fgetxattr(file.as_raw_fd(), XATTR_FINDER_INFO, &mut info) {
        Ok(n) if n >= 8 => {
            let mut tc = TypeCreator {
                file_type: [0; 4],
                creator: [0; 4],
            };
            tc.file_type.copy_from_slice(&info[0..4]);
            tc.creator.copy_from_slice(&info[4..8]);
            Ok(Some(tc))
        }
        Ok(_) => Ok(None),
        Err(Errno::ENODATA) => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::fs::File;

    use tempfile::TempDir;

    #[test]
    fn test_set_and_get() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("boot.efi");
        let file = File::create(&path).unwrap();

        // tmpfs or the build filesystem may not support user xattrs; a
        // clean refusal is acceptable there.
        match set_type_creator(&file, &BOOTER_TYPE_CREATOR) {
            Ok(()) => {
                let read = get_type_creator(&file).unwrap().unwrap();
                assert_eq!(read, BOOTER_TYPE_CREATOR);
            }
            Err(Errno::ENOTSUP) => {}
            Err(e) => panic!("unexpected xattr failure: {e}"),
        }
    }

    #[test]
    fn test_absent_returns_none() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("plain");
        let file = File::create(&path).unwrap();
        match get_type_creator(&file) {
            Ok(found) => assert!(found.is_none()),
            Err(Errno::ENOTSUP) => {}
            Err(e) => panic!("unexpected xattr failure: {e}"),
        }
    }
}
