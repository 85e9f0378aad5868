/// Symlink-safe removal of sandbox workspaces and result directories.
///
/// Student programs control the contents of both trees, so removal walks
/// them with `openat`/`fstatat`/`unlinkat` and never follows a symlink or
/// crosses onto another filesystem.
use crate::config::types::{EvalError, Result};
use log::debug;
use std::ffi::{CStr, CString};
use std::fs;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

pub(crate) struct DirFd(pub(crate) RawFd);

impl Drop for DirFd {
    fn drop(&mut self) {
        if self.0 >= 0 {
            unsafe {
                libc::close(self.0);
            }
        }
    }
}

fn last_os_error(what: &str, subject: impl std::fmt::Debug) -> EvalError {
    EvalError::Filesystem(format!(
        "{} failed for {:?}: {}",
        what,
        subject,
        std::io::Error::last_os_error()
    ))
}

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| {
        EvalError::Filesystem(format!("Path contains NUL byte: {}", path.display()))
    })
}

fn open_dir(path: &Path) -> Result<DirFd> {
    let path_c = c_path(path)?;
    let fd = unsafe {
        libc::open(
            path_c.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
        )
    };
    if fd < 0 {
        return Err(last_os_error("open", path));
    }
    Ok(DirFd(fd))
}

fn stat_at(dir_fd: RawFd, name: &CStr) -> Result<libc::stat> {
    let mut st = std::mem::MaybeUninit::<libc::stat>::zeroed();
    let rc = unsafe {
        libc::fstatat(
            dir_fd,
            name.as_ptr(),
            st.as_mut_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        return Err(last_os_error("fstatat", name));
    }
    Ok(unsafe { st.assume_init() })
}

fn unlink_at(dir_fd: RawFd, name: &CStr, flags: i32) -> Result<()> {
    if unsafe { libc::unlinkat(dir_fd, name.as_ptr(), flags) } != 0 {
        return Err(last_os_error("unlinkat", name));
    }
    Ok(())
}

/// Names of the entries of an open directory, excluding `.` and `..`
fn list_entries(dir_fd: RawFd) -> Result<Vec<CString>> {
    let iter_fd = unsafe { libc::dup(dir_fd) };
    if iter_fd < 0 {
        return Err(last_os_error("dup", dir_fd));
    }
    let dir = unsafe { libc::fdopendir(iter_fd) };
    if dir.is_null() {
        unsafe {
            libc::close(iter_fd);
        }
        return Err(last_os_error("fdopendir", dir_fd));
    }

    let mut names = Vec::new();
    loop {
        unsafe {
            *libc::__errno_location() = 0;
        }
        let entry = unsafe { libc::readdir(dir) };
        if entry.is_null() {
            let errno = unsafe { *libc::__errno_location() };
            unsafe {
                libc::closedir(dir);
            }
            if errno != 0 {
                return Err(EvalError::Filesystem(format!(
                    "readdir failed: {}",
                    std::io::Error::from_raw_os_error(errno)
                )));
            }
            break;
        }
        let name = unsafe { CStr::from_ptr((*entry).d_name.as_ptr()) };
        if name.to_bytes() != b"." && name.to_bytes() != b".." {
            names.push(name.to_owned());
        }
    }
    Ok(names)
}

fn empty_dir_fd(dir_fd: RawFd, root_dev: libc::dev_t) -> Result<()> {
    for name in list_entries(dir_fd)? {
        let st = stat_at(dir_fd, &name)?;
        if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
            if st.st_dev != root_dev {
                return Err(EvalError::Filesystem(format!(
                    "Refusing to cross filesystem boundary at {:?}",
                    name
                )));
            }
            let child = unsafe {
                libc::openat(
                    dir_fd,
                    name.as_ptr(),
                    libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW,
                )
            };
            if child < 0 {
                return Err(last_os_error("openat", &name));
            }
            let child = DirFd(child);
            empty_dir_fd(child.0, root_dev)?;
            unlink_at(dir_fd, &name, libc::AT_REMOVEDIR)?;
        } else {
            unlink_at(dir_fd, &name, 0)?;
        }
    }
    Ok(())
}

/// Remove `path` and everything below it. Missing paths are fine.
pub fn remove_tree_secure(path: &Path) -> Result<()> {
    if fs::symlink_metadata(path).is_err() {
        return Ok(());
    }

    let parent = path.parent().ok_or_else(|| {
        EvalError::Filesystem(format!("Cannot remove path without parent: {}", path.display()))
    })?;
    let name = path.file_name().ok_or_else(|| {
        EvalError::Filesystem(format!("Cannot remove path without file name: {}", path.display()))
    })?;
    let name = CString::new(name.as_bytes()).map_err(|_| {
        EvalError::Filesystem(format!("Path contains NUL byte: {}", path.display()))
    })?;

    let parent_fd = open_dir(if parent.as_os_str().is_empty() {
        Path::new(".")
    } else {
        parent
    })?;
    let st = stat_at(parent_fd.0, &name)?;
    if st.st_mode & libc::S_IFMT == libc::S_IFDIR {
        let dir_fd = open_dir(path)?;
        empty_dir_fd(dir_fd.0, st.st_dev)?;
        drop(dir_fd);
        unlink_at(parent_fd.0, &name, libc::AT_REMOVEDIR)?;
    } else {
        unlink_at(parent_fd.0, &name, 0)?;
    }
    debug!("removed {}", path.display());
    Ok(())
}

/// Purge any stale content at `path` and recreate it as an empty directory
pub fn reset_dir(path: &Path) -> Result<()> {
    remove_tree_secure(path)?;
    fs::create_dir_all(path).map_err(|e| {
        EvalError::Io(std::io::Error::new(
            e.kind(),
            format!("Failed to create directory {}: {}", path.display(), e),
        ))
    })
}
