/// File access inside a workspace that untrusted programs have written to.
///
/// Every path is resolved component by component with `openat` and
/// `O_NOFOLLOW`, starting from an fd of the workspace root. A symlink
/// anywhere along the way is refused, so host-side reads and writes can
/// never be redirected outside the workspace.
use super::safe_cleanup::DirFd;
use crate::config::types::{EvalError, Result};
use std::ffi::{CStr, CString};
use std::fmt;
use std::fs::File;
use std::io;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Component, Path};

const DIR_FLAGS: libc::c_int = libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC | libc::O_NOFOLLOW;
const DIR_MODE: libc::mode_t = 0o755;

/// What sits at a workspace path, without following links
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Symlink,
    Other,
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntryKind::File => "a regular file",
            EntryKind::Dir => "a directory",
            EntryKind::Symlink => "a symbolic link",
            EntryKind::Other => "a special file",
        })
    }
}

fn names(rel: &Path) -> Result<Vec<CString>> {
    let mut out = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => out.push(CString::new(part.as_bytes()).map_err(|_| {
                EvalError::Filesystem(format!("Path contains NUL byte: {}", rel.display()))
            })?),
            Component::CurDir => {}
            _ => {
                return Err(EvalError::Sandbox(format!(
                    "path escapes sandbox: {}",
                    rel.display()
                )))
            }
        }
    }
    Ok(out)
}

fn to_error(err: io::Error, rel: &Path) -> EvalError {
    match err.raw_os_error() {
        Some(libc::ELOOP) => EvalError::Sandbox(format!(
            "refusing to follow symbolic link at {}",
            rel.display()
        )),
        _ => EvalError::Io(io::Error::new(
            err.kind(),
            format!("{}: {}", rel.display(), err),
        )),
    }
}

fn open_root(root: &Path) -> io::Result<DirFd> {
    let root_c = CString::new(root.as_os_str().as_bytes())
        .map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
    let fd = unsafe { libc::open(root_c.as_ptr(), DIR_FLAGS) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(DirFd(fd))
}

fn is_symlink_at(parent: RawFd, name: &CStr) -> bool {
    let mut st = std::mem::MaybeUninit::<libc::stat>::zeroed();
    let rc = unsafe {
        libc::fstatat(
            parent,
            name.as_ptr(),
            st.as_mut_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    rc == 0 && unsafe { st.assume_init() }.st_mode & libc::S_IFMT == libc::S_IFLNK
}

/// Open (or create) one directory level. A symlink fails with `ELOOP`.
fn open_dir_at(parent: RawFd, name: &CStr, create: bool) -> io::Result<DirFd> {
    let fd = unsafe { libc::openat(parent, name.as_ptr(), DIR_FLAGS) };
    if fd >= 0 {
        return Ok(DirFd(fd));
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::ENOTDIR) | Some(libc::ELOOP) if is_symlink_at(parent, name) => {
            return Err(io::Error::from_raw_os_error(libc::ELOOP))
        }
        Some(libc::ENOENT) if create => {}
        _ => return Err(err),
    }
    if unsafe { libc::mkdirat(parent, name.as_ptr(), DIR_MODE) } != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EEXIST) {
            return Err(err);
        }
    }
    let fd = unsafe { libc::openat(parent, name.as_ptr(), DIR_FLAGS) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(DirFd(fd))
}

fn walk(root: &Path, dirs: &[CString], create: bool) -> io::Result<DirFd> {
    let mut dir = open_root(root)?;
    for name in dirs {
        dir = open_dir_at(dir.0, name, create)?;
    }
    Ok(dir)
}

/// Parent directory components and the final component of `rel`
fn split(rel: &Path) -> Result<(Vec<CString>, CString)> {
    let mut dirs = names(rel)?;
    let leaf = dirs
        .pop()
        .ok_or_else(|| EvalError::Sandbox(format!("not a file path: {}", rel.display())))?;
    Ok((dirs, leaf))
}

fn walk_parent(root: &Path, rel: &Path, create: bool) -> Result<(DirFd, CString)> {
    let (dirs, leaf) = split(rel)?;
    let dir = walk(root, &dirs, create).map_err(|e| to_error(e, rel))?;
    Ok((dir, leaf))
}

fn open_leaf(dir: &DirFd, leaf: &CStr, flags: libc::c_int, mode: libc::mode_t, rel: &Path) -> Result<File> {
    // O_NONBLOCK keeps a planted FIFO from hanging the open
    let flags = flags | libc::O_NOFOLLOW | libc::O_CLOEXEC | libc::O_NONBLOCK;
    let fd = unsafe { libc::openat(dir.0, leaf.as_ptr(), flags, mode as libc::c_uint) };
    if fd < 0 {
        return Err(to_error(io::Error::last_os_error(), rel));
    }
    let file = unsafe { File::from_raw_fd(fd) };
    if !file.metadata()?.is_file() {
        return Err(EvalError::Sandbox(format!(
            "not a regular file: {}",
            rel.display()
        )));
    }
    Ok(file)
}

/// Open an existing regular file for reading
pub fn open_read(root: &Path, rel: &Path) -> Result<File> {
    let (dir, leaf) = walk_parent(root, rel, false)?;
    open_leaf(&dir, &leaf, libc::O_RDONLY, 0, rel)
}

/// Create or truncate a regular file, creating missing parent directories.
/// `mode` applies to newly created files only.
pub fn open_write(root: &Path, rel: &Path, mode: u32) -> Result<File> {
    let (dir, leaf) = walk_parent(root, rel, true)?;
    open_leaf(
        &dir,
        &leaf,
        libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
        mode as libc::mode_t,
        rel,
    )
}

pub fn create_dirs(root: &Path, rel: &Path) -> Result<()> {
    walk(root, &names(rel)?, true).map_err(|e| to_error(e, rel))?;
    Ok(())
}

/// Kind of the entry at `rel`; `None` when it does not exist. A symlinked
/// parent directory reports the path as a symlink.
pub fn entry_kind(root: &Path, rel: &Path) -> Result<Option<EntryKind>> {
    let (dirs, leaf) = split(rel)?;
    let dir = match walk(root, &dirs, false) {
        Ok(dir) => dir,
        Err(e) => {
            return match e.raw_os_error() {
                Some(libc::ELOOP) => Ok(Some(EntryKind::Symlink)),
                Some(libc::ENOENT) | Some(libc::ENOTDIR) => Ok(None),
                _ => Err(to_error(e, rel)),
            }
        }
    };

    let mut st = std::mem::MaybeUninit::<libc::stat>::zeroed();
    let rc = unsafe {
        libc::fstatat(
            dir.0,
            leaf.as_ptr(),
            st.as_mut_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        return match err.raw_os_error() {
            Some(libc::ENOENT) | Some(libc::ENOTDIR) => Ok(None),
            _ => Err(to_error(err, rel)),
        };
    }
    let st = unsafe { st.assume_init() };
    Ok(Some(match st.st_mode & libc::S_IFMT {
        libc::S_IFREG => EntryKind::File,
        libc::S_IFDIR => EntryKind::Dir,
        libc::S_IFLNK => EntryKind::Symlink,
        _ => EntryKind::Other,
    }))
}

/// Unlink the entry at `rel` (links are removed, not followed). Missing
/// entries are fine.
pub fn remove_file(root: &Path, rel: &Path) -> Result<()> {
    let (dirs, leaf) = split(rel)?;
    let dir = match walk(root, &dirs, false) {
        Ok(dir) => dir,
        Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::ENOTDIR)) => {
            return Ok(())
        }
        Err(e) => return Err(to_error(e, rel)),
    };
    if unsafe { libc::unlinkat(dir.0, leaf.as_ptr(), 0) } != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ENOENT) {
            return Err(to_error(err, rel));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::{Read, Write};
    use std::os::unix::fs::symlink;

    fn setup() -> (tempfile::TempDir, std::path::PathBuf, std::path::PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("ws");
        let outside = tmp.path().join("outside");
        fs::create_dir(&root).unwrap();
        fs::create_dir(&outside).unwrap();
        fs::write(outside.join("secret"), "HOST-SECRET\n").unwrap();
        (tmp, root, outside)
    }

    #[test]
    fn reads_and_writes_nested_files() {
        let (_tmp, root, _) = setup();
        open_write(&root, Path::new("a/b/c.txt"), 0o644)
            .unwrap()
            .write_all(b"hi")
            .unwrap();
        let mut text = String::new();
        open_read(&root, Path::new("a/b/c.txt"))
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "hi");
        assert_eq!(entry_kind(&root, Path::new("a/b")).unwrap(), Some(EntryKind::Dir));
        assert_eq!(entry_kind(&root, Path::new("a/x")).unwrap(), None);
    }

    #[test]
    fn symlinked_leaf_is_refused() {
        let (_tmp, root, outside) = setup();
        symlink(outside.join("secret"), root.join("out.txt")).unwrap();

        assert!(matches!(
            open_read(&root, Path::new("out.txt")),
            Err(EvalError::Sandbox(_))
        ));
        assert!(open_write(&root, Path::new("out.txt"), 0o644).is_err());
        assert_eq!(fs::read_to_string(outside.join("secret")).unwrap(), "HOST-SECRET\n");
        assert_eq!(
            entry_kind(&root, Path::new("out.txt")).unwrap(),
            Some(EntryKind::Symlink)
        );
    }

    #[test]
    fn symlinked_parent_is_refused() {
        let (_tmp, root, outside) = setup();
        symlink(&outside, root.join("data")).unwrap();

        assert!(open_write(&root, Path::new("data/planted"), 0o644).is_err());
        assert!(!outside.join("planted").exists());
        assert!(open_read(&root, Path::new("data/secret")).is_err());
        assert_eq!(
            entry_kind(&root, Path::new("data/secret")).unwrap(),
            Some(EntryKind::Symlink)
        );
    }

    #[test]
    fn remove_unlinks_dangling_links() {
        let (_tmp, root, outside) = setup();
        symlink(root.join("gone"), root.join("dangling")).unwrap();
        symlink(outside.join("secret"), root.join("live")).unwrap();

        remove_file(&root, Path::new("dangling")).unwrap();
        remove_file(&root, Path::new("live")).unwrap();
        remove_file(&root, Path::new("never/existed")).unwrap();
        assert!(fs::symlink_metadata(root.join("dangling")).is_err());
        assert!(fs::symlink_metadata(root.join("live")).is_err());
        assert!(outside.join("secret").exists());
    }

    #[test]
    fn rejects_escaping_paths() {
        let (_tmp, root, _) = setup();
        assert!(open_read(&root, Path::new("../outside/secret")).is_err());
        assert!(open_write(&root, Path::new("/etc/passwd"), 0o644).is_err());
    }
}
