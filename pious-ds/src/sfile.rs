// Stable-storage layer: the set of local files a data server owns, addressed
// by handle, plus the directory-level control operations. Handles are the
// backing file's (device, inode) pair; they stay valid for the life of the
// server process and go stale on restart, exactly what clients are promised.

use pious_base::{FHandle, StatusCode};
use pious_msg::CreateFlag;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

/// Result of a storage operation, with the wire outcome taxonomy as the
/// error side so replies can be formed directly.
pub(crate) type OpResult<T> = std::result::Result<T, StatusCode>;

const PATH_MAX: usize = 1024;

pub(crate) fn map_io(e: &std::io::Error) -> StatusCode {
    match e.kind() {
        ErrorKind::NotFound => StatusCode::NoEnt,
        ErrorKind::PermissionDenied => StatusCode::Access,
        ErrorKind::AlreadyExists => StatusCode::Exist,
        ErrorKind::InvalidInput => StatusCode::Inval,
        ErrorKind::NotADirectory => StatusCode::NotDir,
        ErrorKind::IsADirectory => StatusCode::Perm,
        ErrorKind::DirectoryNotEmpty => StatusCode::NotEmpty,
        ErrorKind::StorageFull => StatusCode::NoSpc,
        ErrorKind::OutOfMemory => StatusCode::Insuf,
        _ => StatusCode::Unxp,
    }
}

struct OpenFile {
    file: File,
    path: PathBuf,
    writable: bool,
}

pub(crate) struct SFile {
    root: PathBuf,
    files: HashMap<FHandle, OpenFile>,
}

impl SFile {
    pub(crate) fn new(root: PathBuf) -> SFile {
        SFile {
            root,
            files: HashMap::new(),
        }
    }

    /// Root-relative resolution; the server never follows a path out of the
    /// directory tree it owns.
    fn full(&self, path: &str) -> OpResult<PathBuf> {
        if path.is_empty() {
            return Err(StatusCode::NoEnt);
        }
        if path.len() > PATH_MAX {
            return Err(StatusCode::NameTooLong);
        }
        let p = Path::new(path);
        if p.is_absolute() || p.components().any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(StatusCode::Inval);
        }
        Ok(self.root.join(p))
    }

    pub(crate) fn lookup(
        &mut self,
        path: &str,
        cflag: CreateFlag,
        mode: u32,
    ) -> OpResult<(FHandle, i32)> {
        let full = self.full(path)?;
        let mut writable = true;
        let mut created = None;
        if cflag.creat {
            match OpenOptions::new()
                .read(true)
                .write(true)
                .create_new(true)
                .mode(mode & 0o777)
                .open(&full)
            {
                Ok(f) => created = Some(f),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(map_io(&e)),
            }
        }
        let file = match created {
            Some(f) => {
                // Creation modes are exact; the process umask does not apply.
                fs::set_permissions(&full, fs::Permissions::from_mode(mode & 0o777))
                    .map_err(|e| map_io(&e))?;
                f
            }
            None => match OpenOptions::new().read(true).write(true).open(&full) {
                Ok(f) => f,
                Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                    writable = false;
                    File::open(&full).map_err(|e| map_io(&e))?
                }
                Err(e) => return Err(map_io(&e)),
            },
        };
        let meta = file.metadata().map_err(|e| map_io(&e))?;
        if !meta.file_type().is_file() {
            return Err(StatusCode::NotReg);
        }
        if cflag.trunc {
            if !writable {
                return Err(StatusCode::Access);
            }
            file.set_len(0).map_err(|e| map_io(&e))?;
        }
        let fhandle = FHandle {
            dev: meta.dev(),
            ino: meta.ino(),
        };
        let amode = 4 | if writable { 2 } else { 0 };
        self.files.insert(
            fhandle,
            OpenFile {
                file,
                path: full,
                writable,
            },
        );
        Ok((fhandle, amode))
    }

    fn open_file(&self, fhandle: FHandle) -> OpResult<&OpenFile> {
        self.files.get(&fhandle).ok_or(StatusCode::BadFile)
    }

    pub(crate) fn known(&self, fhandle: FHandle) -> bool {
        self.files.contains_key(&fhandle)
    }

    pub(crate) fn writable(&self, fhandle: FHandle) -> OpResult<bool> {
        Ok(self.open_file(fhandle)?.writable)
    }

    pub(crate) fn len(&self, fhandle: FHandle) -> OpResult<i64> {
        let of = self.open_file(fhandle)?;
        let meta = of.file.metadata().map_err(|e| map_io(&e))?;
        Ok(meta.len() as i64)
    }

    /// Read up to `buf.len()` bytes at `offset`; returns bytes read, short
    /// or zero at end of file.
    pub(crate) fn read_at(&self, fhandle: FHandle, offset: i64, buf: &mut [u8]) -> OpResult<usize> {
        let of = self.open_file(fhandle)?;
        let mut done = 0;
        while done < buf.len() {
            match of.file.read_at(&mut buf[done..], (offset as u64) + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_io(&e)),
            }
        }
        Ok(done)
    }

    pub(crate) fn write_at(&self, fhandle: FHandle, offset: i64, data: &[u8]) -> OpResult<()> {
        let of = self.open_file(fhandle)?;
        if !of.writable {
            return Err(StatusCode::Access);
        }
        of.file
            .write_all_at(data, offset as u64)
            .map_err(|e| map_io(&e))
    }

    pub(crate) fn sync(&self, fhandle: FHandle) -> OpResult<()> {
        let of = self.open_file(fhandle)?;
        of.file.sync_all().map_err(|e| map_io(&e))
    }

    pub(crate) fn mkdir(&self, path: &str, mode: u32) -> OpResult<()> {
        let full = self.full(path)?;
        fs::create_dir(&full).map_err(|e| map_io(&e))?;
        fs::set_permissions(&full, fs::Permissions::from_mode(mode & 0o777))
            .map_err(|e| map_io(&e))
    }

    pub(crate) fn rmdir(&self, path: &str) -> OpResult<()> {
        let full = self.full(path)?;
        fs::remove_dir(&full).map_err(|e| map_io(&e))
    }

    /// Unlink a regular file; any handle bound to it goes stale.
    pub(crate) fn unlink(&mut self, path: &str) -> OpResult<Vec<FHandle>> {
        let full = self.full(path)?;
        let meta = fs::symlink_metadata(&full).map_err(|e| map_io(&e))?;
        if !meta.file_type().is_file() {
            return Err(StatusCode::Perm);
        }
        fs::remove_file(&full).map_err(|e| map_io(&e))?;
        let stale: Vec<FHandle> = self
            .files
            .iter()
            .filter(|(_, of)| of.path == full)
            .map(|(fh, _)| *fh)
            .collect();
        for fh in &stale {
            self.files.remove(fh);
        }
        Ok(stale)
    }

    pub(crate) fn chmod(&self, path: &str, mode: u32) -> OpResult<()> {
        let full = self.full(path)?;
        fs::set_permissions(&full, fs::Permissions::from_mode(mode & 0o777))
            .map_err(|e| map_io(&e))
    }

    pub(crate) fn stat(&self, path: &str) -> OpResult<u32> {
        let full = self.full(path)?;
        let meta = fs::symlink_metadata(&full).map_err(|e| map_io(&e))?;
        Ok(meta.mode() & 0o7777)
    }
}
