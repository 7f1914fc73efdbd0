use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use log::debug;

use crate::{Cred, OpenFlags, SysError, SysResult};

/// One open host file.  All volume data flows through these.
pub struct HostFile {
    file: File,
}

/// Owner check done *after* the open, on the open descriptor, so there is
/// no window between a stat and the open.
fn can_access(uid: u32, cred: Cred) -> bool {
    if cred.uid == 0 {
        return true;
    }
    cred.uid == uid
}

fn lock(file: &File, flags: OpenFlags) -> SysResult<()> {
    let op = if flags.contains(OpenFlags::DENYALL) {
        libc::LOCK_EX | libc::LOCK_NB
    } else if flags.contains(OpenFlags::DENYWRITE) {
        libc::LOCK_SH | libc::LOCK_NB
    } else {
        return Ok(());
    };
    if unsafe { libc::flock(file.as_raw_fd(), op) } == -1 {
        let e = std::io::Error::last_os_error();
        if e.raw_os_error() == Some(libc::EWOULDBLOCK) {
            return Err(SysError::Locked);
        }
        return Err(e.into());
    }
    Ok(())
}

fn open_options(flags: OpenFlags) -> OpenOptions {
    let mut opts = OpenOptions::new();
    if flags.contains(OpenFlags::WRITEONLY) {
        opts.write(true);
    } else if flags.contains(OpenFlags::READWRITE) {
        opts.read(true).write(true);
    } else {
        opts.read(true);
    }
    if flags.contains(OpenFlags::WRITE_THROUGH) {
        opts.custom_flags(libc::O_SYNC);
    }
    opts
}

impl HostFile {
    /// Open an existing file (or create it when `CREATE_IF_NEW` is given).
    pub fn open(path: &Path, flags: OpenFlags, cred: Cred) -> SysResult<HostFile> {
        let mut opts = open_options(flags);
        if flags.contains(OpenFlags::CREATE_IF_NEW) {
            opts.create(true);
        }
        if flags.contains(OpenFlags::TRUNC_IF_EXISTS) {
            opts.truncate(true);
        }
        opts.mode(0o600);
        let file = opts.open(path)?;

        if cred.enforce {
            let meta = file.metadata()?;
            if !can_access(meta.uid(), cred) {
                return Err(SysError::AccessDenied);
            }
        }

        lock(&file, flags)?;
        debug!("opened {:?}", path);
        Ok(HostFile { file })
    }

    /// Create a new file with exclusive-create semantics.  The initial size
    /// is advisory preallocation only.
    pub fn create(
        path: &Path,
        flags: OpenFlags,
        initial_size: u64,
        cred: Cred,
    ) -> SysResult<HostFile> {
        let mut opts = open_options(flags);
        opts.create_new(true).mode(0o600);
        let file = opts.open(path)?;

        if cred.enforce {
            let fd = file.as_raw_fd();
            if unsafe { libc::fchown(fd, cred.uid, cred.gid) } == -1 {
                return Err(std::io::Error::last_os_error().into());
            }
            if unsafe { libc::fchmod(fd, cred.mode as libc::mode_t) } == -1 {
                return Err(std::io::Error::last_os_error().into());
            }
        }

        lock(&file, flags)?;

        if initial_size > 0 {
            // Preallocation failure is not fatal.
            let _ = file.set_len(initial_size);
        }
        debug!("created {:?} ({} bytes preallocated)", path, initial_size);
        Ok(HostFile { file })
    }

    pub fn set_pos(&mut self, pos: u64) -> SysResult<()> {
        self.file.seek(SeekFrom::Start(pos))?;
        Ok(())
    }

    /// Read until `buf` is full or end-of-file; returns the byte count.
    pub fn read(&mut self, buf: &mut [u8]) -> SysResult<usize> {
        let mut done = 0;
        while done < buf.len() {
            match self.file.read(&mut buf[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(done)
    }

    /// Write the whole buffer; returns the byte count.
    pub fn write(&mut self, buf: &[u8]) -> SysResult<usize> {
        let mut done = 0;
        while done < buf.len() {
            match self.file.write(&buf[done..]) {
                Ok(0) => return Err(SysError::Io),
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(done)
    }

    /// Truncate the file to `size`.  Growing is not guaranteed and is
    /// silently skipped (allocation hints stay hints).
    pub fn set_size(&mut self, size: u64) -> SysResult<()> {
        if size >= self.size()? {
            return Ok(());
        }
        self.file.set_len(size)?;
        Ok(())
    }

    pub fn size(&self) -> SysResult<u64> {
        Ok(self.file.metadata()?.len())
    }
}

pub fn file_exists(path: &Path) -> SysResult<bool> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

pub fn delete_file(path: &Path, _cred: Cred) -> SysResult<()> {
    fs::remove_file(path)?;
    Ok(())
}
