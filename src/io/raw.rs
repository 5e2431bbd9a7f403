//! Raw byte-file layer.
//!
//! Thin positional I/O over one backing file. The descriptor is opened
//! lazily and upgraded to read-write only when a writer asks for it; an
//! `EACCES` on upgrade retries once with the owner-write bit temporarily
//! set, which lets read-only files be modified by their owner the way the
//! kernel allows through `chmod`. The size is cached between writes since
//! `getSize` is on the hot path of every block write.

use std::cell::Cell;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use crate::error::{IoError, IoResult};

use super::{FileAttr, FileIo};

#[derive(Debug)]
pub struct RawFileIo {
    name: PathBuf,
    file: Option<File>,
    can_write: bool,
    known_size: Cell<Option<u64>>,
}

impl RawFileIo {
    pub fn new(name: PathBuf) -> RawFileIo {
        RawFileIo {
            name,
            file: None,
            can_write: false,
            known_size: Cell::new(None),
        }
    }

    fn open_readonly_workaround(&self) -> io::Result<File> {
        use std::os::unix::fs::PermissionsExt;

        let meta = std::fs::symlink_metadata(&self.name)?;
        let original = meta.permissions();
        let mut relaxed = original.clone();
        relaxed.set_mode(original.mode() | 0o600);
        std::fs::set_permissions(&self.name, relaxed)?;
        let result = OpenOptions::new().read(true).write(true).open(&self.name);
        let _ = std::fs::set_permissions(&self.name, original);
        result
    }

    fn ensure_open(&mut self, write_mode: bool) -> IoResult<&File> {
        if self.file.is_none() || (write_mode && !self.can_write) {
            self.open(write_mode)?;
        }
        Ok(self.file.as_ref().expect("descriptor present after open"))
    }
}

impl FileIo for RawFileIo {
    fn open(&mut self, write_mode: bool) -> IoResult<()> {
        if self.file.is_some() && (self.can_write || !write_mode) {
            tracing::debug!("using existing descriptor for {:?}", self.name);
            return Ok(());
        }

        let attempt = OpenOptions::new()
            .read(true)
            .write(write_mode)
            .open(&self.name);
        let file = match attempt {
            Ok(f) => f,
            Err(e) if write_mode && e.kind() == io::ErrorKind::PermissionDenied => {
                tracing::debug!("using readonly workaround for {:?}", self.name);
                self.open_readonly_workaround().map_err(IoError::Os)?
            }
            Err(e) => {
                tracing::debug!("open failed for {:?}: {e}", self.name);
                return Err(IoError::Os(e));
            }
        };

        self.can_write = write_mode;
        self.file = Some(file);
        Ok(())
    }

    fn set_file_name(&mut self, name: &Path) {
        self.name = name.to_path_buf();
    }

    fn file_name(&self) -> &Path {
        &self.name
    }

    fn set_iv(&mut self, _iv: u64) -> IoResult<()> {
        // no cryptographic state at this layer
        Ok(())
    }

    fn get_attr(&self) -> IoResult<FileAttr> {
        let meta = std::fs::symlink_metadata(&self.name).map_err(|e| {
            tracing::debug!("getAttr error on {:?}: {e}", self.name);
            IoError::Os(e)
        })?;
        Ok(FileAttr::from_metadata(&meta))
    }

    fn get_size(&self) -> IoResult<u64> {
        if let Some(size) = self.known_size.get() {
            return Ok(size);
        }
        let meta = std::fs::symlink_metadata(&self.name).map_err(|e| {
            tracing::warn!("getSize on {:?} failed: {e}", self.name);
            IoError::Os(e)
        })?;
        self.known_size.set(Some(meta.len()));
        Ok(meta.len())
    }

    fn read(&mut self, offset: u64, buf: &mut [u8]) -> IoResult<usize> {
        use std::os::unix::fs::FileExt;

        let file = self.ensure_open(false)?;
        file.read_at(buf, offset).map_err(|e| {
            tracing::warn!(
                "read failed at offset {offset} for {} bytes: {e}",
                buf.len()
            );
            IoError::Os(e)
        })
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> IoResult<usize> {
        use std::os::unix::fs::FileExt;

        self.ensure_open(true)?;
        let file = self.file.as_ref().expect("descriptor present after open");

        let mut written = 0usize;
        while written < data.len() {
            match file.write_at(&data[written..], offset + written as u64) {
                Ok(0) => return Err(IoError::from_errno(libc::EIO)),
                Ok(n) => written += n,
                Err(e) => {
                    self.known_size.set(None);
                    tracing::warn!(
                        "write failed at offset {} for {} bytes: {e}",
                        offset + written as u64,
                        data.len() - written
                    );
                    return Err(IoError::Os(e));
                }
            }
        }

        if let Some(size) = self.known_size.get() {
            let end = offset + data.len() as u64;
            if end > size {
                self.known_size.set(Some(end));
            }
        }
        Ok(data.len())
    }

    fn truncate(&mut self, size: u64) -> IoResult<()> {
        let result = if self.file.is_some() && self.can_write {
            self.file.as_ref().expect("writable descriptor").set_len(size)
        } else {
            OpenOptions::new()
                .write(true)
                .open(&self.name)
                .and_then(|f| f.set_len(size))
        };

        match result {
            Ok(()) => {
                self.known_size.set(Some(size));
                if let (Some(file), true) = (self.file.as_ref(), self.can_write) {
                    let _ = file.sync_data();
                }
                Ok(())
            }
            Err(e) => {
                self.known_size.set(None);
                tracing::warn!("truncate failed for {:?} size {size}: {e}", self.name);
                Err(IoError::Os(e))
            }
        }
    }

    fn is_writable(&self) -> bool {
        self.can_write
    }

    fn sync(&mut self, datasync: bool) -> IoResult<()> {
        let file = self.ensure_open(false)?;
        let res = if datasync {
            file.sync_data()
        } else {
            file.sync_all()
        };
        res.map_err(IoError::Os)
    }
}
