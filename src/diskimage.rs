//! Disk image backing store.
//!
//! Full random-access byte-range read/write over a persisted block image,
//! since the SD-card target needs arbitrary-sector seeks rather than a
//! single save/load round trip.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use log::warn;

use crate::config::MountOptions;
use crate::error::PeripheralError;

pub const SECTOR_SIZE: usize = 512;

/// Largest image a 32-bit CMD17/CMD24 block address can reach.
pub const MAX_IMAGE_BYTES: u64 = u32::MAX as u64 * SECTOR_SIZE as u64;

/// A random-access byte store backing the SD-card target. Reads past EOF
/// return 0xFF-filled data; writes past EOF are dropped.
pub trait BlockStore: Send {
    fn len(&self) -> u64;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn read_at(&mut self, offset: u64, buf: &mut [u8]);
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), PeripheralError>;
}

/// A disk image backed by a real file on disk.
pub struct FileBlockStore {
    file: File,
    len: u64,
}

impl FileBlockStore {
    pub fn mount(opts: &MountOptions) -> Result<Self, PeripheralError> {
        Self::mount_path(&opts.path, opts.create_if_missing)
    }

    pub fn mount_path(path: &Path, create_if_missing: bool) -> Result<Self, PeripheralError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create_if_missing)
            .open(path)
            .map_err(|source| PeripheralError::MountFailed {
                path: path.to_path_buf(),
                source,
            })?;
        let len = file
            .metadata()
            .map_err(|source| PeripheralError::MountFailed {
                path: path.to_path_buf(),
                source,
            })?
            .len();
        if len > MAX_IMAGE_BYTES {
            return Err(PeripheralError::ImageTooLarge {
                path: path.to_path_buf(),
                len,
                max: MAX_IMAGE_BYTES,
            });
        }
        Ok(Self { file, len })
    }

    /// Flush and close the backing file.
    pub fn unmount(mut self) {
        let _ = self.file.flush();
    }
}

impl BlockStore for FileBlockStore {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) {
        buf.fill(0xFF);
        if offset >= self.len {
            warn!("disk image read at offset {offset} exceeds image length {}, no I/O performed", self.len);
            return;
        }
        if self.file.seek(SeekFrom::Start(offset)).is_err() {
            warn!("disk image seek to {offset} failed");
            return;
        }
        let readable = ((self.len - offset) as usize).min(buf.len());
        if let Err(err) = self.file.read_exact(&mut buf[..readable]) {
            warn!("disk image short read at offset {offset}: {err}");
        }
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), PeripheralError> {
        if offset + data.len() as u64 > self.len {
            warn!("disk image write at offset {offset} exceeds image length {}, dropped", self.len);
            return Ok(());
        }
        self.file
            .seek(SeekFrom::Start(offset))
            .and_then(|_| self.file.write_all(data))
            .map_err(|source| PeripheralError::DiskIo {
                sector: (offset / SECTOR_SIZE as u64) as u32,
                source,
            })
    }
}

/// An in-memory backing store, used by tests in place of a real file.
pub struct MemBlockStore {
    data: Vec<u8>,
}

impl MemBlockStore {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }
}

impl BlockStore for MemBlockStore {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) {
        buf.fill(0xFF);
        let offset = offset as usize;
        if offset >= self.data.len() {
            warn!("in-memory disk image read at offset {offset} exceeds length {}, no I/O performed", self.data.len());
            return;
        }
        let readable = (self.data.len() - offset).min(buf.len());
        buf[..readable].copy_from_slice(&self.data[offset..offset + readable]);
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), PeripheralError> {
        let offset = offset as usize;
        if offset + data.len() > self.data.len() {
            warn!("in-memory disk image write at offset {offset} exceeds length, dropped");
            return Ok(());
        }
        self.data[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_past_eof_fills_0xff() {
        let mut store = MemBlockStore::new(vec![1, 2, 3]);
        let mut buf = [0u8; 8];
        store.read_at(0, &mut buf);
        assert_eq!(&buf[..3], &[1, 2, 3]);
        assert_eq!(&buf[3..], &[0xFF; 5]);
    }

    #[test]
    fn write_past_eof_is_dropped() {
        let mut store = MemBlockStore::new(vec![0u8; 4]);
        assert!(store.write_at(2, &[9, 9, 9]).is_ok());
        let mut buf = [0u8; 4];
        store.read_at(0, &mut buf);
        assert_eq!(buf, [0, 0, 0, 0]);
    }

    #[test]
    fn write_in_bounds_round_trips() {
        let mut store = MemBlockStore::new(vec![0u8; 512]);
        store.write_at(0, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        store.read_at(0, &mut buf);
        assert_eq!(buf, [1, 2, 3, 4]);
    }
}
