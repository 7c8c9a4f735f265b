//! Stub file system.
//!
//! The real storage stack is outside the core; the kernel needs only the
//! contract the syscalls and the loader consume: create a named file, open
//! it, and read or write through a handle with its own seek position. Files
//! live in memory for the life of the kernel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use thiserror::Error;

/// File-system errors that cross the stub's boundary.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("file \"{0}\" already exists")]
    AlreadyExists(String),
}

/// In-memory file store keyed by name.
pub struct FileSystem {
    files: Mutex<HashMap<String, Arc<Mutex<Vec<u8>>>>>,
}

impl FileSystem {
    pub(crate) fn new() -> Self {
        FileSystem {
            files: Mutex::new(HashMap::new()),
        }
    }

    /// Create an empty file of `initial_size` zero bytes.
    pub fn create(&self, name: &str, initial_size: usize) -> Result<(), FsError> {
        let mut files = self.files.lock().expect("file table poisoned");
        if files.contains_key(name) {
            return Err(FsError::AlreadyExists(name.to_string()));
        }
        files.insert(name.to_string(), Arc::new(Mutex::new(vec![0; initial_size])));
        Ok(())
    }

    /// Open a file by name; `None` when it does not exist. Every open handle
    /// has its own seek position.
    pub fn open(&self, name: &str) -> Option<OpenFile> {
        let files = self.files.lock().expect("file table poisoned");
        files.get(name).map(|data| OpenFile {
            data: data.clone(),
            pos: Arc::new(Mutex::new(0)),
        })
    }

    /// Install `bytes` as the contents of `name`, replacing any previous
    /// file. The driver uses this to drop host executables into the
    /// simulated store.
    pub fn preload(&self, name: &str, bytes: Vec<u8>) {
        let mut files = self.files.lock().expect("file table poisoned");
        files.insert(name.to_string(), Arc::new(Mutex::new(bytes)));
    }
}

/// Handle to an open file: shared contents, private position.
#[derive(Clone)]
pub struct OpenFile {
    data: Arc<Mutex<Vec<u8>>>,
    pos: Arc<Mutex<usize>>,
}

impl OpenFile {
    /// Read up to `buf.len()` bytes at the current position; returns the
    /// number of bytes read (zero at end of file).
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let data = self.data.lock().expect("file poisoned");
        let mut pos = self.pos.lock().expect("file position poisoned");
        let available = data.len().saturating_sub(*pos);
        let count = available.min(buf.len());
        buf[..count].copy_from_slice(&data[*pos..*pos + count]);
        *pos += count;
        count
    }

    /// Write `buf` at the current position, growing the file as needed.
    pub fn write(&self, buf: &[u8]) {
        let mut data = self.data.lock().expect("file poisoned");
        let mut pos = self.pos.lock().expect("file position poisoned");
        let end = *pos + buf.len();
        if end > data.len() {
            data.resize(end, 0);
        }
        data[*pos..end].copy_from_slice(buf);
        *pos = end;
    }

    /// Read `buf.len()` bytes at an absolute offset without moving the
    /// handle's position; returns the number of bytes read.
    pub fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let data = self.data.lock().expect("file poisoned");
        let available = data.len().saturating_sub(offset);
        let count = available.min(buf.len());
        buf[..count].copy_from_slice(&data[offset..offset + count]);
        count
    }

    /// Length of the file in bytes.
    pub fn len(&self) -> usize {
        self.data.lock().expect("file poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_open_read_write_round_trip() {
        let fs = FileSystem::new();
        fs.create("notes", 0).unwrap();
        let writer = fs.open("notes").unwrap();
        writer.write(b"hello");

        let reader = fs.open("notes").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf), 5);
        assert_eq!(&buf[..5], b"hello");
        assert_eq!(reader.read(&mut buf), 0);
    }

    #[test]
    fn create_twice_fails() {
        let fs = FileSystem::new();
        fs.create("f", 0).unwrap();
        assert!(matches!(fs.create("f", 0), Err(FsError::AlreadyExists(_))));
    }

    #[test]
    fn open_missing_file_is_none() {
        let fs = FileSystem::new();
        assert!(fs.open("nope").is_none());
    }

    #[test]
    fn handles_have_independent_positions() {
        let fs = FileSystem::new();
        fs.preload("f", b"abcdef".to_vec());
        let a = fs.open("f").unwrap();
        let b = fs.open("f").unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(a.read(&mut buf), 3);
        assert_eq!(&buf, b"abc");
        assert_eq!(b.read(&mut buf), 3);
        assert_eq!(&buf, b"abc");
    }

    #[test]
    fn sized_create_is_zero_filled() {
        let fs = FileSystem::new();
        fs.create("z", 4).unwrap();
        let f = fs.open("z").unwrap();
        assert_eq!(f.len(), 4);
        let mut buf = [0xffu8; 4];
        assert_eq!(f.read(&mut buf), 4);
        assert_eq!(buf, [0, 0, 0, 0]);
    }
}
