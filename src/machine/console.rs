//! Synchronous console.
//!
//! The console device is external to the core; what the kernel needs from it
//! is a blocking byte-at-a-time interface plus the line-oriented helpers the
//! Read/Write syscalls use. Endpoints are injectable so that the driver can
//! pass the process's stdin/stdout while tests capture everything in
//! buffers.

use std::io::{Read, Write};
use std::sync::Mutex;

/// Synchronous console: one reader endpoint, one writer endpoint.
pub struct SynchConsole {
    input: Mutex<Box<dyn Read + Send>>,
    output: Mutex<Box<dyn Write + Send>>,
}

impl SynchConsole {
    pub(crate) fn with_endpoints(
        input: Box<dyn Read + Send>,
        output: Box<dyn Write + Send>,
    ) -> Self {
        SynchConsole {
            input: Mutex::new(input),
            output: Mutex::new(output),
        }
    }

    /// Read one byte; `None` at end of input.
    pub fn get(&self) -> Option<u8> {
        let mut input = self.input.lock().expect("console input poisoned");
        let mut byte = [0u8; 1];
        match input.read(&mut byte) {
            Ok(1) => Some(byte[0]),
            _ => None,
        }
    }

    /// Write one byte.
    pub fn put(&self, byte: u8) {
        let mut output = self.output.lock().expect("console output poisoned");
        let _ = output.write_all(&[byte]);
        let _ = output.flush();
    }

    /// Read a line into `buf`: stops at a newline (consumed, not stored) or
    /// when one byte of room is left, NUL-terminates, and returns the number
    /// of bytes stored before the NUL.
    pub fn read_line(&self, buf: &mut [u8]) -> usize {
        let mut count = 0;
        while count + 1 < buf.len() {
            match self.get() {
                Some(b'\n') | None => break,
                Some(byte) => {
                    buf[count] = byte;
                    count += 1;
                }
            }
        }
        buf[count] = 0;
        count
    }

    /// Write a whole buffer.
    pub fn write_all(&self, bytes: &[u8]) {
        let mut output = self.output.lock().expect("console output poisoned");
        let _ = output.write_all(bytes);
        let _ = output.flush();
    }
}
