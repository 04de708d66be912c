use std::fs::File;
use std::io::{ErrorKind, Read};
use std::thread::{self, JoinHandle};

use log::debug;

use crate::RunBoxError;

/// Byte buffer which keeps at most `limit` bytes and silently drops the rest
#[derive(Debug, Clone)]
pub struct BoundedBuffer {
  limit: usize,
  bytes: Vec<u8>,
  truncated: bool,
}

/// Drains the read end of a capture pipe on a separate thread
pub struct Capture {
  handle: JoinHandle<std::io::Result<BoundedBuffer>>,
}

impl BoundedBuffer {
  pub fn new(limit: usize) -> Self {
    BoundedBuffer {
      limit,
      bytes: Vec::with_capacity(limit),
      truncated: false,
    }
  }

  pub fn push(&mut self, chunk: &[u8]) {
    let room = self.limit - self.bytes.len();
    if chunk.len() > room {
      self.truncated = true;
    }
    self.bytes.extend_from_slice(&chunk[..chunk.len().min(room)]);
  }

  pub fn as_bytes(&self) -> &[u8] {
    &self.bytes
  }

  pub fn len(&self) -> usize {
    self.bytes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.bytes.is_empty()
  }

  pub fn is_truncated(&self) -> bool {
    self.truncated
  }

  pub fn into_string(self) -> String {
    String::from_utf8_lossy(&self.bytes).into_owned()
  }
}

impl Capture {
  pub fn spawn(mut file: File, limit: usize) -> Self {
    let handle = thread::spawn(move || {
      let mut buffer = BoundedBuffer::new(limit);
      let mut chunk = [0u8; 4096];
      loop {
        match file.read(&mut chunk) {
          Ok(0) => break,
          Ok(size) => buffer.push(&chunk[..size]),
          Err(err) if err.kind() == ErrorKind::Interrupted => continue,
          Err(err) => return Err(err),
        }
      }
      Ok(buffer)
    });
    Capture { handle }
  }

  /// Wait until every write end is closed
  pub fn finish(self) -> Result<BoundedBuffer, RunBoxError> {
    let buffer = self
      .handle
      .join()
      .map_err(|_| RunBoxError::monitor("Capture thread panicked"))??;
    if buffer.is_truncated() {
      debug!("Captured output truncated to {} bytes", buffer.len());
    }
    Ok(buffer)
  }
}
