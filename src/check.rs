use std::cmp::min;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use log::debug;

use crate::RunBoxError;

/// Compare two streams byte by byte, `true` when they hold exactly the same bytes
pub fn compare<A: Read, B: Read>(expected: A, actual: B) -> Result<bool, RunBoxError> {
  let mut expected = BufReader::new(expected);
  let mut actual = BufReader::new(actual);
  let mut offset = 0usize;

  loop {
    let consumed = {
      let left = expected.fill_buf()?;
      let right = actual.fill_buf()?;
      if left.is_empty() || right.is_empty() {
        if left.len() != right.len() {
          debug!("Streams differ in length after {} bytes", offset);
        }
        return Ok(left.is_empty() && right.is_empty());
      }
      let len = min(left.len(), right.len());
      if let Some(index) = left[..len].iter().zip(&right[..len]).position(|(a, b)| a != b) {
        debug!("Streams differ at byte {}", offset + index);
        return Ok(false);
      }
      len
    };
    expected.consume(consumed);
    actual.consume(consumed);
    offset += consumed;
  }
}

/// Compare two files
pub fn compare_files<P: AsRef<Path>, Q: AsRef<Path>>(expected: P, actual: Q) -> Result<bool, RunBoxError> {
  compare(File::open(expected)?, File::open(actual)?)
}

#[cfg(test)]
mod tests {
  use std::io::Cursor;

  use super::*;

  /// Yields at most `step` bytes per read
  struct Trickle<'a> {
    data: &'a [u8],
    step: usize,
  }

  impl Read for Trickle<'_> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
      let len = min(min(self.step, buf.len()), self.data.len());
      buf[..len].copy_from_slice(&self.data[..len]);
      self.data = &self.data[len..];
      Ok(len)
    }
  }

  #[test]
  fn it_should_compare_exactly() {
    assert!(compare(Cursor::new("3\n"), Cursor::new("3\n")).unwrap());
    assert!(!compare(Cursor::new("3\n"), Cursor::new("3")).unwrap());
    assert!(!compare(Cursor::new("3 4"), Cursor::new("3  4")).unwrap());
    assert!(compare(Cursor::new(""), Cursor::new("")).unwrap());
    assert!(!compare(Cursor::new(""), Cursor::new("x")).unwrap());
  }

  #[test]
  fn chunking_does_not_matter() {
    let text = "hello world\n".repeat(1000);
    let left = Trickle { data: text.as_bytes(), step: 7 };
    let right = Trickle { data: text.as_bytes(), step: 4096 };
    assert!(compare(left, right).unwrap());

    let mut other = text.clone().into_bytes();
    other[9000] = b'!';
    let left = Trickle { data: text.as_bytes(), step: 3 };
    let right = Trickle { data: &other, step: 1000 };
    assert!(!compare(left, right).unwrap());
  }
}
