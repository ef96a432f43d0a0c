//! Pluggable input handling.
//!
//! Renderers that virtualise their filesystem can supply an
//! [`InputHandler`]; everyone else gets buffered [`std::fs::File`] access
//! through [`DefaultInputHandler`].

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

/// Factory for open file sessions.
pub trait InputHandler: Send + Sync {
    /// Opens the file at `path` for reading.
    fn open(&self, path: &Path) -> io::Result<Box<dyn InputSource>>;
}

/// One open file session. Sessions are used behind a per-reader lock and
/// need not be thread-safe themselves.
pub trait InputSource: Send {
    /// Seeks to an absolute position.
    fn seek(&mut self, pos: u64) -> io::Result<()>;

    /// Reads exactly `buf.len()` bytes.
    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()>;
}

/// The stock handler: buffered reads from the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultInputHandler;

struct DefaultSource {
    file: BufReader<File>,
}

impl InputHandler for DefaultInputHandler {
    fn open(&self, path: &Path) -> io::Result<Box<dyn InputSource>> {
        let file = File::open(path)?;
        Ok(Box::new(DefaultSource { file: BufReader::with_capacity(crate::format::BLOCK_SIZE, file) }))
    }
}

impl InputSource for DefaultSource {
    fn seek(&mut self, pos: u64) -> io::Result<()> {
        // seek_relative keeps the buffer when the target is already buffered
        let cur = self.file.stream_position()?;
        if pos != cur {
            self.file.seek_relative(pos as i64 - cur as i64)?;
        }
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_handler_reads_and_seeks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        std::fs::File::create(&path).unwrap().write_all(&[1u8, 2, 3, 4, 5, 6, 7, 8]).unwrap();

        let handler = DefaultInputHandler;
        let mut src = handler.open(&path).unwrap();
        let mut buf = [0u8; 2];
        src.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2]);
        src.seek(6).unwrap();
        src.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [7, 8]);
        src.seek(0).unwrap();
        src.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [1, 2]);
    }

    #[test]
    fn missing_file_errors() {
        let handler = DefaultInputHandler;
        assert!(handler.open(Path::new("/no/such/ptex/file")).is_err());
    }
}
