pub mod cancel;
pub mod pipe;

pub use cancel::CancellationToken;
pub use pipe::{pipe, PipeReader, PipeWriter};

use crate::tarpipe::result_error::error::Error;
use crate::tarpipe::result_error::result::Result;
use std::io::{self, Read, Write};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("{0}")]
struct Interrupted(String);

#[derive(Debug, Error)]
#[error("pipeline cancelled")]
struct Cancelled;

#[derive(Debug, Error)]
#[error("{0}")]
struct Panicked(String);

/// An error meaning "the neighbouring stage went away", not a failure of its own.
pub fn interruption<S: Into<String>>(reason: S) -> io::Error {
    io::Error::other(Interrupted(reason.into()))
}

pub fn broken_pipe<S: Into<String>>(reason: S) -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, Interrupted(reason.into()))
}

pub fn cancelled() -> io::Error {
    io::Error::other(Cancelled)
}

/// A stage thread that panicked. Usually the panic follows another stage's failure, so it ranks
/// with interruptions.
pub fn panicked<S: Into<String>>(reason: S) -> io::Error {
    io::Error::other(Panicked(reason.into()))
}

pub fn is_panic(e: &io::Error) -> bool {
    e.get_ref().is_some_and(|inner| inner.is::<Panicked>())
}

pub fn is_cancellation(e: &io::Error) -> bool {
    e.get_ref().is_some_and(|inner| inner.is::<Cancelled>())
}

pub fn is_interruption(e: &io::Error) -> bool {
    e.get_ref()
        .is_some_and(|inner| {
            inner.is::<Interrupted>() || inner.is::<Cancelled>() || inner.is::<Panicked>()
        })
}

/// `io::copy` with an explicit buffer size.
pub fn copy_buffered<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
) -> io::Result<u64> {
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}

/// Copies decoded bytes, reporting read-side failures as corruption and write-side failures as
/// I/O errors.
pub fn copy_decoded<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    writer: &mut W,
    buffer_size: usize,
) -> Result<u64> {
    let mut buf = vec![0u8; buffer_size.max(1)];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::corruption_from_io(e)),
        };
        writer.write_all(&buf[..n])?;
        total += n as u64;
    }
}

/// Write adapter that counts the bytes passing through it.
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Read adapter that counts the bytes passing through it.
pub struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R: Read> CountingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tarpipe::result_error::error::ErrorKind;
    use std::io::Cursor;

    struct FailingReader;

    impl Read for FailingReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::InvalidData, "bad block"))
        }
    }

    #[test]
    fn test_copy_buffered_with_one_byte_buffer() {
        let data = b"Hello, World!".to_vec();
        let mut out = Vec::new();
        let n = copy_buffered(&mut Cursor::new(&data), &mut out, 1).unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(out, data);
    }

    #[test]
    fn test_copy_decoded_reports_read_failure_as_corruption() {
        let mut out = Vec::new();
        let err = copy_decoded(&mut FailingReader, &mut out, 8).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Corruption);
    }

    #[test]
    fn test_counting_adapters() {
        let mut reader = CountingReader::new(Cursor::new(vec![7u8; 100]));
        let mut writer = CountingWriter::new(Vec::new());
        copy_buffered(&mut reader, &mut writer, 16).unwrap();
        assert_eq!(reader.count(), 100);
        assert_eq!(writer.count(), 100);
        assert_eq!(writer.into_inner().len(), 100);
    }

    #[test]
    fn test_interruption_markers() {
        assert!(is_interruption(&interruption("gone")));
        assert!(is_interruption(&broken_pipe("gone")));
        assert!(is_interruption(&cancelled()));
        assert!(is_cancellation(&cancelled()));
        assert!(!is_cancellation(&interruption("gone")));
        assert!(!is_interruption(&io::Error::other("plain")));
    }
}
