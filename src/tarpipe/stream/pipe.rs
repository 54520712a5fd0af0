//! Bounded in-memory byte stream connecting two adjacent pipeline stages.
//!
//! Bytes travel as chunks over a `sync_channel`, so a writer blocks once `depth` chunks are
//! waiting and a reader blocks while nothing is queued. A stream only ends cleanly through
//! [`PipeWriter::close`]; a writer dropped without closing ends the stream with an error.

use crate::tarpipe::stream::{broken_pipe, cancelled, interruption, CancellationToken};
use std::io::{self, Read, Write};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, SyncSender};
use std::time::Duration;

/// How often a blocked reader looks at the cancellation token.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug)]
enum Message {
    Data(Vec<u8>),
    End,
    Abort(String),
}

/// Creates a connected writer/reader pair.
///
/// `chunk_size` is the largest chunk handed over at once and `depth` the number of chunks that
/// may be queued before the writer blocks. Both are clamped to at least one.
pub fn pipe(chunk_size: usize, depth: usize, token: CancellationToken) -> (PipeWriter, PipeReader) {
    let chunk_size = chunk_size.max(1);
    let (tx, rx) = sync_channel(depth.max(1));
    (
        PipeWriter {
            tx: Some(tx),
            buf: Vec::with_capacity(chunk_size),
            chunk_size,
            token: token.clone(),
            closed: false,
        },
        PipeReader {
            rx,
            current: Vec::new(),
            pos: 0,
            state: ReaderState::Open,
            token,
        },
    )
}

pub struct PipeWriter {
    tx: Option<SyncSender<Message>>,
    buf: Vec<u8>,
    chunk_size: usize,
    token: CancellationToken,
    closed: bool,
}

impl PipeWriter {
    fn send(&mut self, message: Message) -> io::Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| interruption("stream already closed"))?;
        tx.send(message)
            .map_err(|_| broken_pipe("downstream stage stopped reading"))
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.token.check()?;
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(self.chunk_size));
        self.send(Message::Data(chunk))
    }

    /// Flushes buffered bytes and marks the end of the stream.
    pub fn close(mut self) -> io::Result<()> {
        self.send_buffered()?;
        self.send(Message::End)?;
        self.closed = true;
        self.tx = None;
        Ok(())
    }
}

impl Write for PipeWriter {
    /// Always takes the whole slice, sending every chunk that fills up on the way.
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        self.token.check()?;
        let mut rest = data;
        while !rest.is_empty() {
            let room = self.chunk_size - self.buf.len();
            let (head, tail) = rest.split_at(room.min(rest.len()));
            self.buf.extend_from_slice(head);
            if self.buf.len() >= self.chunk_size {
                self.send_buffered()?;
            }
            rest = tail;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Some(tx) = self.tx.take() {
            // Best effort; a full queue still ends in a disconnect the reader treats as abort.
            let _ = tx.try_send(Message::Abort(
                "upstream stage stopped before finishing".into(),
            ));
        }
    }
}

#[derive(Debug)]
enum ReaderState {
    Open,
    Finished,
    Failed(String),
}

pub struct PipeReader {
    rx: Receiver<Message>,
    current: Vec<u8>,
    pos: usize,
    state: ReaderState,
    token: CancellationToken,
}

impl PipeReader {
    fn next_chunk(&mut self) -> io::Result<bool> {
        loop {
            match &self.state {
                ReaderState::Finished => return Ok(false),
                ReaderState::Failed(reason) => return Err(interruption(reason.clone())),
                ReaderState::Open => {}
            }
            match self.rx.recv_timeout(CANCEL_POLL_INTERVAL) {
                Ok(Message::Data(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    self.current = chunk;
                    self.pos = 0;
                    return Ok(true);
                }
                Ok(Message::End) => self.state = ReaderState::Finished,
                Ok(Message::Abort(reason)) => self.state = ReaderState::Failed(reason),
                Err(RecvTimeoutError::Timeout) => {
                    if self.token.is_cancelled() {
                        return Err(cancelled());
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    self.state =
                        ReaderState::Failed("upstream stage stopped before finishing".into())
                }
            }
        }
    }
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.pos >= self.current.len() && !self.next_chunk()? {
            return Ok(0);
        }
        let available = &self.current[self.pos..];
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tarpipe::stream::{is_cancellation, is_interruption};
    use std::thread;

    #[test]
    fn test_bytes_arrive_in_order_with_tiny_buffers() {
        let (mut writer, mut reader) = pipe(3, 1, CancellationToken::new());
        let producer = thread::spawn(move || {
            for i in 0..200u8 {
                writer.write_all(&[i, i, i, i, i]).unwrap();
            }
            writer.close().unwrap();
        });

        let mut received = Vec::new();
        reader.read_to_end(&mut received).unwrap();
        producer.join().unwrap();

        let expected: Vec<u8> = (0..200u8).flat_map(|i| [i; 5]).collect();
        assert_eq!(received, expected);
    }

    #[test]
    fn test_close_without_data_is_empty_stream() {
        let (writer, mut reader) = pipe(16, 2, CancellationToken::new());
        writer.close().unwrap();
        let mut received = Vec::new();
        assert_eq!(reader.read_to_end(&mut received).unwrap(), 0);
    }

    #[test]
    fn test_dropped_writer_is_not_a_clean_end() {
        let (mut writer, mut reader) = pipe(16, 2, CancellationToken::new());
        writer.write_all(b"partial").unwrap();
        drop(writer);

        let mut received = Vec::new();
        let err = reader.read_to_end(&mut received).unwrap_err();
        assert!(is_interruption(&err));
    }

    #[test]
    fn test_single_write_larger_than_chunk_is_taken_whole() {
        let (mut writer, mut reader) = pipe(4, 8, CancellationToken::new());
        let data: Vec<u8> = (0..23u8).collect();
        assert_eq!(writer.write(&data).unwrap(), data.len());
        writer.close().unwrap();

        let mut received = Vec::new();
        reader.read_to_end(&mut received).unwrap();
        assert_eq!(received, data);
    }

    #[test]
    fn test_writer_fails_when_reader_is_gone() {
        let (mut writer, reader) = pipe(4, 1, CancellationToken::new());
        drop(reader);
        let err = writer.write_all(&[0u8; 64]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(is_interruption(&err));
    }

    #[test]
    fn test_blocked_reader_observes_cancellation() {
        let token = CancellationToken::new();
        let (writer, mut reader) = pipe(16, 2, token.clone());
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            token.cancel();
        });

        let err = reader.read(&mut [0u8; 8]).unwrap_err();
        assert!(is_cancellation(&err));
        canceller.join().unwrap();
        drop(writer);
    }
}
