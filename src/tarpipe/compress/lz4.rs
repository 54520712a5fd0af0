use crate::tarpipe::finish::Finish;
use lz4_flex::frame::FrameEncoder;
use std::io;
use std::io::Write;
use std::sync::{Arc, Mutex};

type Slot = Arc<Mutex<Option<io::Error>>>;

/// lz4 frame encoder that keeps errors of the wrapped writer intact.
///
/// `lz4_flex` rebuilds I/O errors into its own type and cannot carry a custom payload, so the
/// sink parks the original error and hands the encoder a bare one of the same kind. The parked
/// error is what the caller sees.
pub struct Lz4Encoder<W: Write> {
    encoder: FrameEncoder<Lz4Sink<W>>,
    slot: Slot,
}

pub struct Lz4Sink<W> {
    inner: W,
    slot: Slot,
}

impl<W> Lz4Sink<W> {
    fn park(&self, e: io::Error) -> io::Error {
        if e.get_ref().is_none() {
            return e;
        }
        let bare = io::Error::from(e.kind());
        if let Ok(mut slot) = self.slot.lock() {
            slot.get_or_insert(e);
        }
        bare
    }
}

impl<W: Write> Write for Lz4Sink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf).map_err(|e| self.park(e))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush().map_err(|e| self.park(e))
    }
}

impl<W: Write> Lz4Encoder<W> {
    pub fn new(inner: W) -> Self {
        let slot = Slot::default();
        Self {
            encoder: FrameEncoder::new(Lz4Sink {
                inner,
                slot: slot.clone(),
            }),
            slot,
        }
    }

    fn restore(&self, e: io::Error) -> io::Error {
        self.slot
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .unwrap_or(e)
    }
}

impl<W: Write> Write for Lz4Encoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.encoder.write(buf).map_err(|e| self.restore(e))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.encoder.flush().map_err(|e| self.restore(e))
    }
}

impl<W: Write> Finish<W> for Lz4Encoder<W> {
    fn finish(self) -> io::Result<W> {
        let slot = self.slot;
        match self.encoder.finish() {
            Ok(sink) => Ok(sink.inner),
            Err(e) => Err(slot
                .lock()
                .ok()
                .and_then(|mut slot| slot.take())
                .unwrap_or_else(|| io::Error::from(e))),
        }
    }
}
