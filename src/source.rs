use alloc::collections::VecDeque;
use core::convert::Infallible;

use embedded_hal::delay::DelayNs;
use embedded_hal_nb::serial::{self, Error as _};
use thiserror::Error;

/// Conditions that end a read loop. Anything else a source runs into
/// (timeouts, short reads) is reported through the byte count.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SourceError<E> {
    #[error("byte source closed")]
    Closed,
    #[error("byte source i/o error: {0:?}")]
    Io(E),
}

/// An ordered, possibly blocking supplier of bytes such as a serial port.
pub trait ByteSource {
    type Error;

    /// Read up to `buf.len()` bytes, blocking no longer than the source's
    /// own timeout.
    ///
    /// `Ok(0)` means the timeout elapsed with nothing available. Fewer bytes
    /// than requested is a normal result.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SourceError<Self::Error>>;

    /// Release the underlying device. Called once when a reader loop exits.
    fn close(&mut self) {}
}

impl<S: ByteSource + ?Sized> ByteSource for &mut S {
    type Error = S::Error;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SourceError<Self::Error>> {
        (**self).read(buf)
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Adapts a blocking [`embedded_io::Read`]. A zero-length read from the
/// inner reader is end of stream.
#[derive(Debug)]
pub struct IoSource<R> {
    inner: R,
}

impl<R: embedded_io::Read> IoSource<R> {
    pub fn new(inner: R) -> IoSource<R> {
        IoSource { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: embedded_io::Read> ByteSource for IoSource<R> {
    type Error = R::Error;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SourceError<Self::Error>> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.inner.read(buf) {
            Ok(0) => Err(SourceError::Closed),
            Ok(n) => Ok(n),
            Err(e) => Err(SourceError::Io(e)),
        }
    }
}

/// How long an [`NbSource`] waits for a byte before reporting a timeout.
pub const DEFAULT_TIMEOUT_US: u32 = 100_000;

/// Sleep between empty polls of an [`NbSource`].
pub const POLL_INTERVAL_US: u32 = 10;

/// Adapts a single-byte, non-blocking serial receiver.
///
/// `WouldBlock` means no byte is waiting, and the source sleeps on `delay`
/// for [`POLL_INTERVAL_US`] before polling again. With nothing read after
/// `timeout_us` of sleeping, `read` returns `Ok(0)`. Once at least one byte
/// has been read, the first empty poll ends the read, and the next call
/// waits out a full timeout again.
#[derive(Debug)]
pub struct NbSource<Rx: serial::Read, D> {
    rx: Rx,
    delay: D,
    timeout_us: u32,
}

impl<Rx: serial::Read, D: DelayNs> NbSource<Rx, D> {
    pub fn new(rx: Rx, delay: D) -> NbSource<Rx, D> {
        NbSource::with_timeout(rx, delay, DEFAULT_TIMEOUT_US)
    }

    pub fn with_timeout(rx: Rx, delay: D, timeout_us: u32) -> NbSource<Rx, D> {
        NbSource {
            rx,
            delay,
            timeout_us,
        }
    }

    pub fn into_inner(self) -> (Rx, D) {
        (self.rx, self.delay)
    }
}

impl<Rx: serial::Read, D: DelayNs> ByteSource for NbSource<Rx, D> {
    type Error = Rx::Error;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SourceError<Self::Error>> {
        let mut n = 0;
        let mut waited: u32 = 0;
        while n < buf.len() {
            match self.rx.read() {
                Ok(b) => {
                    buf[n] = b;
                    n += 1;
                }
                Err(nb::Error::WouldBlock) => {
                    if n > 0 || waited >= self.timeout_us {
                        break;
                    }
                    self.delay.delay_us(POLL_INTERVAL_US);
                    waited = waited.saturating_add(POLL_INTERVAL_US);
                }
                Err(nb::Error::Other(e)) => {
                    log::debug!("serial receive error: {:?}", e.kind());
                    return Err(SourceError::Io(e));
                }
            }
        }
        Ok(n)
    }
}

/// Adapts any [`std::io::Read`] with a read timeout, e.g. an open serial port.
///
/// `TimedOut` and `WouldBlock` become `Ok(0)`, `Interrupted` is retried and
/// end of file is [`SourceError::Closed`].
#[cfg(feature = "std")]
#[derive(Debug)]
pub struct StdSource<R> {
    inner: R,
}

#[cfg(feature = "std")]
impl<R: std::io::Read> StdSource<R> {
    pub fn new(inner: R) -> StdSource<R> {
        StdSource { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

#[cfg(feature = "std")]
impl<R: std::io::Read> ByteSource for StdSource<R> {
    type Error = std::io::Error;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SourceError<Self::Error>> {
        use std::io::ErrorKind;

        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            match self.inner.read(buf) {
                Ok(0) => return Err(SourceError::Closed),
                Ok(n) => return Ok(n),
                Err(e) => match e.kind() {
                    ErrorKind::TimedOut | ErrorKind::WouldBlock => return Ok(0),
                    ErrorKind::Interrupted => continue,
                    _ => return Err(SourceError::Io(e)),
                },
            }
        }
    }
}

#[derive(Debug, Clone)]
enum Step {
    Bytes(VecDeque<u8>),
    Timeout,
    Close,
}

/// An in-memory byte source that replays a script of byte chunks, timeouts
/// and a final close. Running off the end of the script closes the source.
#[derive(Debug, Clone, Default)]
pub struct ScriptedSource {
    steps: VecDeque<Step>,
    max_chunk: Option<usize>,
    closed: bool,
}

impl ScriptedSource {
    pub fn new() -> ScriptedSource {
        ScriptedSource::default()
    }

    pub fn from_bytes(data: impl AsRef<[u8]>) -> ScriptedSource {
        let mut s = ScriptedSource::new();
        s.push_bytes(data);
        s
    }

    /// Limit every read to at most `max` bytes to exercise short reads.
    pub fn with_max_chunk(mut self, max: usize) -> ScriptedSource {
        self.max_chunk = Some(max.max(1));
        self
    }

    pub fn push_bytes(&mut self, data: impl AsRef<[u8]>) -> &mut Self {
        let data = data.as_ref();
        if !data.is_empty() {
            self.steps.push_back(Step::Bytes(data.iter().copied().collect()));
        }
        self
    }

    /// Queue one read that returns no bytes.
    pub fn push_timeout(&mut self) -> &mut Self {
        self.steps.push_back(Step::Timeout);
        self
    }

    pub fn push_close(&mut self) -> &mut Self {
        self.steps.push_back(Step::Close);
        self
    }

    /// Bytes still queued.
    pub fn remaining(&self) -> usize {
        self.steps
            .iter()
            .map(|s| match s {
                Step::Bytes(b) => b.len(),
                _ => 0,
            })
            .sum()
    }

    /// Whether [`ByteSource::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl ByteSource for ScriptedSource {
    type Error = Infallible;

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SourceError<Self::Error>> {
        if self.closed {
            return Err(SourceError::Closed);
        }
        match self.steps.front_mut() {
            None | Some(Step::Close) => Err(SourceError::Closed),
            Some(Step::Timeout) => {
                self.steps.pop_front();
                Ok(0)
            }
            Some(Step::Bytes(q)) => {
                let limit = self.max_chunk.unwrap_or(usize::MAX);
                let n = buf.len().min(q.len()).min(limit);
                for (slot, b) in buf.iter_mut().zip(q.drain(..n)) {
                    *slot = b;
                }
                if q.is_empty() {
                    self.steps.pop_front();
                }
                Ok(n)
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}

#[derive(Debug)]
pub struct ErrorShim<T: serial::Error>(pub T);

impl<T: serial::Error> embedded_io::Error for ErrorShim<T> {
    fn kind(&self) -> embedded_io::ErrorKind {
        use embedded_hal_nb::serial::ErrorKind::*;
        match self.0.kind() {
            Overrun => embedded_io::ErrorKind::OutOfMemory,
            FrameFormat => embedded_io::ErrorKind::InvalidData,
            Parity => embedded_io::ErrorKind::InvalidData,
            _ => embedded_io::ErrorKind::Other,
        }
    }
}

impl<T: serial::Error> From<T> for ErrorShim<T> {
    fn from(value: T) -> Self {
        ErrorShim(value)
    }
}

/// Drives a single-byte serial transmitter as an [`embedded_io::Write`], so
/// frames can be streamed straight out of a UART with
/// [`write_frame`](crate::write_frame).
#[derive(Debug)]
pub struct NbWriter<Tx: serial::Write> {
    tx: Tx,
}

impl<Tx: serial::Write> NbWriter<Tx> {
    pub fn new(tx: Tx) -> NbWriter<Tx> {
        NbWriter { tx }
    }

    pub fn into_inner(self) -> Tx {
        self.tx
    }
}

impl<Tx: serial::Write> embedded_io::ErrorType for NbWriter<Tx> {
    type Error = ErrorShim<Tx::Error>;
}

impl<Tx: serial::Write> embedded_io::Write for NbWriter<Tx> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        for b in buf {
            nb::block!(self.tx.write(*b)).map_err(ErrorShim)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        nb::block!(self.tx.flush()).map_err(ErrorShim)
    }
}
