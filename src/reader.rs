//! Dedicated reader thread.
//!
//! One thread owns the byte source and runs the decoder; consumers get
//! records through a [`FrameSink`] or an unbounded channel so a slow
//! consumer never holds up the serial link.

use std::any::Any;
use std::fmt::Debug;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};

use crate::{
    decoder::{DecoderConfig, DecoderStats, FrameDecoder, Outcome},
    frame::FrameError,
    record::Record,
    source::{ByteSource, SourceError},
};

/// Receives everything a reader thread decodes.
///
/// Only `on_record` is required. Rejections arrive through `on_rejected`,
/// which by default fans out to the specific callbacks.
pub trait FrameSink {
    fn on_record(&mut self, record: Record);

    /// `expected` is the checksum byte on the wire, `computed` is what the
    /// frame actually sums to.
    fn on_checksum_error(&mut self, _length: u16, _expected: u8, _computed: u8) {}

    fn on_header_error(&mut self) {}

    fn on_malformed_length(&mut self, _length: u16) {}

    fn on_short_read(&mut self, _expected: usize, _received: usize) {}

    fn on_too_many_parameters(&mut self, _count: usize, _max: usize) {}

    fn on_rejected(&mut self, error: FrameError) {
        match error {
            FrameError::ChecksumMismatch {
                length,
                computed,
                expected,
            } => self.on_checksum_error(length, expected, computed),
            FrameError::HeaderMismatch { .. } => self.on_header_error(),
            FrameError::MalformedLength { length } => self.on_malformed_length(length),
            FrameError::TooManyParameters { count, max } => {
                self.on_too_many_parameters(count, max)
            }
            FrameError::ShortRead { expected, received } => self.on_short_read(expected, received),
            FrameError::Truncated { expected, found } => self.on_short_read(expected, found),
        }
    }
}

impl<K: FrameSink + ?Sized> FrameSink for &mut K {
    fn on_record(&mut self, record: Record) {
        (**self).on_record(record)
    }

    fn on_checksum_error(&mut self, length: u16, expected: u8, computed: u8) {
        (**self).on_checksum_error(length, expected, computed)
    }

    fn on_header_error(&mut self) {
        (**self).on_header_error()
    }

    fn on_malformed_length(&mut self, length: u16) {
        (**self).on_malformed_length(length)
    }

    fn on_short_read(&mut self, expected: usize, received: usize) {
        (**self).on_short_read(expected, received)
    }

    fn on_too_many_parameters(&mut self, count: usize, max: usize) {
        (**self).on_too_many_parameters(count, max)
    }

    fn on_rejected(&mut self, error: FrameError) {
        (**self).on_rejected(error)
    }
}

/// What a channel consumer receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Record(Record),
    Rejected(FrameError),
}

/// Forwards every outcome into a crossbeam channel.
#[derive(Debug)]
pub struct ChannelSink {
    tx: Sender<Event>,
    disconnected: bool,
}

impl ChannelSink {
    pub fn new(tx: Sender<Event>) -> ChannelSink {
        ChannelSink {
            tx,
            disconnected: false,
        }
    }

    fn send(&mut self, event: Event) {
        if self.tx.send(event).is_err() && !self.disconnected {
            self.disconnected = true;
            log::warn!("frame receiver dropped, discarding decoded frames");
        }
    }
}

impl FrameSink for ChannelSink {
    fn on_record(&mut self, record: Record) {
        self.send(Event::Record(record));
    }

    fn on_rejected(&mut self, error: FrameError) {
        self.send(Event::Rejected(error));
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct ReaderConfig {
    pub thread_name: String,
    pub decoder: DecoderConfig,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        ReaderConfig {
            thread_name: "eb90-reader".to_string(),
            decoder: DecoderConfig::default(),
        }
    }
}

/// Asks a reader thread to stop from anywhere, without joining it.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Everything a finished reader thread hands back.
#[derive(Debug)]
pub struct ReaderExit<S: ByteSource> {
    /// The source, already closed.
    pub source: S,
    pub stats: DecoderStats,
    /// `Ok` when stopped on request, otherwise the source failure that
    /// ended the loop.
    pub result: Result<(), SourceError<S::Error>>,
}

/// Owns a thread that decodes frames from a byte source until stopped or
/// until the source fails.
///
/// Dropping a `FrameReader` stops the thread and waits for it.
pub struct FrameReader<S: ByteSource> {
    handle: Option<JoinHandle<ReaderExit<S>>>,
    stop: Arc<AtomicBool>,
}

impl<S> FrameReader<S>
where
    S: ByteSource + Send + 'static,
    S::Error: Debug + Send + 'static,
{
    pub fn spawn<K>(source: S, mut sink: K, config: ReaderConfig) -> io::Result<FrameReader<S>>
    where
        K: FrameSink + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || run(source, &mut sink, config.decoder, flag))?;

        Ok(FrameReader {
            handle: Some(handle),
            stop,
        })
    }

    /// Spawn a reader that delivers into an unbounded channel. The channel
    /// disconnects once the thread exits.
    pub fn channel(
        source: S,
        config: ReaderConfig,
    ) -> io::Result<(FrameReader<S>, Receiver<Event>)> {
        let (tx, rx) = channel::unbounded();
        let reader = FrameReader::spawn(source, ChannelSink::new(tx), config)?;
        Ok((reader, rx))
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stop))
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the thread to stop and wait for it to finish.
    pub fn stop(self) -> thread::Result<ReaderExit<S>> {
        self.stop.store(true, Ordering::Relaxed);
        self.join()
    }

    /// Wait for the thread to exit on its own, e.g. after the source closes.
    ///
    /// Fails with the thread's panic payload, or with a `&str` payload if
    /// the thread was already joined.
    pub fn join(mut self) -> thread::Result<ReaderExit<S>> {
        let Some(h) = self.handle.take() else {
            let payload: Box<dyn Any + Send> = Box::new("frame reader already joined");
            return Err(payload);
        };
        h.join()
    }
}

impl<S: ByteSource> Drop for FrameReader<S> {
    fn drop(&mut self) {
        if let Some(h) = self.handle.take() {
            self.stop.store(true, Ordering::Relaxed);
            if h.join().is_err() {
                log::error!("frame reader thread panicked");
            }
        }
    }
}

fn run<S, K>(
    source: S,
    sink: &mut K,
    config: DecoderConfig,
    stop: Arc<AtomicBool>,
) -> ReaderExit<S>
where
    S: ByteSource,
    S::Error: Debug,
    K: FrameSink,
{
    let mut decoder = FrameDecoder::with_config(source, config);
    decoder.set_cancel_flag(Arc::clone(&stop));
    log::info!("frame reader started");

    let result = loop {
        if stop.load(Ordering::Relaxed) {
            break Ok(());
        }
        match decoder.decode_next() {
            Ok(Outcome::Record(r)) => sink.on_record(r),
            Ok(Outcome::Rejected(e)) => sink.on_rejected(e),
            Ok(Outcome::Idle) | Ok(Outcome::Cancelled) => {}
            Err(SourceError::Closed) => {
                log::info!("byte source closed");
                break Err(SourceError::Closed);
            }
            Err(e) => {
                log::error!("{}", e);
                break Err(e);
            }
        }
    };

    let stats = decoder.stats();
    let mut source = decoder.into_source();
    source.close();
    log::info!(
        "frame reader stopped: {} records, {} rejected, {} noise bytes",
        stats.records,
        stats.rejected(),
        stats.noise_bytes
    );

    ReaderExit {
        source,
        stats,
        result,
    }
}
