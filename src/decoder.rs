use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    checksum::Checksum,
    frame::{
        FrameError, HEADER, LENGTH_SIZE, MAX_PARAMETERS, PARAMETER_SIZE, TIMESTAMP_SIZE,
        TRAILER_SIZE, param_count_for,
    },
    record::Record,
    source::{ByteSource, SourceError},
};

/// Tuning for [`FrameDecoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(default)
)]
pub struct DecoderConfig {
    /// Empty reads tolerated in the middle of a frame before it is dropped
    /// as a short read. Zero drops the frame on the first timeout.
    ///
    /// Each empty read is one full timeout of the source, not one register
    /// poll: an [`NbSource`](crate::NbSource) waits its `timeout_us` and a
    /// `StdSource` its port's read timeout before returning nothing. Slow
    /// bytes inside that window never count here.
    pub mid_frame_idle_polls: u32,
    /// Frames announcing more parameters than this are rejected before any
    /// of their body is read.
    pub max_parameters: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        DecoderConfig {
            mid_frame_idle_polls: 0,
            max_parameters: MAX_PARAMETERS,
        }
    }
}

/// Result of one [`FrameDecoder::decode_next`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Record(Record),
    /// The frame was dropped; scanning resumes with the next byte.
    Rejected(FrameError),
    /// The source timed out while hunting for a header.
    Idle,
    /// The cancel flag was raised; any partially read frame was abandoned.
    Cancelled,
}

/// Running totals kept by a decoder.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DecoderStats {
    pub records: u64,
    pub header_mismatches: u64,
    pub checksum_mismatches: u64,
    pub malformed_lengths: u64,
    pub oversized: u64,
    pub short_reads: u64,
    /// Bytes skipped while hunting for the first header byte.
    pub noise_bytes: u64,
}

impl DecoderStats {
    pub fn rejected(&self) -> u64 {
        self.header_mismatches
            + self.checksum_mismatches
            + self.malformed_lengths
            + self.oversized
            + self.short_reads
    }
}

/// Pulls bytes from a [`ByteSource`] and turns them into records.
///
/// The decoder never assumes it is aligned with the stream. Each call hunts
/// for `0xEB`, checks for `0x90`, then reads the length-prefixed body and
/// validates its checksum. Every frame-level failure is reported as
/// [`Outcome::Rejected`] and the next call starts hunting again from the
/// byte after the last one consumed.
#[derive(Debug)]
pub struct FrameDecoder<S> {
    source: S,
    config: DecoderConfig,
    stats: DecoderStats,
    params: Vec<u8>,
    cancel: Option<Arc<AtomicBool>>,
}

impl<S: ByteSource> FrameDecoder<S> {
    pub fn new(source: S) -> FrameDecoder<S> {
        FrameDecoder::with_config(source, DecoderConfig::default())
    }

    pub fn with_config(source: S, config: DecoderConfig) -> FrameDecoder<S> {
        FrameDecoder {
            source,
            config,
            stats: DecoderStats::default(),
            params: Vec::new(),
            cancel: None,
        }
    }

    /// Abandon the frame in progress once `flag` is raised.
    pub fn set_cancel_flag(&mut self, flag: Arc<AtomicBool>) {
        self.cancel = Some(flag);
    }

    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    pub fn stats(&self) -> DecoderStats {
        self.stats
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    fn cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|c| c.load(Ordering::Relaxed))
    }

    /// Decode the next frame from the source.
    ///
    /// Only source failures are returned as `Err`; they end the stream.
    pub fn decode_next(&mut self) -> Result<Outcome, SourceError<S::Error>> {
        let mut b = [0; 1];
        loop {
            if self.source.read(&mut b)? == 0 {
                return Ok(Outcome::Idle);
            }
            if b[0] == HEADER[0] {
                break;
            }
            self.stats.noise_bytes += 1;
            log::trace!("discarding {:#04x}", b[0]);
            if self.cancelled() {
                return Ok(Outcome::Cancelled);
            }
        }

        // The byte after 0xEB is consumed whatever it is
        if let Some(o) = self.fill(&mut b)? {
            return Ok(o);
        }
        if b[0] != HEADER[1] {
            self.stats.header_mismatches += 1;
            return Ok(self.reject(FrameError::HeaderMismatch { found: b[0] }));
        }

        let mut length = [0; LENGTH_SIZE];
        if let Some(o) = self.fill(&mut length)? {
            return Ok(o);
        }
        let length = u16::from_le_bytes(length);
        let count = match param_count_for(length) {
            Ok(c) => c,
            Err(e) => {
                self.stats.malformed_lengths += 1;
                return Ok(self.reject(e));
            }
        };
        if count > self.config.max_parameters {
            self.stats.oversized += 1;
            return Ok(self.reject(FrameError::TooManyParameters {
                count,
                max: self.config.max_parameters,
            }));
        }

        let mut ts = [0; TIMESTAMP_SIZE];
        if let Some(o) = self.fill(&mut ts)? {
            return Ok(o);
        }

        let mut params = core::mem::take(&mut self.params);
        params.clear();
        params.resize(count * PARAMETER_SIZE, 0);
        let filled = self.fill(&mut params);
        self.params = params;
        if let Some(o) = filled? {
            return Ok(o);
        }

        let mut trailer = [0; TRAILER_SIZE];
        if let Some(o) = self.fill(&mut trailer)? {
            return Ok(o);
        }
        let [message_type, status, loop_count, expected] = trailer;

        let mut d = Checksum::new(length, message_type, status, loop_count);
        d.update(&self.params);
        d.update(&ts);
        let computed = d.finalize();
        if computed != expected {
            self.stats.checksum_mismatches += 1;
            return Ok(self.reject(FrameError::ChecksumMismatch {
                length,
                computed,
                expected,
            }));
        }

        let parameters = self
            .params
            .chunks_exact(PARAMETER_SIZE)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let record = Record {
            timestamp: f64::from_le_bytes(ts),
            parameters,
            message_type,
            status,
            loop_count,
        };
        self.stats.records += 1;
        log::debug!(
            "record: {} parameters, type {}, loop {}",
            count,
            message_type,
            loop_count
        );
        Ok(Outcome::Record(record))
    }

    fn reject(&self, e: FrameError) -> Outcome {
        match e {
            FrameError::ChecksumMismatch { .. } => log::warn!("{}", e),
            _ => log::debug!("{}", e),
        }
        Outcome::Rejected(e)
    }

    /// Read until `buf` is full. Returns the outcome that ends the current
    /// frame if the source stalls or the decoder is cancelled first.
    fn fill(&mut self, buf: &mut [u8]) -> Result<Option<Outcome>, SourceError<S::Error>> {
        let mut n = 0;
        let mut idle = 0;
        while n < buf.len() {
            let got = self.source.read(&mut buf[n..])?;
            n += got;
            if n == buf.len() {
                break;
            }
            if self.cancelled() {
                log::debug!("cancelled with {} of {} bytes read", n, buf.len());
                return Ok(Some(Outcome::Cancelled));
            }
            if got > 0 {
                idle = 0;
                continue;
            }
            idle += 1;
            if idle > self.config.mid_frame_idle_polls {
                self.stats.short_reads += 1;
                return Ok(Some(self.reject(FrameError::ShortRead {
                    expected: buf.len(),
                    received: n,
                })));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::ScriptedSource;
    use alloc::vec;

    fn frame(r: &Record) -> Vec<u8> {
        r.to_frame().unwrap()
    }

    fn empty() -> Record {
        Record::new(0.0, vec![], 1, 2, 1)
    }

    /// Everything the decoder produces until the source closes.
    fn drain<S: ByteSource>(dec: &mut FrameDecoder<S>) -> Vec<Outcome> {
        let mut out = Vec::new();
        while let Ok(o) = dec.decode_next() {
            out.push(o);
        }
        out
    }

    #[test]
    fn decodes_empty_record() {
        let mut dec = FrameDecoder::new(ScriptedSource::from_bytes(frame(&empty())));
        assert_eq!(dec.decode_next(), Ok(Outcome::Record(empty())));
        assert_eq!(dec.decode_next(), Err(SourceError::Closed));
        assert_eq!(dec.stats().records, 1);
    }

    #[test]
    fn decodes_sixty_parameters_in_small_chunks() {
        let params: Vec<f32> = (1..=60).map(|i| i as f32).collect();
        let r = Record::new(0.0, params, 1, 2, 1);
        let src = ScriptedSource::from_bytes(frame(&r)).with_max_chunk(3);
        let mut dec = FrameDecoder::new(src);
        assert_eq!(drain(&mut dec), [Outcome::Record(r)]);
    }

    #[test]
    fn skips_noise_around_frame() {
        let mut src = ScriptedSource::from_bytes([0x00u8, 0x90, 0x55, 0xFF]);
        src.push_bytes(frame(&empty())).push_bytes([0x12u8, 0x34, 0x90]);
        let mut dec = FrameDecoder::new(src);
        assert_eq!(drain(&mut dec), [Outcome::Record(empty())]);
        assert_eq!(dec.stats().noise_bytes, 7);
    }

    #[test]
    fn header_mismatch_then_resync() {
        let mut src = ScriptedSource::from_bytes([0x01u8, 0xEB, 0x00]);
        src.push_bytes(frame(&empty()));
        let mut dec = FrameDecoder::new(src);
        assert_eq!(
            drain(&mut dec),
            [
                Outcome::Rejected(FrameError::HeaderMismatch { found: 0x00 }),
                Outcome::Record(empty())
            ]
        );
        assert_eq!(dec.stats().header_mismatches, 1);
    }

    #[test]
    fn mismatched_byte_is_not_reused_as_header_start() {
        // EB EB 90 ...: the second EB is the mismatch, so the 90 after it
        // is noise and the rest of the frame never lines up
        let mut src = ScriptedSource::from_bytes([0xEBu8]);
        src.push_bytes(frame(&empty()));
        let mut dec = FrameDecoder::new(src);
        assert_eq!(
            drain(&mut dec),
            [Outcome::Rejected(FrameError::HeaderMismatch { found: 0xEB })]
        );
    }

    #[test]
    fn checksum_mismatch_is_recoverable() {
        let mut bad = frame(&empty());
        let last = bad.len() - 1;
        bad[last] = 0x11;
        let mut src = ScriptedSource::from_bytes(bad);
        src.push_bytes(frame(&empty()));
        let mut dec = FrameDecoder::new(src);
        assert_eq!(
            drain(&mut dec),
            [
                Outcome::Rejected(FrameError::ChecksumMismatch {
                    length: 12,
                    computed: 0x10,
                    expected: 0x11
                }),
                Outcome::Record(empty())
            ]
        );
        assert_eq!(dec.stats().checksum_mismatches, 1);
    }

    #[test]
    fn malformed_lengths_are_rejected() {
        let mut src = ScriptedSource::from_bytes([0xEBu8, 0x90, 8, 0]);
        src.push_bytes([0xEBu8, 0x90, 13, 0]);
        src.push_bytes(frame(&empty()));
        let mut dec = FrameDecoder::new(src);
        assert_eq!(
            drain(&mut dec),
            [
                Outcome::Rejected(FrameError::MalformedLength { length: 8 }),
                Outcome::Rejected(FrameError::MalformedLength { length: 13 }),
                Outcome::Record(empty())
            ]
        );
        assert_eq!(dec.stats().malformed_lengths, 2);
    }

    #[test]
    fn short_read_after_length() {
        let mut src = ScriptedSource::from_bytes([0xEBu8, 0x90, 12, 0]);
        src.push_timeout();
        let mut dec = FrameDecoder::new(src);
        assert_eq!(
            dec.decode_next(),
            Ok(Outcome::Rejected(FrameError::ShortRead {
                expected: 8,
                received: 0
            }))
        );
        assert_eq!(dec.decode_next(), Err(SourceError::Closed));
        assert_eq!(dec.stats().short_reads, 1);
    }

    #[test]
    fn short_read_discards_partial_frame() {
        let f = frame(&Record::new(3.0, vec![1.0, 2.0], 0, 0, 9));
        let mut src = ScriptedSource::from_bytes(&f[..10]);
        src.push_timeout().push_bytes(frame(&empty()));
        let mut dec = FrameDecoder::new(src);
        assert_eq!(
            drain(&mut dec),
            [
                Outcome::Rejected(FrameError::ShortRead {
                    expected: 8,
                    received: 6
                }),
                Outcome::Record(empty())
            ]
        );
    }

    #[test]
    fn tolerates_configured_mid_frame_timeouts() {
        let f = frame(&empty());
        let mut src = ScriptedSource::from_bytes(&f[..5]);
        src.push_timeout().push_timeout().push_bytes(&f[5..]);
        let config = DecoderConfig {
            mid_frame_idle_polls: 2,
            ..DecoderConfig::default()
        };
        let mut dec = FrameDecoder::with_config(src, config);
        assert_eq!(dec.decode_next(), Ok(Outcome::Record(empty())));
    }

    #[test]
    fn idle_while_hunting() {
        let mut src = ScriptedSource::new();
        src.push_timeout().push_bytes(frame(&empty()));
        let mut dec = FrameDecoder::new(src);
        assert_eq!(dec.decode_next(), Ok(Outcome::Idle));
        assert_eq!(dec.decode_next(), Ok(Outcome::Record(empty())));
    }

    #[test]
    fn rejects_frames_over_parameter_limit() {
        let big = Record::new(0.0, vec![1.0; 5], 0, 0, 0);
        let mut src = ScriptedSource::from_bytes(frame(&big));
        src.push_bytes(frame(&empty()));
        let config = DecoderConfig {
            max_parameters: 4,
            ..DecoderConfig::default()
        };
        let mut dec = FrameDecoder::with_config(src, config);
        assert_eq!(
            dec.decode_next(),
            Ok(Outcome::Rejected(FrameError::TooManyParameters { count: 5, max: 4 }))
        );
        // The oversized body is scanned as noise; it holds no header byte
        assert_eq!(dec.decode_next(), Ok(Outcome::Record(empty())));
        assert_eq!(dec.stats().oversized, 1);
    }

    #[test]
    fn cancel_abandons_partial_frame() {
        let mut src = ScriptedSource::from_bytes([0xEBu8, 0x90, 12]);
        for _ in 0..4 {
            src.push_timeout();
        }
        let config = DecoderConfig {
            mid_frame_idle_polls: 10,
            ..DecoderConfig::default()
        };
        let mut dec = FrameDecoder::with_config(src, config);
        let flag = Arc::new(AtomicBool::new(true));
        dec.set_cancel_flag(flag);
        assert_eq!(dec.decode_next(), Ok(Outcome::Cancelled));
        assert_eq!(dec.stats().rejected(), 0);
    }

    #[test]
    fn source_can_be_fed_between_calls() {
        let config = DecoderConfig {
            max_parameters: 8,
            ..DecoderConfig::default()
        };
        let mut src = ScriptedSource::new();
        src.push_timeout();
        let mut dec = FrameDecoder::with_config(src, config);
        assert_eq!(dec.config().max_parameters, 8);
        assert_eq!(dec.config().mid_frame_idle_polls, 0);

        assert_eq!(dec.decode_next(), Ok(Outcome::Idle));
        assert_eq!(dec.source().remaining(), 0);

        dec.source_mut().push_bytes(frame(&empty()));
        assert_eq!(dec.source().remaining(), 16);
        assert_eq!(dec.decode_next(), Ok(Outcome::Record(empty())));
        assert_eq!(dec.source().remaining(), 0);
        assert!(!dec.into_source().is_closed());
    }

    #[test]
    fn stats_add_up() {
        let mut bad = frame(&empty());
        bad[4] ^= 0x01;
        let mut src = ScriptedSource::from_bytes([0xEBu8, 0x01]);
        src.push_bytes(bad)
            .push_bytes(frame(&empty()))
            .push_bytes(frame(&empty()));
        let mut dec = FrameDecoder::new(src);
        drain(&mut dec);
        let stats = dec.stats();
        assert_eq!(stats.records, 2);
        assert_eq!(stats.rejected(), 2);
        assert_eq!(stats.header_mismatches, 1);
        assert_eq!(stats.checksum_mismatches, 1);
    }
}
