#![cfg_attr(not(feature = "std"), no_std)]
//! Framing for the `0xEB 0x90` telemetry link.
//!
//! ```text
//! EB 90 | length:u16le | timestamp:f64le | params:[f32le; N] | type | status | loop | checksum
//! ```
//!
//! `length` counts every byte after itself, so `length = 12 + 4 * N`. The
//! checksum is the mod-256 sum of `length`, type, status and loop count as
//! values, plus every byte of the encoded timestamp and parameters.

extern crate alloc;

mod checksum;
mod decoder;
mod frame;
#[cfg(feature = "std")]
mod reader;
mod record;
mod source;

pub trait Encode {
    type Error;

    /// Write the wire image into `buffer`, returning the bytes used.
    fn encode(&self, buffer: &mut [u8]) -> Result<usize, Self::Error>;
}

pub trait Decode<'a>
where
    Self: Sized,
{
    type Error;

    fn decode(data: &'a [u8]) -> Result<Self, Self::Error>;
}

pub use checksum::{Checksum, checksum};
pub use decoder::{DecoderConfig, DecoderStats, FrameDecoder, Outcome};
pub use frame::{
    EncodeError, ErrorKind, FIXED_BODY_LENGTH, FrameError, HEADER, LENGTH_SIZE, MAX_FRAME_SIZE,
    MAX_PARAMETERS, PARAMETER_SIZE, PREFIX_SIZE, TIMESTAMP_SIZE, TRAILER_SIZE, frame_len,
    length_for, param_count_for, write_frame,
};
#[cfg(feature = "std")]
pub use reader::{ChannelSink, Event, FrameReader, FrameSink, ReaderConfig, ReaderExit, StopHandle};
#[cfg(feature = "serde")]
pub use record::CsvRow;
pub use record::{Gap, LoopTracker, Record, csv_header};
#[cfg(feature = "std")]
pub use source::StdSource;
pub use source::{
    ByteSource, DEFAULT_TIMEOUT_US, ErrorShim, IoSource, NbSource, NbWriter, POLL_INTERVAL_US,
    ScriptedSource, SourceError,
};
