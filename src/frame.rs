use core::convert::Infallible;

use alloc::vec;
use alloc::vec::Vec;
use thiserror::Error;

use crate::{Decode, Encode, checksum::Checksum, record::Record};

/// Two bytes that open every frame.
pub const HEADER: [u8; 2] = [0xEB, 0x90];
pub const LENGTH_SIZE: usize = 2;
pub const TIMESTAMP_SIZE: usize = 8;
pub const PARAMETER_SIZE: usize = 4;
/// Message type, status, loop count, checksum
pub const TRAILER_SIZE: usize = 4;
/// Length field value of a frame with no parameters: timestamp + trailer.
pub const FIXED_BODY_LENGTH: u16 = (TIMESTAMP_SIZE + TRAILER_SIZE) as u16;
/// Largest parameter count whose length still fits the u16 length field.
pub const MAX_PARAMETERS: usize = (u16::MAX - FIXED_BODY_LENGTH) as usize / PARAMETER_SIZE;
/// Header, length field and timestamp.
pub const PREFIX_SIZE: usize = HEADER.len() + LENGTH_SIZE + TIMESTAMP_SIZE;
pub const MAX_FRAME_SIZE: usize =
    HEADER.len() + LENGTH_SIZE + FIXED_BODY_LENGTH as usize + MAX_PARAMETERS * PARAMETER_SIZE;

/// Reasons a frame is rejected. None of them are fatal to a decoder; the
/// scanner drops the frame and goes back to hunting for a header.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("header not found: unexpected byte {found:#04x}")]
    HeaderMismatch { found: u8 },
    #[error("checksum error: length={length}, checksum={computed:#04x}, expect={expected:#04x}")]
    ChecksumMismatch { length: u16, computed: u8, expected: u8 },
    #[error("malformed length field {length}: must be a multiple of 4 and at least 12")]
    MalformedLength { length: u16 },
    #[error("too many parameters: {count} exceeds limit of {max}")]
    TooManyParameters { count: usize, max: usize },
    #[error("short read: expected {expected} bytes, received {received}")]
    ShortRead { expected: usize, received: usize },
    #[error("frame truncated: expected at least {expected} bytes, found {found}")]
    Truncated { expected: usize, found: usize },
}

/// Stable names for each rejection, suitable for a status line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Header,
    Checksum,
    MalformedLength,
    TooManyParameters,
    ShortRead,
    Truncated,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Header => "header not found",
            ErrorKind::Checksum => "checksum error",
            ErrorKind::MalformedLength => "malformed length",
            ErrorKind::TooManyParameters => "too many parameters",
            ErrorKind::ShortRead => "short read",
            ErrorKind::Truncated => "truncated frame",
        }
    }
}

impl core::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FrameError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FrameError::HeaderMismatch { .. } => ErrorKind::Header,
            FrameError::ChecksumMismatch { .. } => ErrorKind::Checksum,
            FrameError::MalformedLength { .. } => ErrorKind::MalformedLength,
            FrameError::TooManyParameters { .. } => ErrorKind::TooManyParameters,
            FrameError::ShortRead { .. } => ErrorKind::ShortRead,
            FrameError::Truncated { .. } => ErrorKind::Truncated,
        }
    }
}

/// Errors from building a frame. `E` is the writer's error when streaming
/// a frame out with [`write_frame`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodeError<E = Infallible> {
    #[error("too many parameters: {count} exceeds limit of {max}")]
    TooManyParameters { count: usize, max: usize },
    #[error("encode buffer too small: need {expected} bytes, found {found}")]
    BufferTooSmall { expected: usize, found: usize },
    #[error("write failed: {0:?}")]
    Write(E),
}

/// Length field value for a frame carrying `param_count` parameters.
pub fn length_for<E>(param_count: usize) -> Result<u16, EncodeError<E>> {
    if param_count > MAX_PARAMETERS {
        return Err(EncodeError::TooManyParameters {
            count: param_count,
            max: MAX_PARAMETERS,
        });
    }
    Ok(FIXED_BODY_LENGTH + (param_count * PARAMETER_SIZE) as u16)
}

/// Parameter count carried by a frame with the given length field.
///
/// The length must cover at least the timestamp and trailer and must be a
/// whole number of 4-byte words.
pub fn param_count_for(length: u16) -> Result<usize, FrameError> {
    if length < FIXED_BODY_LENGTH || length as usize % PARAMETER_SIZE != 0 {
        return Err(FrameError::MalformedLength { length });
    }
    Ok(length as usize / PARAMETER_SIZE - 3)
}

/// Size of the frame at the start of `data`, if enough of it is present to
/// read the length field.
pub fn frame_len(data: &[u8]) -> Option<usize> {
    let length = data.get(HEADER.len()..HEADER.len() + LENGTH_SIZE)?;
    Some(HEADER.len() + LENGTH_SIZE + u16::from_le_bytes([length[0], length[1]]) as usize)
}

impl Encode for Record {
    type Error = EncodeError;

    fn encode(&self, buffer: &mut [u8]) -> Result<usize, Self::Error> {
        let length = length_for::<Infallible>(self.param_count())?;
        let size = self.frame_len();
        if buffer.len() < size {
            return Err(EncodeError::BufferTooSmall {
                expected: size,
                found: buffer.len(),
            });
        }

        // HEADER: 2, LENGTH: 2, TIMESTAMP: 8, PARAMS: 4N, TRAILER: 4
        buffer[0..2].copy_from_slice(&HEADER);
        buffer[2..4].copy_from_slice(&length.to_le_bytes());
        let ts = self.timestamp.to_le_bytes();
        buffer[4..PREFIX_SIZE].copy_from_slice(&ts);

        let mut d = Checksum::new(length, self.message_type, self.status, self.loop_count);
        d.update(&ts);

        let params_end = PREFIX_SIZE + self.param_count() * PARAMETER_SIZE;
        let params = &mut buffer[PREFIX_SIZE..params_end];
        for (slot, p) in params.chunks_exact_mut(PARAMETER_SIZE).zip(&self.parameters) {
            slot.copy_from_slice(&p.to_le_bytes());
        }
        d.update(params);

        buffer[params_end] = self.message_type;
        buffer[params_end + 1] = self.status;
        buffer[params_end + 2] = self.loop_count;
        buffer[params_end + 3] = d.finalize();
        Ok(size)
    }
}

impl<'a> Decode<'a> for Record {
    type Error = FrameError;

    /// Decode the frame at the start of `data`. Bytes past the end of the
    /// frame are ignored.
    fn decode(data: &'a [u8]) -> Result<Self, Self::Error> {
        let head = HEADER.len() + LENGTH_SIZE;
        if data.len() < head {
            return Err(FrameError::Truncated {
                expected: head,
                found: data.len(),
            });
        }
        for (found, want) in data.iter().zip(HEADER) {
            if *found != want {
                return Err(FrameError::HeaderMismatch { found: *found });
            }
        }

        let length = u16::from_le_bytes([data[2], data[3]]);
        let count = param_count_for(length)?;
        let size = head + length as usize;
        if data.len() < size {
            return Err(FrameError::Truncated {
                expected: size,
                found: data.len(),
            });
        }

        let (ts_bytes, rest) = data[head..size].split_at(TIMESTAMP_SIZE);
        let (param_bytes, trailer) = rest.split_at(count * PARAMETER_SIZE);
        let mut ts = [0; TIMESTAMP_SIZE];
        ts.copy_from_slice(ts_bytes);
        let (message_type, status, loop_count, expected) =
            (trailer[0], trailer[1], trailer[2], trailer[3]);

        let mut d = Checksum::new(length, message_type, status, loop_count);
        d.update(param_bytes);
        d.update(ts_bytes);
        let computed = d.finalize();
        if computed != expected {
            return Err(FrameError::ChecksumMismatch {
                length,
                computed,
                expected,
            });
        }

        let parameters = param_bytes
            .chunks_exact(PARAMETER_SIZE)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();

        Ok(Record {
            timestamp: f64::from_le_bytes(ts),
            parameters,
            message_type,
            status,
            loop_count,
        })
    }
}

impl Record {
    /// Encode into a freshly allocated buffer of exactly the frame's size.
    pub fn to_frame(&self) -> Result<Vec<u8>, EncodeError> {
        length_for::<Infallible>(self.param_count())?;
        let mut buf = vec![0; self.frame_len()];
        self.encode(&mut buf)?;
        Ok(buf)
    }
}

/// Stream a frame into `tx` without staging the whole frame in memory.
/// Returns the number of bytes written.
pub fn write_frame<W: embedded_io::Write>(
    record: &Record,
    tx: &mut W,
) -> Result<usize, EncodeError<W::Error>> {
    let length = length_for::<W::Error>(record.param_count())?;
    let ts = record.timestamp.to_le_bytes();
    let mut d = Checksum::new(length, record.message_type, record.status, record.loop_count);
    d.update(&ts);

    // Both staging buffers are sized exactly, extend can't overflow
    let mut prefix = heapless::Vec::<u8, PREFIX_SIZE>::new();
    let _ = prefix.extend_from_slice(&HEADER);
    let _ = prefix.extend_from_slice(&length.to_le_bytes());
    let _ = prefix.extend_from_slice(&ts);
    tx.write_all(&prefix).map_err(EncodeError::Write)?;

    for p in &record.parameters {
        let b = p.to_le_bytes();
        d.update(&b);
        tx.write_all(&b).map_err(EncodeError::Write)?;
    }

    let mut trailer = heapless::Vec::<u8, TRAILER_SIZE>::new();
    let _ = trailer.extend_from_slice(&[record.message_type, record.status, record.loop_count]);
    let _ = trailer.push(d.finalize());
    tx.write_all(&trailer).map_err(EncodeError::Write)?;
    tx.flush().map_err(EncodeError::Write)?;

    Ok(record.frame_len())
}
