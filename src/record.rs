use alloc::vec::Vec;

use crate::frame::{FIXED_BODY_LENGTH, HEADER, LENGTH_SIZE, PARAMETER_SIZE};

/// A decoded, checksum-validated telemetry record.
///
/// Records are only ever built from a complete frame, so every field is
/// populated. `message_type`, `status` and `loop_count` are carried through
/// untouched; their meaning belongs to the device.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Record {
    pub timestamp: f64,
    pub parameters: Vec<f32>,
    pub message_type: u8,
    pub status: u8,
    pub loop_count: u8,
}

impl Record {
    pub fn new(
        timestamp: f64,
        parameters: Vec<f32>,
        message_type: u8,
        status: u8,
        loop_count: u8,
    ) -> Record {
        Record {
            timestamp,
            parameters,
            message_type,
            status,
            loop_count,
        }
    }

    pub fn param_count(&self) -> usize {
        self.parameters.len()
    }

    /// Value of the length field this record encodes to, without range checks.
    /// The length field covers everything after itself, checksum included.
    pub(crate) fn body_length(&self) -> usize {
        FIXED_BODY_LENGTH as usize + PARAMETER_SIZE * self.parameters.len()
    }

    /// Number of bytes the full wire frame occupies.
    pub fn frame_len(&self) -> usize {
        HEADER.len() + LENGTH_SIZE + self.body_length()
    }

    /// Borrow this record as a flat CSV row.
    #[cfg(feature = "serde")]
    pub fn csv_row(&self) -> CsvRow<'_> {
        CsvRow(self)
    }
}

/// Column names for a CSV file of records carrying `param_count` parameters.
pub fn csv_header(param_count: usize) -> Vec<alloc::string::String> {
    use alloc::{format, string::ToString};

    let mut columns = Vec::with_capacity(4 + param_count);
    columns.extend(
        ["timestamp", "message_type", "status", "loop_count"]
            .iter()
            .map(|c| c.to_string()),
    );
    columns.extend((0..param_count).map(|i| format!("param_{}", i + 1)));
    columns
}

/// Serializes a record as one flat sequence:
/// `timestamp, message_type, status, loop_count, parameters...`.
#[cfg(feature = "serde")]
#[derive(Debug, Clone, Copy)]
pub struct CsvRow<'a>(&'a Record);

#[cfg(feature = "serde")]
impl serde::Serialize for CsvRow<'_> {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeSeq;

        let r = self.0;
        let mut seq = serializer.serialize_seq(Some(4 + r.parameters.len()))?;
        seq.serialize_element(&r.timestamp)?;
        seq.serialize_element(&r.message_type)?;
        seq.serialize_element(&r.status)?;
        seq.serialize_element(&r.loop_count)?;
        for p in &r.parameters {
            seq.serialize_element(p)?;
        }
        seq.end()
    }
}

/// A discontinuity in the loop counter sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub expected: u8,
    pub found: u8,
    /// Records skipped between the previous one and this one, mod 256.
    pub missed: u8,
}

/// Tracks `loop_count` across consecutive records and reports gaps.
///
/// The decoder never enforces the sequence; this is for consumers that want
/// to notice dropped frames.
#[derive(Debug, Default, Clone)]
pub struct LoopTracker {
    last: Option<u8>,
    gaps: u64,
}

impl LoopTracker {
    pub fn new() -> LoopTracker {
        LoopTracker::default()
    }

    pub fn observe(&mut self, loop_count: u8) -> Option<Gap> {
        let prev = self.last.replace(loop_count)?;
        let expected = prev.wrapping_add(1);
        if loop_count == expected {
            return None;
        }
        self.gaps += 1;
        Some(Gap {
            expected,
            found: loop_count,
            missed: loop_count.wrapping_sub(expected),
        })
    }

    pub fn gaps(&self) -> u64 {
        self.gaps
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
