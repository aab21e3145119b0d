// ai
//! 🔍 The Line Decoder — turns `<metric> <value> <timestamp>` into a [`Datapoint`].
//!
//! 🎬 *[a line arrives. it claims to be a metric. the decoder squints.]*
//!
//! Pure function land: no state, no I/O, no tokio. Give it a trimmed line, get
//! back a `Datapoint` or a [`DecodeError`] that says exactly which field lied.
//!
//! 🧠 Knowledge graph:
//! - Fields are split on single spaces. Two spaces in a row means an empty field,
//!   and an empty field is not a number. The protocol is strict like that.
//! - Fields past the third are ignored. The wire format is fixed at three.
//! - Values must be finite: `NaN` and `inf` parse, but JSON cannot carry them,
//!   so they bounce here instead of turning into `null` in the index.
//! - Timestamps must fit in an `i32`. 2038 is somebody else's incident. 🦆

use thiserror::Error;

use crate::common::Datapoint;

/// 💀 Every way a line can fail to become a datapoint.
///
/// These are per-line, recoverable failures: the connection handler logs them
/// and moves on to the next line. None of them ever close a connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Fewer than three space-separated fields.
    #[error("malformed line, expected '<metric> <value> <timestamp>': {line:?}")]
    MalformedLine { line: String },
    /// The second field is not a finite base-10 float.
    #[error("could not parse value {value:?} out of line {line:?}")]
    InvalidValue { line: String, value: String },
    /// The third field is not a base-10 integer that fits in 32 bits.
    #[error("could not parse timestamp {timestamp:?} out of line {line:?}")]
    InvalidTimestamp { line: String, timestamp: String },
    /// The raw bytes were not UTF-8.
    #[error("line is not valid UTF-8 ({len} bytes)")]
    NotUtf8 { len: usize },
    /// The line blew past the per-connection length cap before a newline showed up.
    #[error("line exceeded {max_line_bytes} bytes without a newline, discarded")]
    LineTooLong { max_line_bytes: usize },
}

/// 🔍 Decode one line of text (terminator and surrounding whitespace already stripped).
///
/// ```
/// use carbex::decoder::decode_line;
///
/// let dp = decode_line("server.cpu.load 0.42 1700000000").unwrap();
/// assert_eq!(dp.metric(), "server.cpu.load");
/// assert_eq!(dp.value(), 0.42);
/// assert_eq!(dp.timestamp(), 1700000000);
/// ```
pub fn decode_line(line: &str) -> Result<Datapoint, DecodeError> {
    let mut fields = line.split(' ');
    // -- 🎯 three fields or bust. `split` on an empty line still yields one "" field,
    // -- so an empty metric can only sneak through as the lone field of a blank line.
    let (metric, value, timestamp) = match (fields.next(), fields.next(), fields.next()) {
        (Some(metric), Some(value), Some(timestamp)) if !metric.is_empty() => {
            (metric, value, timestamp)
        }
        _ => {
            return Err(DecodeError::MalformedLine {
                line: line.to_string(),
            });
        }
    };

    let value = match value.parse::<f64>() {
        Ok(parsed) if parsed.is_finite() => parsed,
        _ => {
            return Err(DecodeError::InvalidValue {
                line: line.to_string(),
                value: value.to_string(),
            });
        }
    };

    let timestamp = timestamp
        .parse::<i32>()
        .map_err(|_| DecodeError::InvalidTimestamp {
            line: line.to_string(),
            timestamp: timestamp.to_string(),
        })?;

    Ok(Datapoint::new(metric.to_string(), value, timestamp))
}

/// 🧹 Decode raw bytes from the wire: UTF-8 check, whitespace trim, then [`decode_line`].
///
/// Returns `None` for blank lines. Plenty of clients end a burst with an extra
/// `\n`, and that is not worth a warning.
pub fn decode_bytes(raw: &[u8]) -> Option<Result<Datapoint, DecodeError>> {
    let text = match std::str::from_utf8(raw) {
        Ok(text) => text,
        Err(_) => return Some(Err(DecodeError::NotUtf8 { len: raw.len() })),
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(decode_line(trimmed))
}
