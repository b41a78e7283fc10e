//! The human-readable wire format a sampler writes to its multiplexer
//! channel and the multiplexer parses back into per-counter delta rows
//! (spec.md §4.3/§4.4). Kept as a human-readable format, in the spirit
//! of the reference agent's own batch dumps, rather than a binary
//! encoding, since nothing on the wire crosses a process boundary.
//!
//! ```text
//! [PID: 4242] Samples 0-9:
//! Event: instructions
//!   [0] 120	[1] 131	...	[9] 980
//! Event: cycles
//!   [0] 900	[1] 950	...	[9] 4200
//! ```

use crate::config::{COUNTER_NAMES, K};
use crate::error::{Error, Result};

/// One parsed batch: `end - start + 1` delta rows, each holding the `K`
/// fixed counters in `COUNTER_NAMES` order.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBatch {
    pub pid: u32,
    pub start: usize,
    pub end: usize,
    pub rows: Vec<[u64; K]>,
}

/// Encodes a contiguous run of sample rows `[start, end]` for `pid`.
pub fn encode_batch(pid: u32, start: usize, rows: &[[u64; K]]) -> Vec<u8> {
    let end = start + rows.len().saturating_sub(1);
    let mut out = format!("[PID: {}] Samples {}-{}:\n", pid, start, end);
    for (col, name) in COUNTER_NAMES.iter().enumerate() {
        out.push_str("Event: ");
        out.push_str(name);
        out.push('\n');
        out.push_str("  ");
        for (i, row) in rows.iter().enumerate() {
            out.push_str(&format!("[{}] {}", start + i, row[col]));
            if i + 1 != rows.len() {
                out.push('\t');
            }
        }
        out.push('\n');
    }
    out.into_bytes()
}

/// Parses a single batch chunk. Tolerant of surrounding whitespace;
/// returns `Err(Error::Parse(_))` on any structural mismatch so the
/// caller can log-and-skip without aborting the multiplexer (spec.md's
/// "malformed input must never crash the multiplexer" requirement).
pub fn parse_batch(chunk: &[u8]) -> Result<ParsedBatch> {
    let text = std::str::from_utf8(chunk)
        .map_err(|e| Error::Parse(format!("not valid utf-8: {}", e)))?;
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());

    let header = lines
        .next()
        .ok_or_else(|| Error::Parse("empty batch".into()))?;
    let (pid, start, end) = parse_header(header)?;
    let expected_rows = end
        .checked_sub(start)
        .and_then(|d| d.checked_add(1))
        .ok_or_else(|| Error::Parse(format!("invalid sample range {}-{}", start, end)))?;

    let mut rows = vec![[0u64; K]; expected_rows];

    for expected_name in COUNTER_NAMES.iter() {
        let event_line = lines
            .next()
            .ok_or_else(|| Error::Parse(format!("missing Event line for {}", expected_name)))?;
        let name = event_line
            .trim()
            .strip_prefix("Event: ")
            .ok_or_else(|| Error::Parse(format!("malformed Event line: {:?}", event_line)))?;
        if name != *expected_name {
            return Err(Error::Parse(format!(
                "expected event {}, found {}",
                expected_name, name
            )));
        }

        let values_line = lines
            .next()
            .ok_or_else(|| Error::Parse(format!("missing values for event {}", name)))?;
        for cell in values_line.split_whitespace() {
            let cell = cell.trim();
            let rest = cell
                .strip_prefix('[')
                .ok_or_else(|| Error::Parse(format!("malformed cell: {:?}", cell)))?;
            let (idx_str, val_str) = rest
                .split_once("] ")
                .ok_or_else(|| Error::Parse(format!("malformed cell: {:?}", cell)))?;
            let idx: usize = idx_str
                .parse()
                .map_err(|_| Error::Parse(format!("malformed index: {:?}", idx_str)))?;
            let val: u64 = val_str
                .parse()
                .map_err(|_| Error::Parse(format!("malformed value: {:?}", val_str)))?;
            let row = idx
                .checked_sub(start)
                .and_then(|r| rows.get_mut(r))
                .ok_or_else(|| Error::Parse(format!("index {} out of range", idx)))?;
            let col = COUNTER_NAMES
                .iter()
                .position(|n| *n == name)
                .expect("name already validated against COUNTER_NAMES");
            row[col] = val;
        }
    }

    Ok(ParsedBatch {
        pid,
        start,
        end,
        rows,
    })
}

fn parse_header(header: &str) -> Result<(u32, usize, usize)> {
    let header = header.trim();
    let rest = header
        .strip_prefix("[PID: ")
        .ok_or_else(|| Error::Parse(format!("malformed header: {:?}", header)))?;
    let (pid_str, rest) = rest
        .split_once("] Samples ")
        .ok_or_else(|| Error::Parse(format!("malformed header: {:?}", header)))?;
    let rest = rest
        .strip_suffix(':')
        .ok_or_else(|| Error::Parse(format!("malformed header: {:?}", header)))?;
    let (start_str, end_str) = rest
        .split_once('-')
        .ok_or_else(|| Error::Parse(format!("malformed header: {:?}", header)))?;

    let pid: u32 = pid_str
        .parse()
        .map_err(|_| Error::Parse(format!("malformed pid: {:?}", pid_str)))?;
    let start: usize = start_str
        .parse()
        .map_err(|_| Error::Parse(format!("malformed start: {:?}", start_str)))?;
    let end: usize = end_str
        .parse()
        .map_err(|_| Error::Parse(format!("malformed end: {:?}", end_str)))?;
    Ok((pid, start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_then_parse_recovers_rows() {
        let rows = vec![[1, 2, 3, 4], [5, 6, 7, 8], [9, 10, 11, 12]];
        let encoded = encode_batch(4242, 0, &rows);
        let parsed = parse_batch(&encoded).unwrap();
        assert_eq!(parsed.pid, 4242);
        assert_eq!(parsed.start, 0);
        assert_eq!(parsed.end, 2);
        assert_eq!(parsed.rows, rows);
    }

    #[test]
    fn parse_respects_nonzero_start_offset() {
        let rows = vec![[1, 1, 1, 1], [2, 2, 2, 2]];
        let encoded = encode_batch(7, 10, &rows);
        let parsed = parse_batch(&encoded).unwrap();
        assert_eq!(parsed.start, 10);
        assert_eq!(parsed.end, 11);
        assert_eq!(parsed.rows, rows);
    }

    #[test]
    fn malformed_header_is_reported_not_panicked() {
        let err = parse_batch(b"not a header\n").unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn wrong_event_order_is_rejected() {
        let bogus = b"[PID: 1] Samples 0-0:\nEvent: cycles\n  [0] 5\n";
        let err = parse_batch(bogus).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }

    #[test]
    fn truncated_batch_is_rejected() {
        let bogus = b"[PID: 1] Samples 0-0:\nEvent: instructions\n";
        let err = parse_batch(bogus).unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
    }
}
