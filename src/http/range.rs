//! `Range: bytes=...` parsing against a known file size.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    #[error("malformed Range header")]
    Malformed,
    #[error("range not satisfiable")]
    Unsatisfiable,
}

/// Inclusive byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub from: u64,
    pub to: u64,
}

impl ByteRange {
    /// Number of bytes covered.
    pub fn size(&self) -> u64 {
        self.to - self.from + 1
    }
}

/// Ordered, non-overlapping ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeList {
    ranges: Vec<ByteRange>,
}

impl RangeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&ByteRange> {
        self.ranges.get(i)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ByteRange> {
        self.ranges.iter()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Appends a range; it must start after the previous one ends.
    pub fn add(&mut self, from: u64, to: u64) -> Result<(), RangeError> {
        if to < from {
            return Err(RangeError::Malformed);
        }
        if let Some(last) = self.ranges.last() {
            if from <= last.to {
                return Err(RangeError::Unsatisfiable);
            }
        }
        self.ranges.push(ByteRange { from, to });
        Ok(())
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Start,
    From,
    Dash,
    To,
    Suffix,
    AfterRange,
}

/// Parses a Range header value for a file of `filesize` bytes.
///
/// Open-ended ranges are clamped to the file; a range starting at or past
/// the end, a zero suffix, or ranges given out of order or overlapping make
/// the whole header unsatisfiable.
pub fn parse(value: &[u8], filesize: u64) -> Result<RangeList, RangeError> {
    const PREFIX: &[u8] = b"bytes=";
    if value.len() < PREFIX.len() || !value[..PREFIX.len()].eq_ignore_ascii_case(PREFIX) {
        return Err(RangeError::Malformed);
    }

    let mut list = RangeList::new();
    let mut state = State::Start;
    let mut from: u64 = 0;
    let mut to: u64 = 0;

    for &c in &value[PREFIX.len()..] {
        state = match (state, c) {
            (State::Start | State::AfterRange, b' ' | b'\t' | b',') => State::Start,
            (State::Start, b'0'..=b'9') => {
                from = u64::from(c - b'0');
                State::From
            }
            (State::Start, b'-') => {
                to = 0;
                State::Suffix
            }
            (State::From, b'0'..=b'9') => {
                from = push_digit(from, c)?;
                State::From
            }
            (State::From, b'-') => State::Dash,
            (State::Dash, b'0'..=b'9') => {
                to = u64::from(c - b'0');
                State::To
            }
            (State::To, b'0'..=b'9') => {
                to = push_digit(to, c)?;
                State::To
            }
            (State::Suffix, b'0'..=b'9') => {
                to = push_digit(to, c)?;
                State::Suffix
            }
            (State::Dash | State::To | State::Suffix, b' ' | b'\t' | b',') => {
                finish(state, from, to, filesize, &mut list)?;
                if c == b',' {
                    State::Start
                } else {
                    State::AfterRange
                }
            }
            _ => return Err(RangeError::Malformed),
        };
    }

    match state {
        State::Start | State::AfterRange => {}
        _ => finish(state, from, to, filesize, &mut list)?,
    }

    if list.is_empty() {
        return Err(RangeError::Malformed);
    }

    Ok(list)
}

fn finish(
    state: State,
    from: u64,
    to: u64,
    filesize: u64,
    list: &mut RangeList,
) -> Result<(), RangeError> {
    match state {
        State::Dash => {
            if from >= filesize {
                return Err(RangeError::Unsatisfiable);
            }
            list.add(from, filesize - 1)
        }
        State::To => {
            if from >= filesize {
                return Err(RangeError::Unsatisfiable);
            }
            list.add(from, to.min(filesize - 1))
        }
        State::Suffix => {
            if to == 0 || filesize == 0 {
                return Err(RangeError::Unsatisfiable);
            }
            list.add(filesize.saturating_sub(to), filesize - 1)
        }
        _ => Err(RangeError::Malformed),
    }
}

fn push_digit(n: u64, c: u8) -> Result<u64, RangeError> {
    n.checked_mul(10)
        .and_then(|n| n.checked_add(u64::from(c - b'0')))
        .ok_or(RangeError::Malformed)
}
