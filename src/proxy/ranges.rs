use serde::{Deserialize, Serialize};

/// Closed byte interval `[start, end]` within an object body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    pub fn content_range(&self, total: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total)
    }
}

#[derive(Debug)]
pub enum RangeError {
    Invalid,
    Unsatisfiable,
}

/// Ordered list of non-overlapping byte ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ByteRangeList(pub Vec<ByteRange>);

impl ByteRangeList {
    pub fn single(r: ByteRange) -> Self {
        Self(vec![r])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn push(&mut self, r: ByteRange) {
        self.0.push(r);
    }

    pub fn total_len(&self) -> u64 {
        self.0.iter().map(ByteRange::len).sum()
    }

    /// Merges overlapping and directly adjacent ranges; output is sorted.
    pub fn compress(&self) -> ByteRangeList {
        if self.0.is_empty() {
            return ByteRangeList::default();
        }
        let mut ranges = self.0.clone();
        ranges.sort();
        let mut out = Vec::with_capacity(ranges.len());
        let mut cur = ranges[0];
        for r in &ranges[1..] {
            if r.start <= cur.end.saturating_add(1) {
                if r.end > cur.end {
                    cur.end = r.end;
                }
            } else {
                out.push(cur);
                cur = *r;
            }
        }
        out.push(cur);
        ByteRangeList(out)
    }

    /// Returns the byte sub-ranges of this (requested) list that `cached`
    /// does not cover, clamped to the object length.
    pub fn calculate_delta(&self, cached: &ByteRangeList, content_length: u64) -> ByteRangeList {
        if content_length == 0 {
            return ByteRangeList::default();
        }
        let have = cached.compress();
        let mut out = Vec::new();
        for req in &self.0 {
            let req = ByteRange::new(req.start.min(content_length - 1), req.end.min(content_length - 1));
            let mut cursor = req.start;
            let mut exhausted = false;
            for h in &have.0 {
                if h.start > req.end {
                    break;
                }
                if h.end < cursor {
                    continue;
                }
                if h.start > cursor {
                    out.push(ByteRange::new(cursor, h.start - 1));
                }
                cursor = h.end.saturating_add(1);
                if cursor > req.end {
                    exhausted = true;
                    break;
                }
            }
            if !exhausted && cursor <= req.end {
                out.push(ByteRange::new(cursor, req.end));
            }
        }
        ByteRangeList(out).compress()
    }
}

/// Parses a `Range` header (possibly multi-range) against a body of
/// `size` bytes. Suffix and open-ended forms require a known size.
pub fn parse_range_header(header: &str, size: u64) -> Result<ByteRangeList, RangeError> {
    let header = header.trim();
    let spec = header.strip_prefix("bytes=").ok_or(RangeError::Invalid)?;
    if spec.is_empty() {
        return Err(RangeError::Invalid);
    }

    let mut out = Vec::new();
    for part in spec.split(',') {
        let part = part.trim();
        let (start_str, end_str) = part.split_once('-').ok_or(RangeError::Invalid)?;
        let start_str = start_str.trim();
        let end_str = end_str.trim();

        if start_str.is_empty() {
            // suffix form: bytes=-N
            let suffix: u64 = end_str.parse().map_err(|_| RangeError::Invalid)?;
            if suffix == 0 || size == 0 {
                return Err(RangeError::Unsatisfiable);
            }
            out.push(ByteRange::new(size.saturating_sub(suffix), size - 1));
            continue;
        }

        let start: u64 = start_str.parse().map_err(|_| RangeError::Invalid)?;
        if size > 0 && start >= size {
            return Err(RangeError::Unsatisfiable);
        }
        let end = if end_str.is_empty() {
            if size == 0 {
                return Err(RangeError::Invalid);
            }
            size - 1
        } else {
            let end: u64 = end_str.parse().map_err(|_| RangeError::Invalid)?;
            if size > 0 && end >= size {
                size - 1
            } else {
                end
            }
        };
        if end < start {
            return Err(RangeError::Unsatisfiable);
        }
        out.push(ByteRange::new(start, end));
    }

    Ok(ByteRangeList(out).compress())
}

pub fn build_range_header(ranges: &ByteRangeList) -> String {
    let parts: Vec<String> = ranges
        .0
        .iter()
        .map(|r| format!("{}-{}", r.start, r.end))
        .collect();
    format!("bytes={}", parts.join(","))
}

/// Parses `Content-Range: bytes start-end/size`.
pub fn parse_content_range(header: &str) -> Option<(ByteRange, u64)> {
    let header = header.trim();
    let spec = header.strip_prefix("bytes")?.trim_start();
    let (range_part, size_part) = spec.split_once('/')?;
    let (start, end) = range_part.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    let size: u64 = size_part.trim().parse().ok()?;
    if end < start {
        return None;
    }
    Some((ByteRange::new(start, end), size))
}
