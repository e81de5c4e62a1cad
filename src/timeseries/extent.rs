use serde::{Deserialize, Serialize};

/// Closed interval of sample timestamps, unix seconds at both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Extent {
    pub start: i64,
    pub end: i64,
}

impl Extent {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, t: i64) -> bool {
        t >= self.start && t <= self.end
    }

    pub fn intersects(&self, other: &Extent) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

/// Ordered list of non-overlapping extents, sorted by start.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtentList(pub Vec<Extent>);

impl ExtentList {
    pub fn single(e: Extent) -> Self {
        Self(vec![e])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn push(&mut self, e: Extent) {
        self.0.push(e);
    }

    pub fn extend(&mut self, other: &ExtentList) {
        self.0.extend_from_slice(&other.0);
    }

    /// The overall span from the earliest start to the latest end, assuming
    /// the list is sorted.
    pub fn span(&self) -> Option<Extent> {
        match (self.0.first(), self.0.last()) {
            (Some(first), Some(last)) => Some(Extent::new(first.start, last.end)),
            _ => None,
        }
    }

    /// Merges overlapping extents and extents separated by no more than one
    /// step. The result is sorted and gap-separated.
    pub fn compress(&self, step: i64) -> ExtentList {
        let step = step.max(1);
        if self.0.is_empty() {
            return ExtentList::default();
        }
        let mut exts = self.0.clone();
        exts.sort();
        let mut out = Vec::with_capacity(exts.len());
        let mut cur = exts[0];
        for e in &exts[1..] {
            if e.start <= cur.end + step {
                if e.end > cur.end {
                    cur.end = e.end;
                }
            } else {
                out.push(cur);
                cur = *e;
            }
        }
        out.push(cur);
        ExtentList(out)
    }

    /// Restricts every extent to its intersection with `e`, dropping the
    /// ones that fall entirely outside.
    pub fn crop(&self, e: Extent) -> ExtentList {
        let mut out = Vec::with_capacity(self.0.len());
        for x in &self.0 {
            let start = x.start.max(e.start);
            let end = x.end.min(e.end);
            if start <= end {
                out.push(Extent::new(start, end));
            }
        }
        ExtentList(out)
    }

    /// True when no element intersects `e`.
    pub fn outside_of(&self, e: Extent) -> bool {
        !self.0.iter().any(|x| x.intersects(&e))
    }

    /// Returns the step-aligned sub-extents of `requested` that this list
    /// does not cover. A timestamp exactly at a cached boundary belongs to
    /// the cache, never to the delta; gap bounds sit on the request's step
    /// phase.
    pub fn calculate_deltas(&self, requested: Extent, step: i64) -> ExtentList {
        let step = step.max(1);
        let covered = self.compress(step);
        let mut out = Vec::new();
        let mut cursor = requested.start;
        for x in &covered.0 {
            if x.start > requested.end {
                break;
            }
            if x.end < cursor {
                continue;
            }
            if x.start > cursor {
                let gap_end = (x.start - 1).min(requested.end);
                if let Some(gap) = phase_gap(cursor, gap_end, requested.start, step) {
                    out.push(gap);
                }
            }
            cursor = align_up(x.end + 1, requested.start, step);
            if cursor > requested.end {
                break;
            }
        }
        if cursor <= requested.end {
            if let Some(gap) = phase_gap(cursor, requested.end, requested.start, step) {
                out.push(gap);
            }
        }
        ExtentList(out)
    }
}

fn align_up(t: i64, phase: i64, step: i64) -> i64 {
    let offset = (t - phase).rem_euclid(step);
    if offset == 0 {
        t
    } else {
        t + (step - offset)
    }
}

fn align_down(t: i64, phase: i64, step: i64) -> i64 {
    t - (t - phase).rem_euclid(step)
}

// Snaps a raw gap onto the request's sample phase, dropping gaps that
// hold no sample instant.
fn phase_gap(start: i64, end: i64, phase: i64, step: i64) -> Option<Extent> {
    let start = align_up(start, phase, step);
    let end = align_down(end, phase, step);
    if start > end {
        return None;
    }
    Some(Extent::new(start, end))
}
