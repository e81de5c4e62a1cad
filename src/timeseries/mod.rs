pub mod extent;
pub mod frames;
pub mod sparse;

pub use extent::{Extent, ExtentList};
pub use frames::{FrameEnvelope, FrameHead};
pub use sparse::{DataPoint, SeriesEnvelope};

/// A range query reduced to the parts the proxy cares about: what was
/// asked (`statement`), over which span, at which sampling step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeRangeQuery {
    pub statement: String,
    pub extent: Extent,
    pub step_secs: i64,
}

impl TimeRangeQuery {
    /// Aligns both bounds down to step boundaries and clips the end so
    /// that samples still inside the backfill-tolerance window are never
    /// requested for caching.
    pub fn normalize_extent(&mut self, now: i64, backfill_tolerance_secs: i64) {
        let step = self.step_secs.max(1);
        let max_end = now - backfill_tolerance_secs;
        if self.extent.end > max_end {
            self.extent.end = max_end;
        }
        self.extent.start -= self.extent.start.rem_euclid(step);
        self.extent.end -= self.extent.end.rem_euclid(step);
    }

    pub fn calculate_deltas(&self, cached: &ExtentList) -> ExtentList {
        cached.calculate_deltas(self.extent, self.step_secs)
    }
}

/// The two concrete sample encodings behind one capability set. The
/// engines only ever speak this dispatch surface.
#[derive(Debug, Clone, PartialEq)]
pub enum Timeseries {
    Sparse(SeriesEnvelope),
    Frames(FrameEnvelope),
}

impl Timeseries {
    pub fn step(&self) -> i64 {
        match self {
            Timeseries::Sparse(se) => se.step(),
            Timeseries::Frames(fe) => fe.step(),
        }
    }

    pub fn set_step(&mut self, step: i64) {
        match self {
            Timeseries::Sparse(se) => se.set_step(step),
            Timeseries::Frames(fe) => fe.set_step(step),
        }
    }

    pub fn extents(&self) -> &ExtentList {
        match self {
            Timeseries::Sparse(se) => se.extents(),
            Timeseries::Frames(fe) => fe.extents(),
        }
    }

    pub fn set_extents(&mut self, extents: ExtentList) {
        match self {
            Timeseries::Sparse(se) => se.set_extents(extents),
            Timeseries::Frames(fe) => fe.set_extents(extents),
        }
    }

    pub fn series_count(&self) -> usize {
        match self {
            Timeseries::Sparse(se) => se.series_count(),
            Timeseries::Frames(fe) => fe.series_count(),
        }
    }

    pub fn value_count(&self) -> usize {
        match self {
            Timeseries::Sparse(se) => se.value_count(),
            Timeseries::Frames(fe) => fe.value_count(),
        }
    }

    pub fn timestamp_count(&self) -> usize {
        match self {
            Timeseries::Sparse(se) => se.timestamp_count(),
            Timeseries::Frames(fe) => fe.timestamp_count(),
        }
    }

    /// Merges the given series into this one. Mixed encodings do not
    /// merge; a mismatched element is dropped.
    pub fn merge(&mut self, sort: bool, others: Vec<Timeseries>) {
        match self {
            Timeseries::Sparse(se) => se.merge(
                sort,
                others
                    .into_iter()
                    .filter_map(|ts| match ts {
                        Timeseries::Sparse(other) => Some(other),
                        Timeseries::Frames(_) => None,
                    })
                    .collect(),
            ),
            Timeseries::Frames(fe) => fe.merge(
                sort,
                others
                    .into_iter()
                    .filter_map(|ts| match ts {
                        Timeseries::Frames(other) => Some(other),
                        Timeseries::Sparse(_) => None,
                    })
                    .collect(),
            ),
        }
    }

    pub fn crop_to_range(&mut self, e: Extent) {
        match self {
            Timeseries::Sparse(se) => se.crop_to_range(e),
            Timeseries::Frames(fe) => fe.crop_to_range(e),
        }
    }

    pub fn crop_to_size(&mut self, sz: usize, now: i64, last_used: Extent) {
        match self {
            Timeseries::Sparse(se) => se.crop_to_size(sz, now, last_used),
            Timeseries::Frames(fe) => fe.crop_to_size(sz, now, last_used),
        }
    }

    pub fn sort(&mut self) {
        match self {
            Timeseries::Sparse(se) => se.sort(),
            Timeseries::Frames(fe) => fe.sort(),
        }
    }

    /// Approximate in-memory footprint, used only for eviction accounting
    /// on reference-stored entries.
    pub fn size(&self) -> usize {
        match self {
            Timeseries::Sparse(se) => se.size(),
            Timeseries::Frames(fe) => fe.size(),
        }
    }
}
