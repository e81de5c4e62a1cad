use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::timeseries::extent::{Extent, ExtentList};

const BYTES_PER_SAMPLE: usize = 24;

/// A single sample, wire-encoded as the tuple `[timestamp, value]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint(pub i64, pub Value);

impl DataPoint {
    pub fn time(&self) -> i64 {
        self.0
    }

    pub fn value(&self) -> &Value {
        &self.1
    }
}

/// Sparse tuple-list time series: every sample carries its own timestamp.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SeriesEnvelope {
    #[serde(default)]
    pub data: Vec<DataPoint>,
    #[serde(default, skip_serializing_if = "ExtentList::is_empty")]
    pub extents: ExtentList,
    #[serde(default, skip_serializing_if = "step_is_zero")]
    pub step: i64,
}

fn step_is_zero(step: &i64) -> bool {
    *step == 0
}

impl SeriesEnvelope {
    pub fn step(&self) -> i64 {
        self.step
    }

    pub fn set_step(&mut self, step: i64) {
        self.step = step;
    }

    pub fn extents(&self) -> &ExtentList {
        &self.extents
    }

    pub fn set_extents(&mut self, extents: ExtentList) {
        self.extents = extents;
    }

    pub fn series_count(&self) -> usize {
        1
    }

    pub fn value_count(&self) -> usize {
        self.data.len()
    }

    pub fn timestamp_count(&self) -> usize {
        self.data
            .iter()
            .map(DataPoint::time)
            .collect::<BTreeSet<_>>()
            .len()
    }

    /// Appends the samples and extents of `others`, compresses the extent
    /// list at the current step, and optionally sorts. Overlapping
    /// timestamps resolve to the later contribution.
    pub fn merge(&mut self, sort: bool, others: Vec<SeriesEnvelope>) {
        for other in others {
            self.data.extend(other.data);
            self.extents.extend(&other.extents);
        }
        self.extents = self.extents.compress(self.step);
        if sort {
            self.sort();
        }
    }

    /// Sorts samples chronologically, keeping the last-appended sample for
    /// any duplicated timestamp.
    pub fn sort(&mut self) {
        let mut by_time: BTreeMap<i64, DataPoint> = BTreeMap::new();
        for dp in self.data.drain(..) {
            by_time.insert(dp.0, dp);
        }
        self.data = by_time.into_values().collect();
    }

    pub fn crop_to_range(&mut self, e: Extent) {
        self.data.retain(|dp| e.contains(dp.time()));
        self.extents = self.extents.crop(e);
    }

    /// Reduces the series to at most `sz` unique timestamps, dropping the
    /// oldest first. Samples newer than `now` are removed up front so that
    /// backfill-tolerant callers never retain mutable-future values.
    pub fn crop_to_size(&mut self, sz: usize, now: i64, _last_used: Extent) {
        if self.extents.is_empty() {
            self.data.clear();
            return;
        }
        if self.extents.0[self.extents.len() - 1].end > now {
            let start = self.extents.0[0].start;
            self.crop_to_range(Extent::new(start, now));
        }

        let unique: BTreeSet<i64> = self.data.iter().map(DataPoint::time).collect();
        if self.data.is_empty() || unique.len() <= sz {
            return;
        }

        let keep: BTreeSet<i64> = unique.into_iter().rev().take(sz).collect();
        self.data.retain(|dp| keep.contains(&dp.time()));
        let min = *keep.iter().next().unwrap();
        let max = *keep.iter().next_back().unwrap();
        self.extents = ExtentList::single(Extent::new(min, max));
        self.sort();
    }

    pub fn size(&self) -> usize {
        self.data.len() * BYTES_PER_SAMPLE
    }
}
