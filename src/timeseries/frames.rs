use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::timeseries::extent::{Extent, ExtentList};

const BYTES_PER_SLOT: usize = 16;
pub const FRAME_VERSION: &str = "DF4";

/// Timestamp geometry of a dense frame: slot `i` holds the sample at
/// `start + i * period`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameHead {
    pub count: i64,
    pub start: i64,
    pub period: i64,
}

impl FrameHead {
    fn last(&self) -> i64 {
        self.start + (self.count - 1).max(0) * self.period
    }
}

/// Dense columnar time series: one row of slots per metric, timestamps
/// implied by the head. Absent samples are null.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameEnvelope {
    #[serde(default)]
    pub data: Vec<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub meta: Vec<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    pub head: FrameHead,
    #[serde(default, skip_serializing_if = "step_is_zero")]
    pub step: i64,
    #[serde(default, skip_serializing_if = "ExtentList::is_empty")]
    pub extents: ExtentList,
}

fn step_is_zero(step: &i64) -> bool {
    *step == 0
}

// Label-keyed view of one metric's slots, used to rebuild frames on merge
// and crop.
struct MetricData {
    meta: Map<String, Value>,
    data: BTreeMap<i64, Value>,
}

impl FrameEnvelope {
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
        self.data.len()
    }

    pub fn value_count(&self) -> usize {
        self.data.iter().map(Vec::len).sum()
    }

    pub fn timestamp_count(&self) -> usize {
        self.head.count.max(0) as usize
    }

    fn label(meta: &Map<String, Value>) -> Option<String> {
        meta.get("label").and_then(Value::as_str).map(str::to_string)
    }

    // Explodes the columnar data into per-label timestamp maps.
    fn metric_map(&self) -> BTreeMap<String, MetricData> {
        let mut metrics = BTreeMap::new();
        for (i, mv) in self.meta.iter().enumerate() {
            let Some(name) = Self::label(mv) else { continue };
            let mut data = BTreeMap::new();
            if let Some(row) = self.data.get(i) {
                for (j, dv) in row.iter().enumerate() {
                    let ts = self.head.start + (j as i64) * self.head.period;
                    data.insert(ts, dv.clone());
                }
            }
            metrics.insert(name, MetricData { meta: mv.clone(), data });
        }
        metrics
    }

    // Rebuilds the columnar data from per-label maps over the given head,
    // filling absent slots with null.
    fn rebuild(&mut self, metrics: BTreeMap<String, MetricData>, head: FrameHead) {
        let mut data = Vec::with_capacity(metrics.len());
        let mut meta = Vec::with_capacity(metrics.len());
        for m in metrics.values() {
            meta.push(m.meta.clone());
            let mut row = Vec::with_capacity(head.count.max(0) as usize);
            for i in 0..head.count {
                let ts = head.start + i * head.period;
                row.push(m.data.get(&ts).cloned().unwrap_or(Value::Null));
            }
            data.push(row);
        }
        self.data = data;
        self.meta = meta;
        self.head = head;
    }

    /// Merges same-period frames by rebuilding on the union range, keeping
    /// per-metric metadata. Frames with a different step are skipped.
    pub fn merge(&mut self, _sort: bool, others: Vec<FrameEnvelope>) {
        for other in others {
            if other.step != self.step
                || other.head.period != self.head.period
                || self.head.period <= 0
            {
                continue;
            }
            let mut metrics = self.metric_map();
            for (name, incoming) in other.metric_map() {
                match metrics.get_mut(&name) {
                    Some(existing) => existing.data.extend(incoming.data),
                    None => {
                        metrics.insert(name, incoming);
                    }
                }
            }

            let min = self.head.start.min(other.head.start);
            let max = self.head.last().max(other.head.last());
            let head = FrameHead {
                count: (max - min) / self.head.period + 1,
                start: min,
                period: self.head.period,
            };
            self.rebuild(metrics, head);
            self.extents.extend(&other.extents);
        }
        self.extents = self.extents.compress(self.step);
    }

    /// Crops to `e` after rounding both bounds down to the frame period.
    pub fn crop_to_range(&mut self, e: Extent) {
        let period = self.head.period.max(1);
        let e = Extent::new(e.start - e.start.rem_euclid(period), e.end - e.end.rem_euclid(period));

        if self.extents.is_empty() || self.extents.outside_of(e) {
            self.data.clear();
            self.meta.clear();
            self.head.start = e.start;
            self.head.count = 0;
            self.extents = ExtentList::default();
            return;
        }

        let mut metrics = self.metric_map();
        for m in metrics.values_mut() {
            m.data.retain(|ts, _| e.contains(*ts));
        }
        let head = FrameHead {
            count: (e.end - e.start) / period + 1,
            start: e.start,
            period,
        };
        self.rebuild(metrics, head);
        self.extents = self.extents.crop(e);
    }

    /// Reduces the frame to at most `sz` slots by dropping the oldest ones.
    /// Slots newer than `now` are cropped away first.
    pub fn crop_to_size(&mut self, sz: usize, now: i64, _last_used: Extent) {
        if self.extents.is_empty() {
            self.data.clear();
            self.meta.clear();
            self.head.start = 0;
            self.head.count = 0;
            return;
        }
        if self.extents.0[self.extents.len() - 1].end > now {
            let start = self.extents.0[0].start;
            self.crop_to_range(Extent::new(start, now));
        }

        let tc = self.timestamp_count();
        if self.data.is_empty() || tc <= sz {
            return;
        }

        let rc = tc - sz;
        for row in &mut self.data {
            *row = row.split_off(rc.min(row.len()));
        }
        self.head.start += rc as i64 * self.head.period;
        self.head.count -= rc as i64;
        self.extents = ExtentList::single(Extent::new(self.head.start, self.head.last()));
    }

    pub fn sort(&mut self) {
        // slots are ordered by construction
    }

    pub fn size(&self) -> usize {
        24 + self.version.len() + self.value_count() * BYTES_PER_SLOT
    }
}
