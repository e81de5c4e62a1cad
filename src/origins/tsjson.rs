use anyhow::{Context, Result};
use sha1::{Digest, Sha1};

use crate::config::OriginConfig;
use crate::error::ProxyError;
use crate::origins::OriginClient;
use crate::proxy::RequestSnapshot;
use crate::timeseries::frames::FRAME_VERSION;
use crate::timeseries::{Extent, FrameEnvelope, SeriesEnvelope, TimeRangeQuery, Timeseries};

const RANGE_PATH_SUFFIX: &str = "/query_range";
const INSTANT_PATH_SUFFIX: &str = "/query";

const PARAM_QUERY: &str = "q";
const PARAM_START: &str = "start";
const PARAM_END: &str = "end";
const PARAM_STEP: &str = "step";

/// Generic JSON time-series dialect: range queries carry `q`, `start`,
/// `end`, and `step` parameters; bodies are either the sparse tuple
/// envelope or the framed envelope, discriminated by its version field.
pub struct TsJsonClient {
    config: OriginConfig,
}

impl TsJsonClient {
    pub fn new(config: OriginConfig) -> Self {
        Self { config }
    }
}

fn parse_step(raw: &str) -> Option<i64> {
    raw.trim_end_matches('s').parse().ok().filter(|s| *s > 0)
}

impl OriginClient for TsJsonClient {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn origin_type(&self) -> &str {
        &self.config.origin_type
    }

    fn configuration(&self) -> &OriginConfig {
        &self.config
    }

    fn derive_cache_key(&self, snapshot: &RequestSnapshot, extra: &str) -> String {
        let mut params: Vec<(String, String)> = snapshot
            .query
            .iter()
            .filter(|(k, _)| k != PARAM_START && k != PARAM_END)
            .cloned()
            .collect();
        params.sort();

        let mut hasher = Sha1::new();
        hasher.update(self.config.name.as_bytes());
        hasher.update(snapshot.method.as_str().as_bytes());
        hasher.update(snapshot.path.as_bytes());
        for (k, v) in &params {
            hasher.update(k.as_bytes());
            hasher.update(v.as_bytes());
        }
        hasher.update(extra.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn parse_time_range_query(
        &self,
        snapshot: &RequestSnapshot,
    ) -> Result<TimeRangeQuery, ProxyError> {
        if !self.is_range_path(&snapshot.path) {
            return Err(ProxyError::QueryParse("not a range query path".to_string()));
        }
        let statement = snapshot
            .query_value(PARAM_QUERY)
            .ok_or_else(|| ProxyError::QueryParse("missing q parameter".to_string()))?
            .to_string();
        let start: i64 = snapshot
            .query_value(PARAM_START)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ProxyError::QueryParse("missing or invalid start".to_string()))?;
        let end: i64 = snapshot
            .query_value(PARAM_END)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| ProxyError::QueryParse("missing or invalid end".to_string()))?;
        let step = snapshot
            .query_value(PARAM_STEP)
            .and_then(parse_step)
            .ok_or_else(|| ProxyError::QueryParse("missing or invalid step".to_string()))?;
        if end < start {
            return Err(ProxyError::QueryParse("end precedes start".to_string()));
        }
        Ok(TimeRangeQuery {
            statement,
            extent: Extent::new(start, end),
            step_secs: step,
        })
    }

    fn set_extent(&self, snapshot: &mut RequestSnapshot, extent: &Extent) {
        snapshot.set_query(PARAM_START, extent.start.to_string());
        snapshot.set_query(PARAM_END, extent.end.to_string());
    }

    fn marshal_timeseries(&self, ts: &Timeseries) -> Result<Vec<u8>> {
        match ts {
            Timeseries::Sparse(se) => serde_json::to_vec(se).context("marshal sparse series"),
            Timeseries::Frames(fe) => serde_json::to_vec(fe).context("marshal framed series"),
        }
    }

    fn unmarshal_timeseries(&self, data: &[u8]) -> Result<Timeseries> {
        let probe: String = String::from_utf8_lossy(data).split_whitespace().collect();
        if probe.contains(&format!("\"version\":\"{FRAME_VERSION}\"")) {
            let fe: FrameEnvelope =
                serde_json::from_slice(data).context("unmarshal framed series")?;
            return Ok(Timeseries::Frames(fe));
        }
        let se: SeriesEnvelope =
            serde_json::from_slice(data).context("unmarshal sparse series")?;
        Ok(Timeseries::Sparse(se))
    }

    fn unmarshal_instantaneous(&self, data: &[u8]) -> Result<Timeseries> {
        self.unmarshal_timeseries(data)
    }

    fn fast_forward_request(&self, snapshot: &RequestSnapshot) -> Option<RequestSnapshot> {
        if self.config.fast_forward_disable {
            return None;
        }
        let base = snapshot.path.strip_suffix(RANGE_PATH_SUFFIX)?;
        let mut ff = snapshot.clone();
        ff.path = format!("{base}{INSTANT_PATH_SUFFIX}");
        ff.query
            .retain(|(k, _)| k != PARAM_START && k != PARAM_END && k != PARAM_STEP);
        Some(ff)
    }

    fn is_range_path(&self, path: &str) -> bool {
        path.ends_with(RANGE_PATH_SUFFIX)
    }
}

/// Builds a single-point sparse series from an instantaneous response,
/// stamped at the given step so it merges cleanly.
pub fn instantaneous_to_series(ts: Timeseries, step: i64) -> Option<Timeseries> {
    match ts {
        Timeseries::Sparse(mut se) => {
            se.set_step(step);
            let last = se.data.last()?;
            let t = last.time();
            se.set_extents(crate::timeseries::ExtentList::single(Extent::new(t, t)));
            Some(Timeseries::Sparse(se))
        }
        Timeseries::Frames(_) => None,
    }
}
