use anyhow::Result;

use crate::config::OriginConfig;
use crate::error::ProxyError;
use crate::proxy::RequestSnapshot;
use crate::timeseries::{Extent, TimeRangeQuery, Timeseries};

pub mod tsjson;

/// Dialect adapter between the engines and a concrete time-series origin.
/// The engines never look past this surface: they hand a request in, get
/// a time range out, and round-trip series through marshal/unmarshal.
pub trait OriginClient: Send + Sync {
    fn name(&self) -> &str;

    fn origin_type(&self) -> &str;

    fn configuration(&self) -> &OriginConfig;

    /// Deterministic cache key covering everything about the request
    /// except its time range, so all windows over the same series share
    /// one entry.
    fn derive_cache_key(&self, snapshot: &RequestSnapshot, extra: &str) -> String;

    /// Fails with `QueryParse` for requests that carry no time range.
    fn parse_time_range_query(
        &self,
        snapshot: &RequestSnapshot,
    ) -> Result<TimeRangeQuery, ProxyError>;

    /// Rewrites the outbound request to fetch exactly `extent`.
    fn set_extent(&self, snapshot: &mut RequestSnapshot, extent: &Extent);

    fn marshal_timeseries(&self, ts: &Timeseries) -> Result<Vec<u8>>;

    fn unmarshal_timeseries(&self, data: &[u8]) -> Result<Timeseries>;

    fn unmarshal_instantaneous(&self, data: &[u8]) -> Result<Timeseries>;

    /// The request to issue for a current-instant sample, when the
    /// dialect supports one.
    fn fast_forward_request(&self, snapshot: &RequestSnapshot) -> Option<RequestSnapshot>;

    /// Routing hook: true for paths whose requests are range queries.
    fn is_range_path(&self, path: &str) -> bool;
}
