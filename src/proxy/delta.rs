use std::sync::Arc;
use std::time::Duration;

use http::{HeaderMap, StatusCode};

use crate::cache::{clamp_ttl, unix_now, unwrap_payload, wrap_payload, CachedReference, LookupStatus};
use crate::config::EvictionMethod;
use crate::error::{CacheError, ProxyError};
use crate::metrics;
use crate::origins::tsjson::instantaneous_to_series;
use crate::origins::OriginClient;
use crate::proxy::object::{client_no_cache, object_proxy_request, strip_conditional_headers};
use crate::proxy::{
    error_response, proxy_only, EngineContext, EngineResponse, RequestSnapshot,
};
use crate::timeseries::{Extent, ExtentList, TimeRangeQuery, Timeseries};

const SERIES_CONTENT_TYPE: &str = "application/json";

/// Time-range-aware cache path: compute the delta between the request and
/// the cached extents, fetch only the missing sub-ranges, merge, persist,
/// and answer with the crop the client asked for.
pub async fn delta_proxy_request(ctx: &EngineContext, snapshot: &RequestSnapshot) -> EngineResponse {
    let cfg = ctx.client.configuration().clone();
    let mut trq = match ctx.client.parse_time_range_query(snapshot) {
        Ok(trq) => trq,
        Err(err) => {
            log::debug!("time range parse failed, proxying: {err}");
            return proxy_only(ctx, snapshot).await;
        }
    };
    let now = unix_now();
    trq.normalize_extent(now, cfg.backfill_tolerance_secs as i64);
    if trq.extent.end < trq.extent.start {
        // the whole window sits inside the backfill tolerance
        return proxy_only(ctx, snapshot).await;
    }

    if client_no_cache(snapshot) {
        return object_proxy_request(ctx, snapshot, true).await;
    }

    let key = ctx.client.derive_cache_key(snapshot, "");
    let guard = ctx.locks.acquire(&key).await;

    // a transient backend failure still serves from origin, but skips the
    // write-back to avoid thrash
    let mut write_ok = true;
    let mut cts = match query_timeseries(ctx, &key) {
        Ok(ts) => ts,
        Err(err) => {
            if matches!(err, CacheError::BackendUnavailable(_)) {
                write_ok = false;
            }
            return fetch_full(ctx, snapshot, &trq, &key, write_ok).await;
        }
    };
    if cts.step() == 0 {
        cts.set_step(trq.step_secs);
    }

    let mut missing = trq.calculate_deltas(cts.extents());
    if missing.is_empty() && gap_ratio(&cts, &trq) > cfg.missing_tolerance_ratio {
        // cached coverage is too hole-ridden to trust
        missing = ExtentList::single(trq.extent);
    }

    if missing.is_empty() {
        drop(guard);
        let mut out = cts;
        out.crop_to_range(trq.extent);
        return respond_with_series(ctx, &out, HeaderMap::new(), LookupStatus::Hit);
    }

    let full_range_miss = missing.len() == 1 && missing.0[0] == trq.extent;

    let mut handles = Vec::with_capacity(missing.len());
    for e in missing.0.iter().copied() {
        let ctx = ctx.clone();
        let mut req = snapshot.clone();
        strip_conditional_headers(&mut req.headers);
        ctx.client.set_extent(&mut req, &e);
        let trq_extent = trq.extent;
        let step = trq.step_secs;
        handles.push(tokio::spawn(async move {
            fetch_extent(ctx, req, e, trq_extent, step).await
        }));
    }

    let ff_handle = ctx.client.fast_forward_request(snapshot).map(|req| {
        let ctx = ctx.clone();
        let step = trq.step_secs;
        tokio::spawn(async move { fetch_fast_forward(ctx, req, step).await })
    });

    // single-threaded merge once every fetch has landed; completion order
    // is irrelevant
    let mut merge_list = Vec::new();
    let mut response_headers = HeaderMap::new();
    let mut failed = 0usize;
    for handle in handles {
        match handle.await {
            Ok(Some((nts, headers))) => {
                if response_headers.is_empty() {
                    response_headers = headers;
                }
                merge_list.push(nts);
            }
            Ok(None) => failed += 1,
            Err(err) => {
                let kind = if err.is_cancelled() {
                    ProxyError::Cancelled
                } else {
                    ProxyError::Origin {
                        status: 502,
                        message: err.to_string(),
                    }
                };
                log::warn!("delta fetch task failed: {kind}");
                failed += 1;
            }
        }
    }

    if merge_list.is_empty() && failed > 0 {
        drop(guard);
        return error_response(&ProxyError::Origin {
            status: 502,
            message: "all delta fetches failed".to_string(),
        });
    }

    cts.merge(true, merge_list);

    // The write-back runs concurrently with the response, under the
    // still-held key lock. A degraded merge is never persisted.
    if failed == 0 && write_ok {
        let ttl = clamp_ttl(cfg.timeseries_ttl(), cfg.min_ttl(), cfg.max_ttl());
        let ctx_wb = ctx.clone();
        let key_wb = key.clone();
        let cfg_wb = cfg.clone();
        let trq_extent = trq.extent;
        let mut wb = cts.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let now = unix_now();
            match cfg_wb.timeseries_eviction_method {
                EvictionMethod::Oldest => {
                    wb.crop_to_range(Extent::new(now - cfg_wb.max_value_age_secs as i64, now));
                }
                EvictionMethod::Lru => {
                    wb.crop_to_size(
                        cfg_wb.timeseries_retention_factor,
                        now - cfg_wb.backfill_tolerance_secs as i64,
                        trq_extent,
                    );
                }
            }
            write_timeseries(&ctx_wb, &key_wb, &wb, ttl);
        });
    } else {
        drop(guard);
    }

    let mut out = cts;
    out.crop_to_range(trq.extent);
    if let Some(handle) = ff_handle {
        if let Ok(Some(ff)) = handle.await {
            out.merge(true, vec![ff]);
            // fast-forward data goes stale quickly; tell the client so
            if let Ok(v) = format!("max-age={}", cfg.fast_forward_ttl_secs).parse() {
                response_headers.insert("Cache-Control", v);
            }
        }
    }

    let label = if full_range_miss {
        LookupStatus::RangeMiss
    } else {
        LookupStatus::PartialHit
    };
    respond_with_series(ctx, &out, response_headers, label)
}

/// One origin call for one missing sub-extent. Failures surface as None;
/// the driver degrades coverage instead of failing the request. Counted
/// on the origin-fetch metric, never the per-request one: a single client
/// request may fan out into many of these.
async fn fetch_extent(
    ctx: EngineContext,
    req: RequestSnapshot,
    extent: Extent,
    requested: Extent,
    step: i64,
) -> Option<(Timeseries, HeaderMap)> {
    let cfg = ctx.client.configuration();
    let label = if extent == requested { "rmiss" } else { "phit" };

    let (status, headers, body) = match ctx.fetch_origin(&req).await {
        Ok(resp) => resp,
        Err(err) => {
            log::warn!("origin fetch for {:?} failed: {err}", extent);
            return None;
        }
    };
    metrics::record_origin_fetch(&cfg.name, &cfg.origin_type, label, status.as_u16());

    if status != StatusCode::OK || body.is_empty() {
        return None;
    }
    let mut nts = match ctx.client.unmarshal_timeseries(&body) {
        Ok(ts) => ts,
        Err(err) => {
            log::warn!("origin series unmarshaling failed: {err}");
            return None;
        }
    };
    nts.set_step(step);
    nts.set_extents(ExtentList::single(extent));
    Some((nts, headers))
}

/// The single-instant query whose result rides along in the response but
/// is never written back.
async fn fetch_fast_forward(
    ctx: EngineContext,
    req: RequestSnapshot,
    step: i64,
) -> Option<Timeseries> {
    let (status, _, body) = ctx.fetch_origin(&req).await.ok()?;
    if status != StatusCode::OK || body.is_empty() {
        return None;
    }
    let ts = ctx.client.unmarshal_instantaneous(&body).ok()?;
    instantaneous_to_series(ts, step)
}

/// Cold path: nothing cached under the key, fetch the full normalized
/// range in one call.
async fn fetch_full(
    ctx: &EngineContext,
    snapshot: &RequestSnapshot,
    trq: &TimeRangeQuery,
    key: &str,
    write_ok: bool,
) -> EngineResponse {
    let cfg = ctx.client.configuration();
    let mut origin = snapshot.clone();
    strip_conditional_headers(&mut origin.headers);
    ctx.client.set_extent(&mut origin, &trq.extent);

    let (status, headers, body) = match ctx.fetch_origin(&origin).await {
        Ok(resp) => resp,
        Err(err) => {
            log::warn!("origin fetch failed for {key}: {err}");
            return error_response(&err);
        }
    };
    if status != StatusCode::OK {
        return EngineResponse::new(status, headers, body, LookupStatus::KeyMiss);
    }

    let mut nts = match ctx.client.unmarshal_timeseries(&body) {
        Ok(ts) => ts,
        Err(err) => {
            log::warn!("origin series unmarshaling failed for {key}: {err}");
            return EngineResponse::new(status, headers, body, LookupStatus::ProxyOnly);
        }
    };
    nts.set_step(trq.step_secs);
    nts.set_extents(ExtentList::single(trq.extent));

    if write_ok {
        let ttl = clamp_ttl(cfg.timeseries_ttl(), cfg.min_ttl(), cfg.max_ttl());
        write_timeseries(ctx, key, &nts, ttl);
    }

    let mut out = nts;
    out.crop_to_range(trq.extent);
    respond_with_series(ctx, &out, headers, LookupStatus::KeyMiss)
}

// How much of the requested window is actually populated in the cached
// series, as a missing fraction.
fn gap_ratio(cts: &Timeseries, trq: &TimeRangeQuery) -> f64 {
    let step = trq.step_secs.max(1);
    let expected = (trq.extent.end - trq.extent.start) / step + 1;
    if expected <= 0 {
        return 0.0;
    }
    let mut cropped = cts.clone();
    cropped.crop_to_range(trq.extent);
    let present = cropped.timestamp_count() as i64;
    ((expected - present).max(0)) as f64 / expected as f64
}

/// Loads the cached series: by reference on memory backends, decoded
/// through the wire wrapper elsewhere. Undecodable entries are removed.
pub fn query_timeseries(ctx: &EngineContext, key: &str) -> Result<Timeseries, CacheError> {
    let cache_name = ctx.cache.configuration().name;
    let result = if let Some(memory) = ctx.cache.as_memory() {
        match memory.retrieve_reference(key, true) {
            Ok(CachedReference::Timeseries(ts)) => Ok((*ts).clone()),
            Ok(CachedReference::Document(_)) => Err(CacheError::KeyNotFound),
            Err(err) => Err(err),
        }
    } else {
        match ctx.cache.retrieve(key, true) {
            Ok(raw) => match unwrap_payload(&raw) {
                Ok(payload) => match ctx.client.unmarshal_timeseries(&payload) {
                    Ok(ts) => Ok(ts),
                    Err(err) => {
                        log::warn!("cached series unmarshaling failed for {key}: {err}");
                        ctx.cache.remove(key);
                        Err(CacheError::CorruptEntry)
                    }
                },
                Err(err) => {
                    ctx.cache.remove(key);
                    Err(err)
                }
            },
            Err(err) => Err(err),
        }
    };
    let status = if result.is_ok() { "hit" } else { "miss" };
    metrics::record_cache_operation(&cache_name, "retrieve", status);
    result
}

/// Persists the merged series under the already-held key lock.
pub fn write_timeseries(ctx: &EngineContext, key: &str, ts: &Timeseries, ttl: Duration) {
    let cfg = ctx.client.configuration();
    let backend_cfg = ctx.cache.configuration();
    let result = if let Some(memory) = ctx.cache.as_memory() {
        memory.store_reference(key, CachedReference::Timeseries(Arc::new(ts.clone())), ttl)
    } else {
        match ctx.client.marshal_timeseries(ts) {
            Ok(serialized) => {
                let compress = cfg.is_compressible(SERIES_CONTENT_TYPE);
                ctx.cache.store(key, wrap_payload(&serialized, compress), ttl)
            }
            Err(err) => {
                log::warn!("series serialization failed for {key}: {err}");
                return;
            }
        }
    };
    match result {
        Ok(()) => metrics::record_cache_operation(&backend_cfg.name, "store", "ok"),
        Err(err) => {
            log::warn!("cache write failed for {key}: {err}");
            metrics::record_cache_operation(&backend_cfg.name, "store", "error");
        }
    }
}

/// Marshals the series and finishes the response. Headers come from one
/// of the delta responses so the cache write never competes with them.
fn respond_with_series(
    ctx: &EngineContext,
    ts: &Timeseries,
    mut headers: HeaderMap,
    lookup: LookupStatus,
) -> EngineResponse {
    let body = match ctx.client.marshal_timeseries(ts) {
        Ok(body) => body,
        Err(err) => {
            log::warn!("response serialization failed: {err}");
            return error_response(&ProxyError::Origin {
                status: 500,
                message: err.to_string(),
            });
        }
    };
    headers.remove("Transfer-Encoding");
    headers.remove("Content-Range");
    if !headers.contains_key("Content-Type") {
        if let Ok(v) = SERIES_CONTENT_TYPE.parse() {
            headers.insert("Content-Type", v);
        }
    }
    if let Ok(v) = body.len().to_string().parse() {
        headers.insert("Content-Length", v);
    }
    if let Ok(v) = lookup.as_str().parse() {
        headers.insert(crate::constants::PROXY_RESULT_KEY, v);
    }
    EngineResponse::new(StatusCode::OK, headers, bytes::Bytes::from(body), lookup)
}
