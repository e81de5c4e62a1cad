use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

use crate::cache::{
    clamp_ttl, unix_now, unwrap_payload, wrap_payload, CachedReference, LookupStatus,
};
use crate::constants;
use crate::error::CacheError;
use crate::metrics;
use crate::origins::OriginClient;
use crate::proxy::document::HttpDocument;
use crate::proxy::ranges::{build_range_header, parse_range_header, ByteRange, ByteRangeList};
use crate::proxy::{error_response, proxy_only, EngineContext, EngineResponse, RequestSnapshot};

enum RevalidateOutcome {
    NotModified,
    Responded(EngineResponse),
}

/// Opaque-object cache path: freshness, byte-range deltas, fulfillment,
/// and conditional revalidation, all under the request key's lock.
pub async fn object_proxy_request(
    ctx: &EngineContext,
    snapshot: &RequestSnapshot,
    force_revalidate: bool,
) -> EngineResponse {
    if client_directive(snapshot, "no-store") {
        return proxy_only(ctx, snapshot).await;
    }
    let force = force_revalidate || client_directive(snapshot, "no-cache");

    let key = ctx.client.derive_cache_key(snapshot, "");
    let _guard = ctx.locks.acquire(&key).await;

    if !force {
        let neg_key = format!("{}{}", constants::NEGATIVE_KEY_PREFIX, key);
        if let Ok(doc) = query_cache(ctx, &neg_key) {
            return respond_from_doc(&doc, None, LookupStatus::NegativeCacheHit);
        }
    }

    let doc = match query_cache(ctx, &key) {
        Ok(doc) => doc,
        // a transient backend failure still serves from origin, but skips
        // the write-back to avoid thrash
        Err(CacheError::BackendUnavailable(_)) => {
            return fetch_and_cache(ctx, snapshot, &key, LookupStatus::KeyMiss, false).await
        }
        Err(_) => {
            return fetch_and_cache(ctx, snapshot, &key, LookupStatus::KeyMiss, true).await
        }
    };
    serve_document(ctx, snapshot, &key, doc, force).await
}

async fn serve_document(
    ctx: &EngineContext,
    snapshot: &RequestSnapshot,
    key: &str,
    mut doc: HttpDocument,
    force: bool,
) -> EngineResponse {
    let now = unix_now();
    let requested = request_ranges(snapshot, doc.content_length);

    // Fulfillment: ranges are stored but the whole object was asked for,
    // so the effective request becomes the entire object.
    let mut effective = requested.clone();
    let mut fulfillment = false;
    if !doc.ranges.is_empty() && requested.is_none() && doc.content_length > 0 {
        effective = Some(ByteRangeList::single(ByteRange::new(
            0,
            doc.content_length as u64 - 1,
        )));
        fulfillment = true;
        doc.is_fulfillment = true;
    }

    let stale = force || doc.caching_policy.no_cache || !doc.caching_policy.is_fresh(now);
    let mut served_label = LookupStatus::Hit;
    if stale {
        if doc.caching_policy.has_validators() {
            let respond_ranges = if fulfillment { None } else { requested.as_ref() };
            match revalidate(ctx, snapshot, key, &mut doc, respond_ranges).await {
                RevalidateOutcome::NotModified => served_label = LookupStatus::Revalidated,
                RevalidateOutcome::Responded(resp) => return resp,
            }
        } else {
            return fetch_and_cache(ctx, snapshot, key, LookupStatus::KeyMiss, true).await;
        }
    }

    let Some(ranges) = effective else {
        if doc.has_full_body() || doc.content_length == 0 {
            return respond_from_doc(&doc, None, served_label);
        }
        // ranges stored but total length unknown: refetch the whole object
        return fetch_and_cache(ctx, snapshot, key, LookupStatus::RangeMiss, true).await;
    };

    if doc.has_full_body() {
        let respond_ranges = if fulfillment { None } else { Some(&ranges) };
        return respond_from_doc(&doc, respond_ranges, served_label);
    }

    let delta = ranges.calculate_delta(&doc.ranges, doc.content_length.max(0) as u64);
    if delta.is_empty() {
        if fulfillment {
            doc.fulfill_content_body();
            return respond_from_doc(&doc, None, served_label);
        }
        let label = if served_label == LookupStatus::Revalidated {
            served_label
        } else {
            LookupStatus::PartialHit
        };
        return respond_from_doc(&doc, Some(&ranges), label);
    }

    let lookup = if delta == ranges {
        LookupStatus::RangeMiss
    } else {
        LookupStatus::PartialHit
    };
    fetch_delta_and_merge(ctx, snapshot, key, doc, &ranges, &delta, lookup, fulfillment).await
}

/// Fetches the missing byte ranges, merges them into the stored parts,
/// persists, and serves the requested spans.
#[allow(clippy::too_many_arguments)]
async fn fetch_delta_and_merge(
    ctx: &EngineContext,
    snapshot: &RequestSnapshot,
    key: &str,
    mut doc: HttpDocument,
    requested: &ByteRangeList,
    delta: &ByteRangeList,
    lookup: LookupStatus,
    fulfillment: bool,
) -> EngineResponse {
    let mut origin = snapshot.clone();
    strip_conditional_headers(&mut origin.headers);
    if let Ok(v) = build_range_header(delta).parse() {
        origin.headers.insert("Range", v);
    }

    let (status, headers, body) = match ctx.fetch_origin(&origin).await {
        Ok(resp) => resp,
        Err(err) => {
            log::warn!("range delta fetch failed for {key}: {err}");
            return error_response(&err);
        }
    };

    match status {
        StatusCode::PARTIAL_CONTENT => {
            doc.parse_partial_content_body(&headers, &body);
            doc.fulfill_content_body();
        }
        StatusCode::OK => doc.set_body(&body),
        _ => {
            return EngineResponse::new(status, headers, body, LookupStatus::ProxyOnly);
        }
    }

    let ttl = document_ttl(ctx, &doc);
    write_cache(ctx, key, &mut doc, ttl);
    let respond_ranges = if fulfillment { None } else { Some(requested) };
    respond_from_doc(&doc, respond_ranges, lookup)
}

/// Conditional revalidation of a stale entry that carries validators. A
/// 304 refreshes the entry in place; any other response replaces it and
/// is answered directly.
async fn revalidate(
    ctx: &EngineContext,
    snapshot: &RequestSnapshot,
    key: &str,
    doc: &mut HttpDocument,
    respond_ranges: Option<&ByteRangeList>,
) -> RevalidateOutcome {
    let cfg = ctx.client.configuration();
    let mut origin = snapshot.clone();
    strip_conditional_headers(&mut origin.headers);
    origin.headers.remove("Range");
    if let Some(etag) = &doc.caching_policy.etag {
        if let Ok(v) = etag.parse() {
            origin.headers.insert(constants::NAME_IF_NONE_MATCH, v);
        }
    }
    if let Some(lm) = &doc.caching_policy.last_modified {
        if let Ok(v) = lm.parse() {
            origin.headers.insert(constants::NAME_IF_MODIFIED_SINCE, v);
        }
    }

    let (status, headers, body) = match ctx.fetch_origin(&origin).await {
        Ok(resp) => resp,
        Err(err) => {
            // serve stale rather than fail the request
            log::warn!("revalidation fetch failed for {key}: {err}");
            return RevalidateOutcome::NotModified;
        }
    };

    if status == StatusCode::NOT_MODIFIED {
        let now = unix_now();
        doc.update_headers(&headers);
        let extended = document_ttl(ctx, doc).mul_f64(cfg.revalidation_factor.max(1.0));
        let ttl = clamp_ttl(extended, cfg.min_ttl(), cfg.max_ttl());
        doc.caching_policy.fresh_until = now + ttl.as_secs() as i64;
        let mut stored = doc.clone();
        write_cache(ctx, key, &mut stored, ttl);
        return RevalidateOutcome::NotModified;
    }

    // Anything else is a new payload.
    if !status.is_success() {
        return RevalidateOutcome::Responded(
            maybe_negative_cache(ctx, key, status, headers, body).await,
        );
    }
    let mut fresh = HttpDocument::from_response(status, &headers, &body);
    if !cacheable(&fresh) {
        ctx.cache.remove(key);
        let mut headers = headers;
        set_result_header(&mut headers, LookupStatus::ProxyOnly);
        return RevalidateOutcome::Responded(EngineResponse::new(
            status,
            headers,
            body,
            LookupStatus::ProxyOnly,
        ));
    }
    let ttl = document_ttl(ctx, &fresh);
    fresh.caching_policy.fresh_until = unix_now() + ttl.as_secs() as i64;
    write_cache(ctx, key, &mut fresh, ttl);
    RevalidateOutcome::Responded(respond_from_doc(&fresh, respond_ranges, LookupStatus::KeyMiss))
}

/// Full miss path: fetch from origin (forwarding any Range header so only
/// the asked-for spans are cached), store, respond.
async fn fetch_and_cache(
    ctx: &EngineContext,
    snapshot: &RequestSnapshot,
    key: &str,
    lookup: LookupStatus,
    store: bool,
) -> EngineResponse {
    let mut origin = snapshot.clone();
    strip_conditional_headers(&mut origin.headers);

    let (status, headers, body) = match ctx.fetch_origin(&origin).await {
        Ok(resp) => resp,
        Err(err) => {
            log::warn!("origin fetch failed for {key}: {err}");
            return error_response(&err);
        }
    };

    if !status.is_success() {
        return maybe_negative_cache(ctx, key, status, headers, body).await;
    }

    let mut doc = HttpDocument::from_response(status, &headers, &body);
    if !cacheable(&doc) {
        let mut headers = headers;
        set_result_header(&mut headers, LookupStatus::ProxyOnly);
        return EngineResponse::new(status, headers, body, LookupStatus::ProxyOnly);
    }

    let ttl = document_ttl(ctx, &doc);
    doc.caching_policy.fresh_until = unix_now() + ttl.as_secs() as i64;
    if store {
        write_cache(ctx, key, &mut doc, ttl);
    } else {
        doc.prepare_for_store();
    }

    let ranges = request_ranges(snapshot, doc.content_length);
    respond_from_doc(&doc, ranges.as_ref(), lookup)
}

/// Failure responses matching the configured status set are cached under
/// a distinct key prefix with their own short TTL.
async fn maybe_negative_cache(
    ctx: &EngineContext,
    key: &str,
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
) -> EngineResponse {
    let cfg = ctx.client.configuration();
    if let Some(ttl_secs) = cfg.negative_cache.get(&status.as_u16()) {
        let mut doc = HttpDocument::from_response(status, &headers, &body);
        let ttl = Duration::from_secs(*ttl_secs);
        doc.caching_policy.fresh_until = unix_now() + ttl.as_secs() as i64;
        let neg_key = format!("{}{}", constants::NEGATIVE_KEY_PREFIX, key);
        write_cache(ctx, &neg_key, &mut doc, ttl);
    }
    let mut headers = headers;
    set_result_header(&mut headers, LookupStatus::KeyMiss);
    EngineResponse::new(status, headers, body, LookupStatus::KeyMiss)
}

/// Loads and decodes a cached document: by reference on memory backends,
/// through the compression wrapper everywhere else. Corrupt entries are
/// removed so the decode cost is paid once.
pub fn query_cache(ctx: &EngineContext, key: &str) -> Result<HttpDocument, CacheError> {
    let cache_name = ctx.cache.configuration().name;
    let result = if let Some(memory) = ctx.cache.as_memory() {
        match memory.retrieve_reference(key, true) {
            Ok(CachedReference::Document(doc)) => {
                let mut doc = (*doc).clone();
                doc.is_loaded = true;
                doc.range_parts_loaded = !doc.range_parts.is_empty();
                Ok(doc)
            }
            Ok(CachedReference::Timeseries(_)) => Err(CacheError::KeyNotFound),
            Err(err) => Err(err),
        }
    } else {
        match ctx.cache.retrieve(key, true) {
            Ok(raw) => match unwrap_payload(&raw)
                .and_then(|payload| {
                    serde_json::from_slice::<HttpDocument>(&payload)
                        .map_err(|_| CacheError::CorruptEntry)
                }) {
                Ok(mut doc) => {
                    doc.is_loaded = true;
                    doc.range_parts_loaded = !doc.range_parts.is_empty();
                    Ok(doc)
                }
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

/// Persists a document under the already-held key lock. Failures are
/// logged and metered, never surfaced to the client.
pub fn write_cache(ctx: &EngineContext, key: &str, doc: &mut HttpDocument, ttl: Duration) {
    let cfg = ctx.client.configuration();
    doc.prepare_for_store();

    let backend_cfg = ctx.cache.configuration();
    let result = if let Some(memory) = ctx.cache.as_memory() {
        memory.store_reference(key, CachedReference::Document(Arc::new(doc.clone())), ttl)
    } else {
        match serde_json::to_vec(doc) {
            Ok(serialized) => {
                let content_encoding = doc
                    .headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case("content-encoding"))
                    .map(|(_, v)| v.as_str())
                    .unwrap_or_default();
                let compress = cfg.is_compressible(&doc.content_type)
                    && (content_encoding.is_empty() || content_encoding == "identity")
                    && !doc.caching_policy.no_transform;
                ctx.cache.store(key, wrap_payload(&serialized, compress), ttl)
            }
            Err(err) => {
                log::warn!("document serialization failed for {key}: {err}");
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

/// TTL = clamp(response max-age or the configured default, [min, max]).
fn document_ttl(ctx: &EngineContext, doc: &HttpDocument) -> Duration {
    let cfg = ctx.client.configuration();
    let base = doc
        .caching_policy
        .max_age
        .map(Duration::from_secs)
        .unwrap_or_else(|| cfg.timeseries_ttl());
    clamp_ttl(base, cfg.min_ttl(), cfg.max_ttl())
}

fn cacheable(doc: &HttpDocument) -> bool {
    if doc.caching_policy.no_store {
        return false;
    }
    matches!(
        StatusCode::from_u16(doc.status_code),
        Ok(StatusCode::OK) | Ok(StatusCode::PARTIAL_CONTENT) | Ok(StatusCode::NO_CONTENT)
    )
}

fn client_directive(snapshot: &RequestSnapshot, directive: &str) -> bool {
    if directive == "no-cache"
        && snapshot
            .headers
            .get("Pragma")
            .and_then(|v| v.to_str().ok())
            .map(|v| v.contains("no-cache"))
            .unwrap_or(false)
    {
        return true;
    }
    snapshot
        .headers
        .get("Cache-Control")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|d| d.trim() == directive))
        .unwrap_or(false)
}

pub(crate) fn strip_conditional_headers(headers: &mut HeaderMap) {
    headers.remove(constants::NAME_IF_MATCH);
    headers.remove(constants::NAME_IF_UNMODIFIED_SINCE);
    headers.remove(constants::NAME_IF_NONE_MATCH);
    headers.remove(constants::NAME_IF_MODIFIED_SINCE);
}

pub(crate) fn client_no_cache(snapshot: &RequestSnapshot) -> bool {
    client_directive(snapshot, "no-cache")
}

fn request_ranges(snapshot: &RequestSnapshot, content_length: i64) -> Option<ByteRangeList> {
    let raw = snapshot.headers.get("Range")?.to_str().ok()?;
    parse_range_header(raw, content_length.max(0) as u64).ok()
}

fn set_result_header(headers: &mut HeaderMap, status: LookupStatus) {
    if let Ok(v) = status.as_str().parse() {
        headers.insert(constants::PROXY_RESULT_KEY, v);
    }
}

/// Builds the client response from a document: the full body, one range,
/// or a multipart/byteranges payload.
pub fn respond_from_doc(
    doc: &HttpDocument,
    ranges: Option<&ByteRangeList>,
    lookup: LookupStatus,
) -> EngineResponse {
    let mut headers = doc.headers_map();
    headers.remove("Content-Range");
    set_result_header(&mut headers, lookup);

    if ranges.map(ByteRangeList::is_empty).unwrap_or(true) {
        if let Ok(v) = doc.body.len().to_string().parse() {
            headers.insert("Content-Length", v);
        }
        // a document captured from a 206 serves its assembled body as 200
        let status = match StatusCode::from_u16(doc.status_code) {
            Ok(StatusCode::PARTIAL_CONTENT) | Err(_) => StatusCode::OK,
            Ok(status) => status,
        };
        return EngineResponse::new(status, headers, Bytes::from(doc.body.clone()), lookup);
    }

    let ranges = ranges.expect("ranges present");
    if ranges.len() == 1 {
        let r = ranges.0[0];
        let Some(body) = doc.body_for_range(r) else {
            return unsatisfiable(doc, headers, lookup);
        };
        if let Ok(v) = r.content_range(doc.content_length.max(0) as u64).parse() {
            headers.insert("Content-Range", v);
        }
        if let Ok(v) = body.len().to_string().parse() {
            headers.insert("Content-Length", v);
        }
        return EngineResponse::new(
            StatusCode::PARTIAL_CONTENT,
            headers,
            Bytes::from(body),
            lookup,
        );
    }

    let Some((content_type, body)) = doc.multipart_body(ranges) else {
        return unsatisfiable(doc, headers, lookup);
    };
    if let Ok(v) = content_type.parse() {
        headers.insert("Content-Type", v);
    }
    if let Ok(v) = body.len().to_string().parse() {
        headers.insert("Content-Length", v);
    }
    EngineResponse::new(
        StatusCode::PARTIAL_CONTENT,
        headers,
        Bytes::from(body),
        lookup,
    )
}

fn unsatisfiable(
    doc: &HttpDocument,
    mut headers: HeaderMap,
    lookup: LookupStatus,
) -> EngineResponse {
    if let Ok(v) = format!("bytes */{}", doc.content_length.max(0)).parse() {
        headers.insert("Content-Range", v);
    }
    EngineResponse::new(
        StatusCode::RANGE_NOT_SATISFIABLE,
        headers,
        Bytes::new(),
        lookup,
    )
}
