use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};

use crate::constants;
use crate::proxy::ranges::{parse_content_range, ByteRange, ByteRangeList};

pub const MULTIPART_BOUNDARY: &str = "chronocache-part";

/// Cache-relevant response directives plus the validators needed for
/// conditional revalidation. Validator strings are kept opaque and echoed
/// back to the origin verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CachingPolicy {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub must_revalidate: bool,
    #[serde(default)]
    pub no_cache: bool,
    #[serde(default)]
    pub no_store: bool,
    #[serde(default)]
    pub no_transform: bool,
    #[serde(default)]
    pub max_age: Option<u64>,
    /// Unix second after which the entry is stale. Zero means never fresh.
    #[serde(default)]
    pub fresh_until: i64,
}

impl CachingPolicy {
    pub fn from_response(headers: &HeaderMap) -> Self {
        let mut policy = CachingPolicy::default();
        if let Some(cc) = headers.get("Cache-Control").and_then(|v| v.to_str().ok()) {
            for directive in cc.split(',') {
                let directive = directive.trim();
                match directive {
                    "no-cache" => policy.no_cache = true,
                    "no-store" => policy.no_store = true,
                    "no-transform" => policy.no_transform = true,
                    "must-revalidate" | "proxy-revalidate" => policy.must_revalidate = true,
                    _ => {
                        if let Some(raw) = directive
                            .strip_prefix("s-maxage=")
                            .or_else(|| directive.strip_prefix("max-age="))
                        {
                            policy.max_age = raw.trim().parse().ok();
                        }
                    }
                }
            }
        }
        policy.etag = headers
            .get("ETag")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        policy.last_modified = headers
            .get("Last-Modified")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        policy
    }

    pub fn is_fresh(&self, now: i64) -> bool {
        !self.no_cache && self.fresh_until > now
    }

    pub fn has_validators(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }
}

/// A cached HTTP response. Either `body` holds the complete object and
/// `ranges` is empty, or `ranges` lists the byte spans present in
/// `range_parts`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpDocument {
    pub status_code: u16,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Vec<u8>,
    #[serde(default)]
    pub content_type: String,
    /// Total object length; -1 when unknown.
    #[serde(default)]
    pub content_length: i64,
    #[serde(default)]
    pub caching_policy: CachingPolicy,
    #[serde(default, skip_serializing_if = "ByteRangeList::is_empty")]
    pub ranges: ByteRangeList,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub range_parts: Vec<(ByteRange, Vec<u8>)>,

    #[serde(skip)]
    pub is_fulfillment: bool,
    #[serde(skip)]
    pub is_loaded: bool,
    #[serde(skip)]
    pub range_parts_loaded: bool,
}

impl HttpDocument {
    pub fn from_response(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Self {
        let mut doc = HttpDocument {
            status_code: status.as_u16(),
            status: status
                .canonical_reason()
                .unwrap_or_default()
                .to_string(),
            caching_policy: CachingPolicy::from_response(headers),
            content_length: headers
                .get("Content-Length")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(-1),
            ..Default::default()
        };
        doc.set_headers(headers);

        let ct = headers
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !ct.starts_with(constants::VALUE_MULTIPART_BYTE_RANGES) {
            doc.content_type = ct.to_string();
        }

        if status == StatusCode::PARTIAL_CONTENT && !body.is_empty() {
            doc.parse_partial_content_body(headers, body);
            doc.fulfill_content_body();
        } else {
            doc.set_body(body);
        }
        doc
    }

    pub fn set_headers(&mut self, headers: &HeaderMap) {
        self.headers = headers
            .iter()
            .filter_map(|(k, v)| Some((k.as_str().to_string(), v.to_str().ok()?.to_string())))
            .collect();
    }

    pub fn headers_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                http::header::HeaderName::from_bytes(k.as_bytes()),
                http::header::HeaderValue::from_str(v),
            ) {
                map.append(name, value);
            }
        }
        map
    }

    /// Replaces stored values for every header present in `headers`,
    /// keeping the rest. Used when a 304 refreshes entity metadata; body
    /// framing headers stay untouched since a 304 carries no body.
    pub fn update_headers(&mut self, headers: &HeaderMap) {
        let keep = ["content-length", "content-type", "transfer-encoding"];
        for key in headers.keys() {
            let name = key.as_str();
            if keep.contains(&name) {
                continue;
            }
            self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
        }
        for (k, v) in headers.iter() {
            if keep.contains(&k.as_str()) {
                continue;
            }
            if let Ok(v) = v.to_str() {
                self.headers.push((k.as_str().to_string(), v.to_string()));
            }
        }
    }

    pub fn set_body(&mut self, body: &[u8]) {
        self.body = body.to_vec();
        self.ranges = ByteRangeList::default();
        self.range_parts.clear();
        if self.content_length < 0 {
            self.content_length = body.len() as i64;
        }
    }

    pub fn has_full_body(&self) -> bool {
        self.ranges.is_empty() && !self.body.is_empty()
    }

    /// Ingests a 206 body: either one span described by `Content-Range`
    /// or a multipart/byteranges payload.
    pub fn parse_partial_content_body(&mut self, headers: &HeaderMap, body: &[u8]) {
        if let Some(cr) = headers.get("Content-Range").and_then(|v| v.to_str().ok()) {
            if let Some((range, total)) = parse_content_range(cr) {
                self.content_length = total as i64;
                let take = (range.len() as usize).min(body.len());
                if take > 0 {
                    self.add_part(
                        ByteRange::new(range.start, range.start + take as u64 - 1),
                        &body[..take],
                    );
                }
            }
            return;
        }

        let ct = headers
            .get("Content-Type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if let Some(boundary) = ct
            .split(';')
            .map(str::trim)
            .find_map(|p| p.strip_prefix("boundary="))
        {
            self.parse_multipart_body(boundary.trim_matches('"'), body);
        }
    }

    // Part payloads are binary, so the walk stays on raw bytes; only part
    // heads are treated as text.
    fn parse_multipart_body(&mut self, boundary: &str, body: &[u8]) {
        let marker = format!("--{boundary}");
        let marker = marker.as_bytes();
        let mut cursor = match find_subslice(body, marker) {
            Some(pos) => pos + marker.len(),
            None => return,
        };
        loop {
            let rest = &body[cursor..];
            if rest.starts_with(b"--") {
                break;
            }
            let segment_end = find_subslice(rest, marker).unwrap_or(rest.len());
            let segment = &rest[..segment_end];
            cursor += segment_end + marker.len();
            let done = segment_end == rest.len();

            if let Some(split) = find_subslice(segment, b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&segment[..split]);
                let mut payload = &segment[split + 4..];
                if payload.ends_with(b"\r\n") {
                    payload = &payload[..payload.len() - 2];
                }
                if let Some((range, total)) = head
                    .lines()
                    .find_map(|l| l.strip_prefix("Content-Range:").map(str::trim))
                    .and_then(parse_content_range)
                {
                    self.content_length = total as i64;
                    let take = (range.len() as usize).min(payload.len());
                    if take > 0 {
                        self.add_part(
                            ByteRange::new(range.start, range.start + take as u64 - 1),
                            &payload[..take],
                        );
                    }
                }
            }
            if done {
                break;
            }
        }
    }

    /// Writes `data` over the stored parts. Later writes win on overlap;
    /// adjacent blocks coalesce, so part keys are always disjoint.
    pub fn add_part(&mut self, range: ByteRange, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let mut blocks = std::mem::take(&mut self.range_parts);

        // carve the new write's span out of the existing blocks
        let mut carved: Vec<(ByteRange, Vec<u8>)> = Vec::with_capacity(blocks.len() + 1);
        for (r, bytes) in blocks.drain(..) {
            if r.end < range.start || r.start > range.end {
                carved.push((r, bytes));
                continue;
            }
            if r.start < range.start {
                let keep = (range.start - r.start) as usize;
                carved.push((ByteRange::new(r.start, range.start - 1), bytes[..keep].to_vec()));
            }
            if r.end > range.end {
                let skip = (range.end + 1 - r.start) as usize;
                carved.push((ByteRange::new(range.end + 1, r.end), bytes[skip..].to_vec()));
            }
        }
        carved.push((range, data.to_vec()));
        carved.sort_by_key(|(r, _)| r.start);

        // coalesce contiguous blocks
        let mut merged: Vec<(ByteRange, Vec<u8>)> = Vec::with_capacity(carved.len());
        for (r, bytes) in carved {
            match merged.last_mut() {
                Some((last, last_bytes)) if last.end + 1 == r.start => {
                    last.end = r.end;
                    last_bytes.extend_from_slice(&bytes);
                }
                _ => merged.push((r, bytes)),
            }
        }

        self.ranges = ByteRangeList(merged.iter().map(|(r, _)| *r).collect());
        self.range_parts = merged;
        self.range_parts_loaded = true;
    }

    /// Collapses the parts into a full body once they cover the entire
    /// object.
    pub fn fulfill_content_body(&mut self) {
        if self.content_length <= 0 || self.range_parts.len() != 1 {
            return;
        }
        let (range, _) = &self.range_parts[0];
        if range.start == 0 && range.end == self.content_length as u64 - 1 {
            let (_, bytes) = self.range_parts.remove(0);
            self.body = bytes;
            self.ranges = ByteRangeList::default();
        }
    }

    /// Extracts the bytes for one requested range, from the full body or
    /// a covering part.
    pub fn body_for_range(&self, r: ByteRange) -> Option<Vec<u8>> {
        if self.has_full_body() {
            let end = (r.end as usize).min(self.body.len().saturating_sub(1));
            if r.start as usize > end {
                return None;
            }
            return Some(self.body[r.start as usize..=end].to_vec());
        }
        for (pr, bytes) in &self.range_parts {
            if pr.start <= r.start && pr.end >= r.end {
                let offset = (r.start - pr.start) as usize;
                return Some(bytes[offset..offset + r.len() as usize].to_vec());
            }
        }
        None
    }

    /// Renders a multipart/byteranges body for a multi-range response.
    pub fn multipart_body(&self, ranges: &ByteRangeList) -> Option<(String, Vec<u8>)> {
        let total = self.content_length.max(0) as u64;
        let mut out = Vec::new();
        for r in &ranges.0 {
            let bytes = self.body_for_range(*r)?;
            out.extend_from_slice(format!("--{MULTIPART_BOUNDARY}\r\n").as_bytes());
            if !self.content_type.is_empty() {
                out.extend_from_slice(format!("Content-Type: {}\r\n", self.content_type).as_bytes());
            }
            out.extend_from_slice(
                format!("Content-Range: {}\r\n\r\n", r.content_range(total)).as_bytes(),
            );
            out.extend_from_slice(&bytes);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(format!("--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
        let ct = format!(
            "{}; boundary={MULTIPART_BOUNDARY}",
            constants::VALUE_MULTIPART_BYTE_RANGES
        );
        Some((ct, out))
    }

    /// Drops hop- and response-instance headers and resets transient state
    /// ahead of persistence.
    pub fn prepare_for_store(&mut self) {
        let result_key = constants::PROXY_RESULT_KEY.to_ascii_lowercase();
        let strip = [
            "date",
            "transfer-encoding",
            "content-range",
            result_key.as_str(),
        ];
        self.headers
            .retain(|(k, _)| !strip.contains(&k.to_ascii_lowercase().as_str()));
        self.is_fulfillment = false;
        self.is_loaded = false;
        self.range_parts_loaded = false;
    }

    /// Approximate footprint for reference-stored eviction accounting.
    pub fn weight(&self) -> u64 {
        let parts: usize = self.range_parts.iter().map(|(_, b)| b.len()).sum();
        (self.body.len() + parts + 512) as u64
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}
