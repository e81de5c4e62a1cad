use http::{HeaderMap, StatusCode};

use chronocache::proxy::document::{CachingPolicy, HttpDocument};
use chronocache::proxy::ranges::{ByteRange, ByteRangeList};

fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (k, v) in pairs {
        map.insert(
            http::header::HeaderName::from_bytes(k.as_bytes()).unwrap(),
            v.parse().unwrap(),
        );
    }
    map
}

#[test]
fn policy_parses_directives_and_validators() {
    let h = headers(&[
        ("Cache-Control", "max-age=120, must-revalidate, no-transform"),
        ("ETag", "\"abc\""),
        ("Last-Modified", "Mon, 01 Jan 2024 00:00:00 GMT"),
    ]);
    let policy = CachingPolicy::from_response(&h);
    assert_eq!(policy.max_age, Some(120));
    assert!(policy.must_revalidate);
    assert!(policy.no_transform);
    assert!(!policy.no_cache);
    assert_eq!(policy.etag.as_deref(), Some("\"abc\""));
    assert!(policy.has_validators());
}

#[test]
fn policy_s_maxage_wins_over_nothing_and_no_store_sticks() {
    let h = headers(&[("Cache-Control", "no-store, s-maxage=30")]);
    let policy = CachingPolicy::from_response(&h);
    assert!(policy.no_store);
    assert_eq!(policy.max_age, Some(30));
    assert!(!policy.is_fresh(0));
}

#[test]
fn single_content_range_body_populates_parts() {
    let h = headers(&[
        ("Content-Type", "application/octet-stream"),
        ("Content-Range", "bytes 10-13/100"),
    ]);
    let doc = HttpDocument::from_response(StatusCode::PARTIAL_CONTENT, &h, b"WXYZ");
    assert_eq!(doc.content_length, 100);
    assert_eq!(doc.ranges, ByteRangeList::single(ByteRange::new(10, 13)));
    assert_eq!(doc.body_for_range(ByteRange::new(11, 12)).unwrap(), b"XY");
}

#[test]
fn multipart_byteranges_body_populates_parts() {
    let body = b"--frame\r\n\
Content-Type: application/octet-stream\r\n\
Content-Range: bytes 0-2/10\r\n\r\n\
abc\r\n\
--frame\r\n\
Content-Range: bytes 7-9/10\r\n\r\n\
xyz\r\n\
--frame--\r\n";
    let h = headers(&[(
        "Content-Type",
        "multipart/byteranges; boundary=frame",
    )]);
    let mut doc = HttpDocument::default();
    doc.status_code = 206;
    doc.parse_partial_content_body(&h, body);

    assert_eq!(doc.content_length, 10);
    assert_eq!(
        doc.ranges,
        ByteRangeList(vec![ByteRange::new(0, 2), ByteRange::new(7, 9)])
    );
    assert_eq!(doc.body_for_range(ByteRange::new(7, 9)).unwrap(), b"xyz");
}

#[test]
fn add_part_overlap_last_writer_wins_and_coalesces() {
    let mut doc = HttpDocument {
        content_length: 10,
        ..Default::default()
    };
    doc.add_part(ByteRange::new(0, 4), b"AAAAA");
    doc.add_part(ByteRange::new(3, 7), b"BBBBB");

    assert_eq!(doc.ranges, ByteRangeList::single(ByteRange::new(0, 7)));
    assert_eq!(doc.body_for_range(ByteRange::new(0, 7)).unwrap(), b"AAABBBBB");
}

#[test]
fn parts_covering_the_whole_object_collapse_to_a_body() {
    let mut doc = HttpDocument {
        content_length: 6,
        ..Default::default()
    };
    doc.add_part(ByteRange::new(0, 2), b"abc");
    doc.add_part(ByteRange::new(3, 5), b"def");
    assert!(!doc.has_full_body());

    doc.fulfill_content_body();
    assert!(doc.has_full_body());
    assert_eq!(doc.body, b"abcdef");
    assert!(doc.ranges.is_empty());
}

#[test]
fn prepare_for_store_strips_instance_headers_and_transients() {
    let h = headers(&[
        ("Date", "Mon, 01 Jan 2024 00:00:00 GMT"),
        ("Content-Range", "bytes 0-1/2"),
        ("Content-Type", "text/plain"),
        ("X-Chronocache-Result", "hit"),
    ]);
    let mut doc = HttpDocument::from_response(StatusCode::OK, &h, b"ok");
    doc.is_fulfillment = true;
    doc.is_loaded = true;

    doc.prepare_for_store();
    let names: Vec<&str> = doc.headers.iter().map(|(k, _)| k.as_str()).collect();
    assert!(names.iter().any(|n| n.eq_ignore_ascii_case("content-type")));
    assert!(!names.iter().any(|n| n.eq_ignore_ascii_case("date")));
    assert!(!names.iter().any(|n| n.eq_ignore_ascii_case("content-range")));
    assert!(!names.iter().any(|n| n.eq_ignore_ascii_case("x-chronocache-result")));
    assert!(!doc.is_fulfillment && !doc.is_loaded);
}

#[test]
fn multipart_render_covers_each_requested_range() {
    let mut doc = HttpDocument {
        content_length: 10,
        content_type: "text/plain".to_string(),
        ..Default::default()
    };
    doc.set_body(b"0123456789");
    doc.content_length = 10;

    let ranges = ByteRangeList(vec![ByteRange::new(0, 1), ByteRange::new(8, 9)]);
    let (ct, body) = doc.multipart_body(&ranges).unwrap();
    assert!(ct.starts_with("multipart/byteranges"));
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("Content-Range: bytes 0-1/10"));
    assert!(text.contains("Content-Range: bytes 8-9/10"));
    assert!(text.contains("01"));
    assert!(text.contains("89"));
}
