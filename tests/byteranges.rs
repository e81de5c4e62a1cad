use chronocache::proxy::ranges::{
    build_range_header, parse_content_range, parse_range_header, ByteRange, ByteRangeList,
};

fn list(pairs: &[(u64, u64)]) -> ByteRangeList {
    ByteRangeList(pairs.iter().map(|(s, e)| ByteRange::new(*s, *e)).collect())
}

#[test]
fn parse_single_range() {
    assert_eq!(parse_range_header("bytes=0-499", 1000).unwrap(), list(&[(0, 499)]));
    assert_eq!(parse_range_header("bytes=500-", 1000).unwrap(), list(&[(500, 999)]));
    assert_eq!(parse_range_header("bytes=-200", 1000).unwrap(), list(&[(800, 999)]));
}

#[test]
fn parse_multi_range_compresses() {
    let parsed = parse_range_header("bytes=0-99,200-299,100-150", 1000).unwrap();
    assert_eq!(parsed, list(&[(0, 150), (200, 299)]));
}

#[test]
fn parse_rejects_garbage_and_unsatisfiable() {
    assert!(parse_range_header("0-499", 1000).is_err());
    assert!(parse_range_header("bytes=", 1000).is_err());
    assert!(parse_range_header("bytes=a-b", 1000).is_err());
    assert!(parse_range_header("bytes=1000-1100", 1000).is_err());
    assert!(parse_range_header("bytes=-0", 1000).is_err());
}

#[test]
fn parse_clamps_overlong_end() {
    assert_eq!(parse_range_header("bytes=900-2000", 1000).unwrap(), list(&[(900, 999)]));
}

#[test]
fn compress_merges_adjacent() {
    let l = list(&[(100, 199), (0, 99), (300, 400)]);
    assert_eq!(l.compress(), list(&[(0, 199), (300, 400)]));
}

#[test]
fn delta_empty_when_covered() {
    let req = list(&[(10, 50)]);
    let cached = list(&[(0, 99)]);
    assert!(req.calculate_delta(&cached, 500).is_empty());
}

#[test]
fn delta_equals_request_when_disjoint() {
    let req = list(&[(200, 299)]);
    let cached = list(&[(0, 99)]);
    assert_eq!(req.calculate_delta(&cached, 500), req);
}

#[test]
fn delta_partial_overlap() {
    let req = list(&[(50, 250)]);
    let cached = list(&[(0, 99), (200, 299)]);
    assert_eq!(req.calculate_delta(&cached, 500), list(&[(100, 199)]));
}

#[test]
fn fulfillment_delta() {
    // stored [0,99] of a 500-byte object; the full object needs [100,499]
    let req = list(&[(0, 499)]);
    let cached = list(&[(0, 99)]);
    assert_eq!(req.calculate_delta(&cached, 500), list(&[(100, 499)]));
}

#[test]
fn content_range_round_trip() {
    let (r, total) = parse_content_range("bytes 100-499/500").unwrap();
    assert_eq!(r, ByteRange::new(100, 499));
    assert_eq!(total, 500);
    assert_eq!(r.content_range(total), "bytes 100-499/500");
    assert!(parse_content_range("bytes */500").is_none());
}

#[test]
fn range_header_round_trip() {
    let l = list(&[(0, 99), (200, 299)]);
    assert_eq!(build_range_header(&l), "bytes=0-99,200-299");
    assert_eq!(parse_range_header(&build_range_header(&l), 500).unwrap(), l);
}
