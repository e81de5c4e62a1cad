use serde_json::json;

use chronocache::config::OriginConfig;
use chronocache::origins::tsjson::TsJsonClient;
use chronocache::origins::OriginClient;
use chronocache::timeseries::{
    DataPoint, Extent, ExtentList, FrameEnvelope, FrameHead, SeriesEnvelope, Timeseries,
};

fn sparse(points: &[(i64, f64)], step: i64, extents: &[(i64, i64)]) -> SeriesEnvelope {
    SeriesEnvelope {
        data: points.iter().map(|(t, v)| DataPoint(*t, json!(v))).collect(),
        extents: ExtentList(extents.iter().map(|(s, e)| Extent::new(*s, *e)).collect()),
        step,
    }
}

fn tsjson() -> TsJsonClient {
    let cfg: OriginConfig =
        serde_yaml::from_str("name: test\norigin_url: http://origin.local\n").expect("config");
    TsJsonClient::new(cfg)
}

#[test]
fn sparse_merge_compresses_extents_and_sorts() {
    let mut base = sparse(&[(100, 1.0), (110, 1.0)], 10, &[(100, 110)]);
    let tail = sparse(&[(120, 2.0), (130, 2.0)], 10, &[(120, 130)]);
    base.merge(true, vec![tail]);
    assert_eq!(base.extents, ExtentList(vec![Extent::new(100, 130)]));
    let times: Vec<i64> = base.data.iter().map(DataPoint::time).collect();
    assert_eq!(times, vec![100, 110, 120, 130]);
}

#[test]
fn sparse_merge_dedups_last_writer_wins() {
    let mut base = sparse(&[(100, 1.0), (110, 1.0)], 10, &[(100, 110)]);
    let overlap = sparse(&[(110, 9.0), (120, 9.0)], 10, &[(110, 120)]);
    base.merge(true, vec![overlap]);
    assert_eq!(base.timestamp_count(), 3);
    let at_110 = base.data.iter().find(|dp| dp.time() == 110).unwrap();
    assert_eq!(at_110.value(), &json!(9.0));
}

#[test]
fn sparse_crop_to_range_is_inclusive() {
    let mut se = sparse(&[(100, 1.0), (110, 1.0), (120, 1.0), (130, 1.0)], 10, &[(100, 130)]);
    se.crop_to_range(Extent::new(110, 120));
    let times: Vec<i64> = se.data.iter().map(DataPoint::time).collect();
    assert_eq!(times, vec![110, 120]);
    assert_eq!(se.extents, ExtentList(vec![Extent::new(110, 120)]));
}

#[test]
fn sparse_crop_to_size_drops_oldest() {
    let mut se = sparse(
        &[(100, 1.0), (110, 1.0), (120, 1.0), (130, 1.0), (140, 1.0)],
        10,
        &[(100, 140)],
    );
    se.crop_to_size(3, 1_000, Extent::new(100, 140));
    let times: Vec<i64> = se.data.iter().map(DataPoint::time).collect();
    assert_eq!(times, vec![120, 130, 140]);
    assert_eq!(se.extents, ExtentList(vec![Extent::new(120, 140)]));
}

#[test]
fn sparse_crop_to_size_clips_future_samples_first() {
    let mut se = sparse(&[(100, 1.0), (110, 1.0), (120, 1.0)], 10, &[(100, 120)]);
    se.crop_to_size(10, 110, Extent::new(100, 120));
    let times: Vec<i64> = se.data.iter().map(DataPoint::time).collect();
    assert_eq!(times, vec![100, 110]);
}

#[test]
fn sparse_round_trip() {
    let client = tsjson();
    let se = sparse(&[(100, 1.5), (110, 2.5)], 10, &[(100, 110)]);
    let ts = Timeseries::Sparse(se.clone());
    let bytes = client.marshal_timeseries(&ts).unwrap();
    let back = client.unmarshal_timeseries(&bytes).unwrap();
    match back {
        Timeseries::Sparse(got) => {
            assert_eq!(got.data, se.data);
            assert_eq!(got.extents.compress(10), se.extents.compress(10));
            assert_eq!(got.step, se.step);
        }
        Timeseries::Frames(_) => panic!("sparse decoded as frames"),
    }
}

fn frame(start: i64, period: i64, values: &[Option<f64>]) -> FrameEnvelope {
    let count = values.len() as i64;
    FrameEnvelope {
        data: vec![values
            .iter()
            .map(|v| v.map(|f| json!(f)).unwrap_or(serde_json::Value::Null))
            .collect()],
        meta: vec![serde_json::from_value(json!({"label": "cpu"})).unwrap()],
        version: "DF4".to_string(),
        head: FrameHead { count, start, period },
        step: period,
        extents: ExtentList(vec![Extent::new(start, start + (count - 1) * period)]),
    }
}

#[test]
fn frames_round_trip_by_version_sniff() {
    let client = tsjson();
    let fe = frame(100, 10, &[Some(1.0), Some(2.0), Some(3.0)]);
    let bytes = client
        .marshal_timeseries(&Timeseries::Frames(fe.clone()))
        .unwrap();
    let back = client.unmarshal_timeseries(&bytes).unwrap();
    match back {
        Timeseries::Frames(got) => {
            assert_eq!(got.head, fe.head);
            assert_eq!(got.data, fe.data);
        }
        Timeseries::Sparse(_) => panic!("frames decoded as sparse"),
    }
}

#[test]
fn frames_merge_fills_holes_with_null() {
    let mut base = frame(100, 10, &[Some(1.0), Some(2.0)]); // [100,110]
    let tail = frame(140, 10, &[Some(5.0)]); // [140,140]
    base.merge(true, vec![tail]);

    assert_eq!(base.head.start, 100);
    assert_eq!(base.head.count, 5);
    assert_eq!(base.head.start + (base.head.count - 1) * base.head.period, 140);
    let row = &base.data[0];
    assert_eq!(row.len(), 5);
    assert!(row[2].is_null());
    assert!(row[3].is_null());
    assert_eq!(row[4], json!(5.0));
}

#[test]
fn frames_merge_preserves_metadata() {
    let mut base = frame(100, 10, &[Some(1.0)]);
    let mut other = frame(110, 10, &[Some(2.0)]);
    other.meta = vec![serde_json::from_value(json!({"label": "mem"})).unwrap()];
    base.merge(true, vec![other]);
    assert_eq!(base.series_count(), 2);
    let labels: Vec<&str> = base
        .meta
        .iter()
        .map(|m| m.get("label").and_then(|v| v.as_str()).unwrap())
        .collect();
    assert!(labels.contains(&"cpu") && labels.contains(&"mem"));
}

#[test]
fn frames_crop_aligns_to_period() {
    let mut fe = frame(100, 10, &[Some(1.0), Some(2.0), Some(3.0), Some(4.0)]); // [100,130]
    fe.crop_to_range(Extent::new(105, 125));
    // bounds round down to 100 and 120
    assert_eq!(fe.head.start, 100);
    assert_eq!(fe.head.start + (fe.head.count - 1) * fe.head.period, 120);
    assert_eq!(fe.data[0].len(), 3);
}

#[test]
fn frames_crop_outside_empties() {
    let mut fe = frame(100, 10, &[Some(1.0), Some(2.0)]);
    fe.crop_to_range(Extent::new(500, 600));
    assert_eq!(fe.head.count, 0);
    assert!(fe.data.is_empty());
    assert!(fe.extents.is_empty());
}

#[test]
fn frames_crop_to_size_drops_leading_slots() {
    let mut fe = frame(100, 10, &[Some(1.0), Some(2.0), Some(3.0), Some(4.0)]);
    fe.crop_to_size(2, 1_000, Extent::new(100, 130));
    assert_eq!(fe.head.start, 120);
    assert_eq!(fe.head.count, 2);
    assert_eq!(fe.data[0], vec![json!(3.0), json!(4.0)]);
    assert_eq!(
        fe.extents,
        ExtentList(vec![Extent::new(120, 130)])
    );
}

#[test]
fn frames_unknown_step_until_engine_sets_it() {
    let client = tsjson();
    let raw = json!({
        "data": [[1.0, 2.0]],
        "meta": [{"label": "cpu"}],
        "version": "DF4",
        "head": {"count": 2, "start": 100, "period": 10}
    });
    let ts = client
        .unmarshal_timeseries(raw.to_string().as_bytes())
        .unwrap();
    assert_eq!(ts.step(), 0);
    let mut ts = ts;
    ts.set_step(10);
    assert_eq!(ts.step(), 10);
}

#[test]
fn variant_dispatch_skips_mixed_merges() {
    let mut ts = Timeseries::Sparse(sparse(&[(100, 1.0)], 10, &[(100, 100)]));
    let other = Timeseries::Frames(frame(100, 10, &[Some(1.0)]));
    ts.merge(true, vec![other]);
    assert_eq!(ts.value_count(), 1);
}
