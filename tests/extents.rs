use chronocache::timeseries::{Extent, ExtentList, TimeRangeQuery};

fn list(pairs: &[(i64, i64)]) -> ExtentList {
    ExtentList(pairs.iter().map(|(s, e)| Extent::new(*s, *e)).collect())
}

#[test]
fn compress_merges_overlap_and_step_adjacency() {
    let l = list(&[(200, 250), (100, 150), (160, 180)]);
    let c = l.compress(10);
    assert_eq!(c, list(&[(100, 180), (200, 250)]));
}

#[test]
fn compress_is_idempotent() {
    let cases = [
        list(&[(100, 150), (140, 200), (210, 300)]),
        list(&[(0, 0), (10, 10), (30, 40)]),
        list(&[(5, 5)]),
        ExtentList::default(),
    ];
    for l in cases {
        let once = l.compress(10);
        assert_eq!(once.compress(10), once);
    }
}

#[test]
fn crop_restricts_and_drops() {
    let l = list(&[(100, 150), (200, 250)]);
    assert_eq!(l.crop(Extent::new(120, 230)), list(&[(120, 150), (200, 230)]));
    assert_eq!(l.crop(Extent::new(300, 400)), ExtentList::default());
    assert!(l.outside_of(Extent::new(300, 400)));
    assert!(!l.outside_of(Extent::new(150, 200)));
}

#[test]
fn crop_never_lands_outside_its_window() {
    let l = list(&[(100, 180), (200, 260), (300, 310)]);
    for (s, e) in [(90, 120), (150, 250), (260, 305), (0, 1000)] {
        let window = Extent::new(s, e);
        let cropped = l.crop(window);
        assert!(cropped.is_empty() || !cropped.outside_of(window));
        for x in &cropped.0 {
            assert!(x.start >= s && x.end <= e);
        }
    }
}

#[test]
fn delta_full_hit_is_empty() {
    let cached = list(&[(100, 300)]);
    assert!(cached.calculate_deltas(Extent::new(150, 250), 10).is_empty());
    assert!(cached.calculate_deltas(Extent::new(100, 300), 10).is_empty());
}

#[test]
fn delta_full_miss_is_the_request() {
    let cached = ExtentList::default();
    let req = Extent::new(100, 200);
    assert_eq!(cached.calculate_deltas(req, 10), list(&[(100, 200)]));

    let far = list(&[(1000, 2000)]);
    assert_eq!(far.calculate_deltas(req, 10), list(&[(100, 200)]));
}

#[test]
fn delta_tail() {
    // cache [100,200], request [150,260] -> [210,260]
    let cached = list(&[(100, 200)]);
    assert_eq!(
        cached.calculate_deltas(Extent::new(150, 260), 10),
        list(&[(210, 260)])
    );
}

#[test]
fn delta_head() {
    let cached = list(&[(200, 300)]);
    assert_eq!(
        cached.calculate_deltas(Extent::new(100, 250), 10),
        list(&[(100, 190)])
    );
}

#[test]
fn delta_hole() {
    // cache [100,150] and [200,250], request [120,230] -> [160,190]
    let cached = list(&[(100, 150), (200, 250)]);
    assert_eq!(
        cached.calculate_deltas(Extent::new(120, 230), 10),
        list(&[(160, 190)])
    );
}

#[test]
fn delta_boundary_sample_belongs_to_cache() {
    // a request starting exactly at a cached end only needs start+step on
    let cached = list(&[(100, 200)]);
    assert_eq!(
        cached.calculate_deltas(Extent::new(200, 260), 10),
        list(&[(210, 260)])
    );
}

#[test]
fn delta_and_cached_cover_the_request_disjointly() {
    let cached = list(&[(100, 150), (200, 250), (300, 350)]);
    let req = Extent::new(80, 340);
    let step = 10;
    let deltas = cached.calculate_deltas(req, step);
    let covered = cached.crop(req);

    // disjoint
    for d in &deltas.0 {
        assert!(covered.outside_of(*d), "delta {d:?} overlaps cache");
    }

    // union covers every step instant of the request
    let mut t = req.start;
    while t <= req.end {
        let in_delta = deltas.0.iter().any(|d| d.contains(t));
        let in_cache = covered.0.iter().any(|c| c.contains(t));
        assert!(in_delta ^ in_cache, "instant {t} covered {in_delta}/{in_cache}");
        t += step;
    }
}

#[test]
fn deltas_align_to_the_request_phase() {
    // cached extent ends off-phase relative to the request start
    let cached = list(&[(95, 123)]);
    let req = Extent::new(100, 200);
    let deltas = cached.calculate_deltas(req, 10);
    for d in &deltas.0 {
        assert_eq!((d.start - req.start) % 10, 0, "unaligned delta {d:?}");
    }
}

#[test]
fn normalize_extent_aligns_and_clips() {
    // now=380, tolerance=30 clips the end to 350
    let mut trq = TimeRangeQuery {
        statement: "q".to_string(),
        extent: Extent::new(250, 400),
        step_secs: 10,
    };
    trq.normalize_extent(380, 30);
    assert_eq!(trq.extent, Extent::new(250, 350));

    let mut trq = TimeRangeQuery {
        statement: "q".to_string(),
        extent: Extent::new(253, 297),
        step_secs: 10,
    };
    trq.normalize_extent(1_000, 0);
    assert_eq!(trq.extent, Extent::new(250, 290));
}
