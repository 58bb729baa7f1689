use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use meterprep::{
    build_datasets, build_testing_records, compute_windows, decode_json_lines, encode_json_lines,
    resample_hourly_sum, DatasetError, JobConfig, MeterSeries, SeriesRecord, WeatherObservation,
    WeatherSeries, NUM_TEST_WINDOWS,
};

fn job(end_day: u32, period: u32) -> JobConfig {
    JobConfig {
        data_start: NaiveDate::from_ymd_opt(2013, 6, 1).unwrap(),
        data_end: NaiveDate::from_ymd_opt(2013, 6, end_day).unwrap(),
        forecast_period_days: period,
        training_samples: 3,
        use_weather: false,
    }
}

fn start() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2013, 6, 1)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

fn meter(id: &str, job: &JobConfig, value_at: impl Fn(i64) -> f64) -> MeterSeries {
    let windows = compute_windows(job).unwrap();
    let (from, to) = windows.data_range();
    let hours = (to - from).num_hours();
    let rows = (0..hours).map(|h| (from + ChronoDuration::hours(h), value_at(h)));
    MeterSeries {
        meter_id: id.to_string(),
        series: resample_hourly_sum(rows, from, to),
    }
}

fn hourly_weather(hours: i64) -> WeatherSeries {
    WeatherSeries::new(
        (0..hours)
            .map(|h| WeatherObservation {
                time: start() + ChronoDuration::hours(h),
                temperature: Some(h as f64),
                humidity: Some(0.5),
                apparent_temperature: Some(h as f64 - 2.0),
            })
            .collect(),
    )
}

#[test]
fn training_length_is_constant_and_shorter_than_testing() {
    let job = job(8, 2);
    let meters = vec![
        meter("a", &job, |h| h as f64),
        meter("b", &job, |_| 0.0),
        meter("c", &job, |h| if h % 5 == 0 { 1.5 } else { 0.0 }),
    ];

    let out = build_datasets(&job, &meters, None).unwrap();

    // 7 days of data, 2 windows of 48h held out.
    assert_eq!(out.windows.training_hours(), 168 - 96);
    let lens: Vec<usize> = out.training.iter().map(|r| r.target.len()).collect();
    assert_eq!(lens, vec![72, 72, 72]);
    assert!(out.testing.iter().all(|r| r.target.len() == 168));
    assert_eq!(out.training[0].target[71], 71.0);
}

#[test]
fn testing_records_repeat_every_meter_per_window() {
    let job = job(6, 1);
    let meters = vec![meter("a", &job, |_| 1.0), meter("b", &job, |_| 2.0)];
    let windows = compute_windows(&job).unwrap();

    let testing = build_testing_records(&meters, &windows, None).unwrap();

    assert_eq!(testing.len(), meters.len() * NUM_TEST_WINDOWS as usize);
    assert_eq!(testing[0], testing[2]);
    assert_eq!(testing[1], testing[3]);
    assert_eq!(testing[0].target[0], 1.0);
    assert_eq!(testing[1].target[0], 2.0);

    let encoded = encode_json_lines(&testing).unwrap();
    let lines: Vec<&[u8]> = encoded.split(|b| *b == b'\n').filter(|l| !l.is_empty()).collect();
    assert_eq!(lines[0], lines[2]);
    assert_eq!(lines[1], lines[3]);
}

#[test]
fn weather_covariates_match_target_length_for_both_sets() {
    let job = job(6, 1);
    let meters = vec![meter("a", &job, |_| 1.0)];
    let weather = hourly_weather(5 * 24);

    let out = build_datasets(&job, &meters, Some(&weather)).unwrap();

    for record in out.training.iter().chain(out.testing.iter()) {
        let feats = record.dynamic_feat.as_ref().unwrap();
        assert_eq!(feats.len(), 3);
        assert!(feats.iter().all(|f| f.len() == record.target.len()));
        assert_eq!(feats[0][5], 5.0);
        assert_eq!(feats[1][5], 0.5);
        assert_eq!(feats[2][5], 3.0);
    }
}

#[test]
fn weather_shorter_than_testing_window_is_rejected() {
    let job = job(6, 1);
    let meters = vec![meter("a", &job, |_| 1.0)];
    let weather = hourly_weather(100);

    let err = build_datasets(&job, &meters, Some(&weather)).unwrap_err();
    assert!(matches!(
        err,
        DatasetError::CovariateLengthMismatch {
            expected: 120,
            actual: 100,
            ..
        }
    ));
}

#[test]
fn empty_sample_is_rejected() {
    let err = build_datasets(&job(6, 1), &[], None).unwrap_err();
    assert!(matches!(err, DatasetError::NoEntities));
}

#[test]
fn documented_short_range_example_fails() {
    let err = compute_windows(&job(3, 1)).unwrap_err();
    assert!(matches!(err, DatasetError::TrainingWindowEmpty { .. }));
}

#[test]
fn floats_survive_json_lines_exactly() {
    let tricky = vec![
        0.1 + 0.2,
        1.0 / 3.0,
        f64::MIN_POSITIVE,
        5e-324,
        f64::MAX,
        123_456_789.123_456_78,
        2.0_f64.sqrt(),
    ];
    let record = SeriesRecord {
        start: "2013-06-01 00:00:00".to_string(),
        target: tricky.clone(),
        dynamic_feat: Some(vec![tricky.clone(), tricky.clone(), tricky.clone()]),
    };

    let decoded = decode_json_lines(&encode_json_lines(&[record]).unwrap()).unwrap();

    assert_eq!(decoded.len(), 1);
    let bits = |v: &[f64]| v.iter().map(|x| x.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&decoded[0].target), bits(&tricky));
    for feat in decoded[0].dynamic_feat.as_ref().unwrap() {
        assert_eq!(bits(feat), bits(&tricky));
    }
}
