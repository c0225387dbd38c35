use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{TimeZone, Utc};
use fitparser::profile::MesgNum;
use ftms_fit_bridge::{
    config::PhaseConfig,
    decode_activity,
    error::{AggregationError, EncodeError},
    fit,
    identity::{self, Sport, SubSport},
    protocol, DeviceIdentity, ExportedActivity, FrameKind, Inbound, MachineClass, MetricSample,
    Phase, PipelineConfig, PipelineEvent, SessionAggregator, SessionSummary, WorkoutPipeline,
};

struct Outcome {
    samples: Vec<MetricSample>,
    summary: SessionSummary,
    exported: ExportedActivity,
}

fn run(identity: DeviceIdentity, inbound: Vec<Inbound>) -> Outcome {
    let mut pipeline = WorkoutPipeline::new(PipelineConfig::default(), identity)
        .unwrap()
        .with_started_at(Utc.with_ymd_and_hms(2024, 11, 5, 18, 0, 0).unwrap());

    let mut samples = Vec::new();
    let mut summary = None;
    let mut exported = None;
    for message in inbound.into_iter().chain([Inbound::End { early: false }]) {
        for event in pipeline.handle(message) {
            match event {
                PipelineEvent::Sample(sample) => samples.push(sample),
                PipelineEvent::SessionFinished(s) => summary = Some(*s),
                PipelineEvent::Exported(activity) => exported = Some(*activity),
                PipelineEvent::ExportFailed(e) => panic!("export failed: {e}"),
                PipelineEvent::FrameDropped { kind, error } => {
                    panic!("dropped {kind:?} frame: {error}")
                }
                PipelineEvent::PhaseChanged(_) => {}
            }
        }
    }

    Outcome {
        samples,
        summary: summary.unwrap(),
        exported: exported.unwrap(),
    }
}

fn frame(kind: FrameKind, data: Bytes, at: Instant) -> Inbound {
    Inbound::Frame { kind, data, at }
}

fn bike_ride(powers: &[i16], heart_rate: bool) -> Vec<Inbound> {
    let start = Instant::now();
    let mut inbound = Vec::new();
    for (i, power) in powers.iter().enumerate() {
        let second = u64::try_from(i).unwrap();
        let at = start + Duration::from_secs(second);

        if heart_rate && i % 2 == 0 {
            let bpm = 110 + u16::try_from(i).unwrap();
            inbound.push(frame(
                FrameKind::HeartRateMeasurement,
                protocol::encode_heart_rate(bpm),
                at,
            ));
        }

        let mut sample = MetricSample::new(MachineClass::Bike, at);
        sample.set_speed(Some(30.0));
        sample.cadence = heart_rate.then_some(80.0);
        sample.instantaneous_power = Some(*power);
        sample.total_distance = Some(u32::try_from(i).unwrap() * 9);
        sample.total_energy = Some(u16::try_from(i / 3).unwrap());
        inbound.push(frame(
            FrameKind::IndoorBikeData,
            protocol::encode_frame(&sample),
            at,
        ));
    }
    inbound
}

/// A bike that reports nothing but cadence
fn cadence_only_ride(seconds: u64) -> Vec<Inbound> {
    let start = Instant::now();
    (0..seconds)
        .map(|second| {
            let at = start + Duration::from_secs(second);
            let mut sample = MetricSample::new(MachineClass::Bike, at);
            sample.cadence = Some(82.0);
            frame(FrameKind::IndoorBikeData, protocol::encode_frame(&sample), at)
        })
        .collect()
}

fn rower_frames(seconds: u16, fill: impl Fn(u16, &mut MetricSample)) -> Vec<Inbound> {
    let start = Instant::now();
    (0..seconds)
        .map(|i| {
            let at = start + Duration::from_secs(u64::from(i));
            let mut sample = MetricSample::new(MachineClass::Rower, at);
            fill(i, &mut sample);
            frame(FrameKind::RowerData, protocol::encode_frame(&sample), at)
        })
        .collect()
}

fn ramp() -> Vec<i16> {
    (0..20_i16).map(|i| 50 + (150 * i + 9) / 19).collect()
}

#[test]
fn test_bike_ride_with_heart_rate_strap() {
    let powers = ramp();
    assert_eq!(powers.first(), Some(&50));
    assert_eq!(powers.last(), Some(&200));

    let identity = identity::identify(Some("Rogue Echo Bike"), MachineClass::Bike);
    let outcome = run(identity.clone(), bike_ride(&powers, true));

    assert_eq!(outcome.samples.len(), 20);
    assert!(outcome.samples.iter().all(|s| s.heart_rate.is_some()));

    let mean = powers.iter().map(|p| f64::from(*p)).sum::<f64>() / 20.0;
    let average = outcome.summary.average_power.unwrap();
    assert!((average - mean).abs() <= 0.5, "average {average}, mean {mean}");

    assert!(outcome.exported.report.valid);
    let parsed = decode_activity(&outcome.exported.bytes).unwrap();
    let exported_average = f64::from(parsed.session.average_power.unwrap());
    assert!((exported_average - average).abs() <= 0.5);
    assert_eq!(parsed.session.max_power, Some(200));
    assert_eq!(parsed.session.total_distance, Some(171.0));
    assert_eq!(parsed.session.total_calories, Some(6));
    assert_eq!(parsed.session.sport, Some(Sport::Cycling as u8));
    assert_eq!(parsed.session.sub_sport, Some(SubSport::IndoorCycling as u8));
    assert_eq!(parsed.file_id.product, Some(identity.product));
    assert_eq!(parsed.file_id.serial_number, Some(identity.serial_number));
    assert_eq!(parsed.device_info.unwrap().manufacturer, Some(identity.manufacturer));
}

#[test]
fn test_record_timestamps_never_decrease() {
    let outcome = run(DeviceIdentity::generic(MachineClass::Bike), bike_ride(&ramp(), true));
    let parsed = decode_activity(&outcome.exported.bytes).unwrap();

    let timestamps: Vec<u32> = parsed.records.iter().map(|r| r.timestamp.unwrap()).collect();
    assert_eq!(timestamps.len(), 20);
    assert!(timestamps.windows(2).all(|pair| pair[0] <= pair[1]));

    let start = fit::to_fit_timestamp(outcome.summary.started_at);
    assert_eq!(timestamps[0], start);
    assert_eq!(timestamps[19], start + 19);
}

#[test]
fn test_missing_fields_parse_back_absent() {
    let outcome = run(
        DeviceIdentity::generic(MachineClass::Bike),
        bike_ride(&[150; 12], false),
    );
    let parsed = decode_activity(&outcome.exported.bytes).unwrap();

    for record in &parsed.records {
        assert_eq!(record.heart_rate, None);
        assert_eq!(record.cadence, None);
        assert_eq!(record.power, Some(150));
    }
    assert_eq!(parsed.session.average_heart_rate, None);
    assert_eq!(parsed.session.max_heart_rate, None);
    assert_eq!(parsed.session.average_cadence, None);

    // the invalid sentinel decodes to no field at all
    let record = parsed.messages_of(MesgNum::Record).next().unwrap();
    assert!(!record.fields().iter().any(|f| f.number() == 3));

    let outcome = run(DeviceIdentity::generic(MachineClass::Bike), cadence_only_ride(10));
    assert!(outcome.exported.report.valid);
    assert_eq!(outcome.summary.total_distance, None);
    let parsed = decode_activity(&outcome.exported.bytes).unwrap();

    assert_eq!(parsed.records.len(), 10);
    for record in &parsed.records {
        assert_eq!(record.cadence, Some(82));
        assert_eq!(record.power, None);
        assert_eq!(record.speed, None);
        assert_eq!(record.distance, None);
        assert_eq!(record.calories, None);
    }
    assert_eq!(parsed.session.average_power, None);
    assert_eq!(parsed.session.max_power, None);
    assert_eq!(parsed.session.total_distance, None);
    assert_eq!(parsed.session.total_calories, None);
}

#[test]
fn test_rower_missing_stroke_fields_parse_back_absent() {
    let inbound = rower_frames(12, |i, sample| {
        sample.total_distance = Some(u32::from(i) * 4);
        sample.instantaneous_power = Some(160);
    });
    let outcome = run(DeviceIdentity::generic(MachineClass::Rower), inbound);
    assert!(outcome.exported.report.valid);
    assert!(outcome.samples.iter().all(|s| s.pace.is_none() && s.speed_mps.is_none()));

    let parsed = decode_activity(&outcome.exported.bytes).unwrap();
    for record in &parsed.records {
        assert_eq!(record.cadence, None);
        assert_eq!(record.speed, None);
        assert_eq!(record.power, Some(160));
    }
    assert_eq!(parsed.session.total_cycles, None);
    assert_eq!(parsed.session.average_cadence, None);
    assert_eq!(parsed.session.total_distance, Some(44.0));
}

#[test]
fn test_rower_pace_drives_speed_and_distance() {
    let inbound = rower_frames(15, |_, sample| {
        sample.set_pace(Some(120));
        sample.instantaneous_power = Some(170);
    });
    let outcome = run(DeviceIdentity::generic(MachineClass::Rower), inbound);

    let average_speed = outcome.summary.average_speed.unwrap();
    assert!((average_speed - 15.0).abs() < 1e-9, "average speed {average_speed}");
    assert!(outcome.summary.distance_estimated);

    let parsed = decode_activity(&outcome.exported.bytes).unwrap();
    for record in &parsed.records {
        assert!((record.speed.unwrap() - 4.167).abs() < 1e-3);
        assert!(record.distance.is_some());
    }
    let total = parsed.session.total_distance.unwrap();
    assert!((total - 58.33).abs() < 0.01, "total distance {total}");
}

#[test]
fn test_corrupt_distance_counter_held_at_last_value() {
    let mut inbound = bike_ride(&[140; 20], false);
    if let Inbound::Frame { data, at, .. } = &mut inbound[10] {
        let mut sample = protocol::decode_at(MachineClass::Bike, &data[..], *at).unwrap();
        sample.total_distance = Some(0xFF_FFFF);
        *data = protocol::encode_frame(&sample);
    }

    let outcome = run(DeviceIdentity::generic(MachineClass::Bike), inbound);
    assert_eq!(outcome.samples[10].total_distance, Some(81));
    assert_eq!(outcome.samples[11].total_distance, Some(99));
    assert_eq!(outcome.summary.total_distance, Some(171.0));

    assert!(outcome.exported.report.valid);
    let parsed = decode_activity(&outcome.exported.bytes).unwrap();
    assert_eq!(parsed.session.total_distance, Some(171.0));
    assert!(parsed.records.iter().all(|r| r.distance.unwrap() <= 171.0));
}

#[test]
fn test_rower_session_exports_rowing() {
    let inbound = rower_frames(15, |i, sample| {
        sample.stroke_rate = Some(26.0);
        sample.stroke_count = Some(i / 2);
        sample.total_distance = Some(u32::from(i) * 4);
        sample.instantaneous_power = Some(170);
    });

    let identity = identity::identify(Some("Echo Rower"), MachineClass::Rower);
    assert_eq!(identity.product, identity::ECHO_ROWER.product);
    let outcome = run(identity, inbound);
    let parsed = decode_activity(&outcome.exported.bytes).unwrap();

    assert_eq!(parsed.session.sport, Some(15));
    assert_eq!(parsed.session.sub_sport, Some(14));
    assert_eq!(parsed.session.total_cycles, Some(7));
    assert_eq!(parsed.session.average_cadence, Some(26));
    assert_eq!(parsed.session.total_distance, Some(56.0));
    assert!(parsed.records.iter().all(|r| r.cadence == Some(26)));
}

#[test]
fn test_empty_session_cannot_finalize() {
    let mut aggregator = SessionAggregator::new(MachineClass::Bike, PhaseConfig::default());
    assert_eq!(
        aggregator.finalize().unwrap_err(),
        AggregationError::EmptySessionFinalize
    );
}

#[test]
fn test_idle_rider_forced_into_main_at_600_seconds() {
    let origin = Instant::now();
    let mut aggregator = SessionAggregator::new(MachineClass::Bike, PhaseConfig::default());

    let mut main_at = None;
    for second in 0..=600_u64 {
        let mut sample =
            MetricSample::new(MachineClass::Bike, origin + Duration::from_secs(second));
        sample.instantaneous_power = Some(0);
        for transition in aggregator.ingest(sample).unwrap() {
            if transition.to == Phase::Main {
                main_at = Some(transition.at);
            }
        }
        if second < 600 {
            assert_eq!(aggregator.phase(), Phase::WarmUp, "left warm-up at {second} s");
        }
    }

    assert_eq!(main_at, Some(Duration::from_secs(600)));
    assert_eq!(aggregator.phase(), Phase::Main);

    let finished = aggregator.finalize().unwrap();
    let phases: Vec<_> = finished.summary.phases.iter().map(|p| p.phase).collect();
    assert_eq!(phases, [Phase::WarmUp, Phase::Main]);
    assert_eq!(finished.summary.phases[0].duration, Duration::from_secs(600));
}

#[test]
fn test_corrupted_file_rejected() {
    let outcome = run(DeviceIdentity::generic(MachineClass::Bike), bike_ride(&ramp(), true));
    let mut bytes = outcome.exported.bytes.to_vec();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0xFF;

    assert!(matches!(decode_activity(&bytes), Err(EncodeError::Malformed(_))));
}
