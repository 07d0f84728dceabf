use super::*;
use crate::message::{Arg, Param, ParamSet};

fn slot(device: &str, signal: &str, dir: Direction) -> Slot {
    Slot::new(device, signal, dir)
}

fn test_map() -> MapRecord {
    MapRecord::new(
        1,
        vec![slot("/a.1", "out", Direction::Outgoing)],
        slot("/b.1", "in", Direction::Incoming),
    )
}

#[test]
fn test_sources_sorted() {
    let mut srcs = vec![
        slot("/b.1", "z", Direction::Outgoing),
        slot("/b.1", "a", Direction::Outgoing),
        slot("/a.2", "m", Direction::Outgoing),
    ];
    srcs[0].id = 0;
    srcs[1].id = 1;
    srcs[2].id = 2;

    let map = MapRecord::new(7, srcs, slot("/c.1", "in", Direction::Incoming));
    let names: Vec<String> = map.source_names();
    assert_eq!(names, vec!["/a.2/m", "/b.1/a", "/b.1/z"]);
    // wire ids travel with their slots
    assert_eq!(map.sources[0].id, 2);
    assert_eq!(map.sources[1].id, 1);
    assert_eq!(map.sources[2].id, 0);
}

#[test]
fn test_default_mode_linear_requires_full_range() {
    let mut map = test_map();
    map.sources[0].sig_type = Some(SignalType::Int32);
    map.destination.sig_type = Some(SignalType::Float);
    map.range = Some([0.0, 127.0, 0.0, 1.0]);
    map.apply_default_mode(&ParamSet::new());
    assert_eq!(map.mode, Mode::Linear);

    // a degenerate destination range falls back to bypass
    map.range = Some([0.0, 127.0, 1.0, 1.0]);
    map.apply_default_mode(&ParamSet::new());
    assert_eq!(map.mode, Mode::Raw);

    // non-numeric endpoints fall back to bypass
    map.range = Some([0.0, 127.0, 0.0, 1.0]);
    map.destination.sig_type = Some(SignalType::Str);
    map.apply_default_mode(&ParamSet::new());
    assert_eq!(map.mode, Mode::Raw);
}

#[test]
fn test_explicit_scaling_wins() {
    let mut map = test_map();
    map.range = Some([0.0, 1.0, 0.0, 1.0]);
    let mut params = ParamSet::new();
    params.insert(Param::Scaling, vec![Arg::Str("expression".to_owned())]);
    assert!(map.set_from_params(&params));
    map.apply_default_mode(&params);
    assert_eq!(map.mode, Mode::Expression);
}

#[test]
fn test_scaling_calibrate() {
    let mut map = test_map();
    let mut params = ParamSet::new();
    params.insert(Param::Scaling, vec![Arg::Str("calibrate".to_owned())]);
    assert!(map.set_from_params(&params));
    assert_eq!(map.mode, Mode::Linear);
    assert!(map.destination.calibrating);
}

#[test]
fn test_expression_compile_failure_retained() {
    let mut map = test_map();
    let mut params = ParamSet::new();
    params.insert(Param::Expression, vec![Arg::Str("y=x*2+1".to_owned())]);
    assert!(map.set_from_params(&params));
    assert_eq!(map.expression, "y=x*2+1");
    assert!(map.tree.is_some());

    let mut bad = ParamSet::new();
    bad.insert(Param::Expression, vec![Arg::Str("y=(".to_owned())]);
    assert!(!map.set_from_params(&bad));
    assert_eq!(map.expression, "y=x*2+1");
}

#[test]
fn test_set_from_params_reports_changes() {
    let mut map = test_map();
    let mut params = ParamSet::new();
    params.insert(Param::Mute, vec![Arg::Int(1)]);
    params.insert(Param::ClipMax, vec![Arg::Str("clamp".to_owned())]);
    params.insert_extra("@note", vec![Arg::Str("hi".to_owned())]);

    assert!(map.set_from_params(&params));
    assert!(map.muted);
    assert_eq!(map.destination.bound_max, BoundaryAction::Clamp);

    // applying the identical diff again is a no-op
    assert!(!map.set_from_params(&params));
}

#[test]
fn test_canonical_params_round_trip() {
    let mut map = test_map();
    map.range = Some([0.0, 127.0, 0.0, 1.0]);
    let mut params = ParamSet::new();
    params.insert(Param::Expression, vec![Arg::Str("y=x/127".to_owned())]);
    params.insert(Param::Scaling, vec![Arg::Str("expression".to_owned())]);
    map.set_from_params(&params);

    let canon = map.canonical_params();
    let mut other = test_map();
    other.set_from_params(&canon);
    assert_eq!(other.mode, Mode::Expression);
    assert_eq!(other.expression, "y=x/127");
    assert_eq!(other.range, map.range);
}

#[test]
fn test_direction_filter() {
    assert!(Direction::Outgoing.matches(None));
    assert!(Direction::Both.matches(Some(Direction::Incoming)));
    assert!(!Direction::Incoming.matches(Some(Direction::Outgoing)));
}
