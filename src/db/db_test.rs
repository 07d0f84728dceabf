use std::cell::RefCell;
use std::rc::Rc;

use super::*;

fn params(pairs: &[(Param, Vec<Arg>)]) -> ParamSet {
    let mut set = ParamSet::new();
    for (p, vals) in pairs {
        set.insert(*p, vals.clone());
    }
    set
}

fn registered_params(port: i32) -> ParamSet {
    params(&[
        (Param::Ip, vec![Arg::Str("10.0.0.1".to_owned())]),
        (Param::Port, vec![Arg::Int(port)]),
        (Param::NumInputs, vec![Arg::Int(1)]),
        (Param::NumOutputs, vec![Arg::Int(2)]),
    ])
}

#[test]
fn test_device_add_then_modify() {
    let mut db = Db::default();
    let events: Rc<RefCell<Vec<(String, RecordAction)>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    db.add_device_callback(move |dev, action| {
        sink.borrow_mut().push((dev.name.clone(), action));
    });

    let now = Timetag::new(100, 0);
    let id = db.add_or_update_device("/a.1", &registered_params(9000), now);
    assert_eq!(id, name_hash("/a.1"));
    assert_eq!(
        events.borrow().as_slice(),
        &[("/a.1".to_owned(), RecordAction::Added)]
    );

    // identical announcement only refreshes synced
    let later = Timetag::new(101, 0);
    db.add_or_update_device("/a.1", &registered_params(9000), later);
    assert_eq!(events.borrow().len(), 1);
    assert_eq!(db.device_by_name("a.1").unwrap().synced, later);

    // a real change fires Modified
    db.add_or_update_device("/a.1", &registered_params(9001), later);
    assert_eq!(
        events.borrow().last().unwrap(),
        &("/a.1".to_owned(), RecordAction::Modified)
    );
    assert_eq!(db.device_by_name("/a.1").unwrap().port, Some(9001));
}

#[test]
fn test_synced_never_regresses() {
    let mut db = Db::default();
    db.add_or_update_device("/a.1", &ParamSet::new(), Timetag::new(50, 0));
    db.add_or_update_device("/a.1", &ParamSet::new(), Timetag::new(40, 0));
    assert_eq!(db.device_by_name("/a.1").unwrap().synced, Timetag::new(50, 0));
}

#[test]
fn test_expiry_law() {
    let mut db = Db::new(10);
    let events: Rc<RefCell<Vec<RecordAction>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    db.add_device_callback(move |dev, action| {
        if dev.name == "/a.1" {
            sink.borrow_mut().push(action);
        }
    });

    let id = db.add_or_update_device("/a.1", &ParamSet::new(), Timetag::new(100, 0));
    db.upsert_subscription(id, SubscribeFlags::ALL, 160);

    // inside the window nothing expires
    assert!(db.check_device_status(109).is_empty());

    let expired = db.check_device_status(111);
    assert_eq!(expired, vec!["/a.1".to_owned()]);
    assert_eq!(
        events.borrow().as_slice(),
        &[
            RecordAction::Added,
            RecordAction::Expired,
            RecordAction::Removed
        ]
    );
    assert!(db.device_by_name("/a.1").is_none());
    // the subscription is dropped silently with the device
    assert!(db.subscription(id).is_none());

    // a second sweep is a no-op
    assert!(db.check_device_status(112).is_empty());
}

#[test]
fn test_local_devices_do_not_expire() {
    let mut db = Db::new(10);
    db.add_or_update_device("/me.1", &ParamSet::new(), Timetag::new(100, 0));
    db.device_by_name_mut("/me.1").unwrap().local = true;
    assert!(db.check_device_status(10_000).is_empty());
}

#[test]
fn test_remove_device_cascades() {
    let mut db = Db::default();
    let now = Timetag::new(100, 0);
    let id = db.add_or_update_device("/a.1", &ParamSet::new(), now);
    db.add_or_update_signal("/a.1", "out", &ParamSet::new());
    db.add_or_update_signal("/b.1", "in", &ParamSet::new());

    db.add_or_update_map(1, &["/a.1/out"], "/b.1/in", &ParamSet::new(), now)
        .unwrap();
    // a second map with a local endpoint survives the cascade
    db.add_or_update_map(2, &["/a.1/out"], "/b.1/in2", &ParamSet::new(), now)
        .unwrap();
    db.map_by_id_mut(2).unwrap().local = true;

    db.add_or_update_link("/a.1", "/b.1", false, now);

    db.remove_device(id, false);

    assert!(db.device_by_name("/a.1").is_none());
    assert!(db.device_signal_by_name("/a.1", "out").is_none());
    assert!(db.map_by_id(1).is_none());
    assert!(db.map_by_id(2).is_some());
    assert!(db.link_by_names("/a.1", "/b.1").is_none());
}

#[test]
fn test_signal_local_is_authoritative() {
    let mut db = Db::default();
    let mut record = SignalRecord::new("/me.1", "out");
    record.direction = Direction::Outgoing;
    record.sig_type = SignalType::Float;
    let id = db.insert_local_signal(record);

    // a bus echo cannot overwrite local metadata
    let echo = params(&[(Param::Type, vec![Arg::Char('i')])]);
    assert_eq!(db.add_or_update_signal("/me.1", "out", &echo), id);
    assert_eq!(
        db.device_signal_by_name("/me.1", "out").unwrap().sig_type,
        SignalType::Float
    );
}

#[test]
fn test_map_slots_sorted_and_convergent_growth() {
    let mut db = Db::default();
    let now = Timetag::new(10, 0);
    db.add_or_update_map(7, &["/b.1/z", "/a.1/m"], "/c.1/in", &ParamSet::new(), now)
        .unwrap();

    let map = db.map_by_id(7).unwrap();
    assert_eq!(map.source_names(), vec!["/a.1/m", "/b.1/z"]);
    // wire slot ids follow the advertised order, not the sorted order
    assert_eq!(map.sources[0].id, 1);
    assert_eq!(map.sources[1].id, 0);

    // same id with a third source grows the record
    db.add_or_update_map(
        7,
        &["/b.1/z", "/a.1/m", "/a.1/a"],
        "/c.1/in",
        &ParamSet::new(),
        now,
    )
    .unwrap();
    let map = db.map_by_id(7).unwrap();
    assert_eq!(map.source_names(), vec!["/a.1/a", "/a.1/m", "/b.1/z"]);
}

#[test]
fn test_map_source_limit() {
    let mut db = Db::default();
    let names: Vec<String> = (0..9).map(|i| format!("/a.1/s{i}")).collect();
    let refs: Vec<&str> = names.iter().map(String::as_str).collect();
    let err = db
        .add_or_update_map(1, &refs, "/b.1/in", &ParamSet::new(), Timetag::default())
        .unwrap_err();
    assert_eq!(err, crate::Error::ErrTooManySources);
}

#[test]
fn test_queries_by_property() {
    let mut db = Db::default();
    let now = Timetag::new(5, 0);
    db.add_or_update_device("/a.1", &registered_params(9000), now);
    db.add_or_update_device("/b.1", &registered_params(9001), now);
    db.add_or_update_device("/quiet.1", &ParamSet::new(), now);

    let val = [Arg::Int(9000)];
    let hits: Vec<&str> = db
        .devices_by_property("port", &val, Op::Eq)
        .map(|d| d.name.as_str())
        .collect();
    assert_eq!(hits, vec!["/a.1"]);

    let hits: Vec<&str> = db
        .devices_by_property("port", &val, Op::Gt)
        .map(|d| d.name.as_str())
        .collect();
    assert_eq!(hits, vec!["/b.1"]);

    let hits = db.devices_by_property("port", &val, Op::Exists).count();
    assert_eq!(hits, 2);
    let hits: Vec<&str> = db
        .devices_by_property("port", &val, Op::NotExists)
        .map(|d| d.name.as_str())
        .collect();
    assert_eq!(hits, vec!["/quiet.1"]);

    // type mismatch never matches
    let val = [Arg::Str("9000".to_owned())];
    assert_eq!(db.devices_by_property("port", &val, Op::Eq).count(), 0);

    assert_eq!(db.devices_by_name_match(".1").count(), 3);
    assert_eq!(db.devices_by_name_match("quiet").count(), 1);
}

#[test]
fn test_compare_value_vectors() {
    let a = [Arg::Int(1), Arg::Int(2), Arg::Int(3)];
    let b = [Arg::Int(1), Arg::Int(2), Arg::Int(3)];
    assert!(compare_value(Op::Eq, &a, &b));
    assert!(!compare_value(Op::Ne, &a, &b));

    // vector equality requires every element equal, even when signs cancel
    let c = [Arg::Int(0), Arg::Int(3), Arg::Int(3)];
    let d = [Arg::Int(1), Arg::Int(2), Arg::Int(3)];
    assert!(!compare_value(Op::Eq, &c, &d));
    assert!(compare_value(Op::Ne, &c, &d));
    assert!(compare_value(Op::Le, &c, &d));

    let e = [Arg::Int(2), Arg::Int(3)];
    let f = [Arg::Int(1), Arg::Int(2)];
    assert!(compare_value(Op::Gt, &e, &f));
    assert!(compare_value(Op::Ge, &e, &f));
    assert!(!compare_value(Op::Lt, &e, &f));

    // strings compare lexicographically
    let g = [Arg::Str("b".to_owned())];
    let h = [Arg::Sym("a".to_owned())];
    assert!(compare_value(Op::Gt, &g, &h));

    // length mismatch never matches
    assert!(!compare_value(Op::Eq, &e, &a));
}

#[test]
fn test_signal_queries() {
    let mut db = Db::default();
    let t = params(&[
        (Param::Type, vec![Arg::Char('f')]),
        (Param::Direction, vec![Arg::Str("output".to_owned())]),
    ]);
    db.add_or_update_signal("/a.1", "out", &t);
    db.add_or_update_signal("/a.1", "in", &ParamSet::new());
    db.add_or_update_signal("/b.1", "out", &ParamSet::new());

    assert_eq!(db.signals(None).count(), 3);
    assert_eq!(db.signals(Some(Direction::Outgoing)).count(), 1);
    assert_eq!(db.device_signals("/a.1", None).count(), 2);
    assert_eq!(db.signals_by_name("out").count(), 2);
    assert_eq!(db.signals_by_name_match("ou").count(), 2);

    let val = [Arg::Char('f')];
    assert_eq!(db.signals_by_property("type", &val, Op::Eq).count(), 1);
}

#[test]
fn test_slot_property_queries() {
    let mut db = Db::default();
    let now = Timetag::new(1, 0);
    let p = params(&[(Param::Type, vec![Arg::Char('f')])]);
    db.add_or_update_map(3, &["/a.1/out"], "/b.1/in", &p, now).unwrap();

    let val = [Arg::Char('f')];
    // @type applies to the destination slot
    assert_eq!(
        db.maps_by_slot_property("type", &val, Op::Eq, Some(Direction::Incoming))
            .count(),
        1
    );
    assert_eq!(
        db.maps_by_slot_property("type", &val, Op::Eq, Some(Direction::Outgoing))
            .count(),
        0
    );

    assert_eq!(db.device_maps("/a.1", Some(Direction::Outgoing)).count(), 1);
    assert_eq!(db.device_maps("/a.1", Some(Direction::Incoming)).count(), 0);
    assert_eq!(db.signal_maps("/b.1", "in", None).count(), 1);
}

#[test]
fn test_callback_token_removal() {
    let mut db = Db::default();
    let count = Rc::new(RefCell::new(0));
    let sink = count.clone();
    let token = db.add_device_callback(move |_, _| *sink.borrow_mut() += 1);

    db.add_or_update_device("/a.1", &ParamSet::new(), Timetag::new(1, 0));
    assert_eq!(*count.borrow(), 1);

    db.remove_device_callback(token);
    db.add_or_update_device("/b.1", &ParamSet::new(), Timetag::new(1, 0));
    assert_eq!(*count.borrow(), 1);
}

#[test]
fn test_link_records() {
    let mut db = Db::default();
    let events: Rc<RefCell<Vec<RecordAction>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    db.add_link_callback(move |_, action| sink.borrow_mut().push(action));

    let now = Timetag::new(9, 0);
    let id = db.add_or_update_link("/a.1", "/b.1", false, now);
    // re-announcement is idempotent
    assert_eq!(db.add_or_update_link("/a.1", "/b.1", false, now), id);
    assert_eq!(db.links().count(), 1);

    db.remove_link(id);
    assert!(db.link_by_names("/a.1", "/b.1").is_none());
    assert_eq!(
        events.borrow().as_slice(),
        &[RecordAction::Added, RecordAction::Removed]
    );
}

#[test]
fn test_subscribe_flag_tokens() {
    assert_eq!(SubscribeFlags::ALL.tokens(), vec!["all"]);
    assert_eq!(
        (SubscribeFlags::DEVICE | SubscribeFlags::INPUTS).tokens(),
        vec!["device", "inputs"]
    );
    assert_eq!(
        (SubscribeFlags::SIGNALS | SubscribeFlags::MAPS_OUT).tokens(),
        vec!["signals", "outgoing_maps"]
    );
    assert_eq!(
        SubscribeFlags::from_token("incoming_maps"),
        SubscribeFlags::MAPS_IN
    );
    assert!(SubscribeFlags::from_token("bogus").is_empty());
}
