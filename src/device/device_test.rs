use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tokio::time::Instant;

use super::*;
use crate::db::RecordAction;

fn test_config(bus_port: u16) -> Config {
    Config {
        bus_port,
        ..Config::default()
    }
}

async fn try_device(identifier: &str, initial_port: u16, config: Config) -> Option<Device> {
    match Device::new(identifier, initial_port, config).await {
        Ok(dev) => Some(dev),
        // machines without a multicast-capable interface skip these tests
        Err(Error::ErrNoInterface) | Err(Error::ErrJoiningMulticastGroup) => None,
        Err(e) => panic!("{e}"),
    }
}

async fn poll_until_ready(dev: &mut Device, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while !dev.is_ready() && Instant::now() < deadline {
        dev.poll(10).await.unwrap();
    }
    assert!(dev.is_ready(), "device did not become ready in time");
    // one more tick so registration completes
    dev.poll(10).await.unwrap();
}

#[test]
fn test_parse_device_name() {
    assert_eq!(parse_device_name("/synth.1"), Some(("synth", 1)));
    assert_eq!(parse_device_name("/synth.12"), Some(("synth", 12)));
    // atoi semantics: digits up to the first non-digit
    assert_eq!(parse_device_name("/synth.3x"), Some(("synth", 3)));
    assert_eq!(parse_device_name("no-slash.1"), None);
    assert_eq!(parse_device_name("/nodot"), None);
    assert_eq!(parse_device_name("/synth."), None);
}

#[test]
fn test_parse_map_args() {
    let args = vec![
        Arg::Str("/a.1/x".to_owned()),
        Arg::Str("/a.1/y".to_owned()),
        Arg::Str("/b.1/in".to_owned()),
        Arg::Str("@id".to_owned()),
        Arg::Long(9),
    ];
    let (srcs, dst, params) = parse_map_args(&args).unwrap();
    assert_eq!(srcs, vec!["/a.1/x", "/a.1/y"]);
    assert_eq!(dst, "/b.1/in");
    assert_eq!(params.if_i64(Param::Id), Some(9));

    // a destination alone is not a map
    let args = vec![Arg::Str("/b.1/in".to_owned())];
    assert!(parse_map_args(&args).is_none());
}

#[tokio::test]
async fn test_single_device_bring_up() {
    let Some(mut dev) = try_device("solo", 9000, test_config(7590)).await else {
        return;
    };
    assert!(!dev.is_ready());
    assert_eq!(dev.name(), None);

    poll_until_ready(&mut dev, Duration::from_millis(2500)).await;

    assert_eq!(dev.name(), Some("/solo.1"));
    assert_eq!(dev.port(), Some(9000));
    assert!(dev.id().is_some());

    // we appear in our own replica, marked local
    let record = dev.db().device_by_name("/solo.1").unwrap();
    assert!(record.local);
    assert_eq!(record.port, Some(9000));

    dev.close().await.unwrap();
}

#[tokio::test]
async fn test_ordinal_collision() {
    let Some(mut a) = try_device("dup", 9100, test_config(7591)).await else {
        return;
    };
    poll_until_ready(&mut a, Duration::from_millis(2500)).await;
    assert_eq!(a.name(), Some("/dup.1"));

    let mut b = try_device("dup", 9200, test_config(7591)).await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(20);
    while !b.is_ready() && Instant::now() < deadline {
        a.poll(5).await.unwrap();
        b.poll(5).await.unwrap();
    }
    assert!(b.is_ready());

    let b_name = b.name().unwrap().to_owned();
    assert_ne!(b_name, "/dup.1");
    assert!(b_name.starts_with("/dup."));
    // ordinals stay pairwise distinct once locked
    let b_ordinal: u32 = b_name.strip_prefix("/dup.").unwrap().parse().unwrap();
    assert!(b_ordinal >= 2);

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_port_collision() {
    let Some(mut a) = try_device("porta", 9300, test_config(7592)).await else {
        return;
    };
    poll_until_ready(&mut a, Duration::from_millis(2500)).await;
    assert_eq!(a.port(), Some(9300));

    let mut b = try_device("portb", 9300, test_config(7592)).await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(20);
    while !b.is_ready() && Instant::now() < deadline {
        a.poll(5).await.unwrap();
        b.poll(5).await.unwrap();
    }
    assert!(b.is_ready());
    assert_ne!(b.port(), a.port());

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_self_connection_linear_default() {
    let Some(mut dev) = try_device("conn", 9400, test_config(7593)).await else {
        return;
    };
    dev.add_signal(
        Direction::Outgoing,
        "out",
        1,
        SignalType::Int32,
        None,
        Some(vec![0.0]),
        Some(vec![127.0]),
        None,
    )
    .unwrap();
    dev.add_signal(
        Direction::Incoming,
        "in",
        1,
        SignalType::Float,
        None,
        Some(vec![0.0]),
        Some(vec![1.0]),
        None,
    )
    .unwrap();

    poll_until_ready(&mut dev, Duration::from_millis(2500)).await;
    let name = dev.name().unwrap().to_owned();
    assert_eq!(
        dev.db().device_by_name(&name).unwrap().num_inputs,
        1
    );
    assert_eq!(
        dev.db().device_by_name(&name).unwrap().num_outputs,
        1
    );

    let map_id = dev.new_map(&["out"], "in").unwrap();
    assert_eq!(dev.map(map_id).unwrap().status, MapStatus::Staged);
    dev.push(map_id).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while dev.map(map_id).map(|m| m.status) != Some(MapStatus::Active)
        && Instant::now() < deadline
    {
        dev.poll(10).await.unwrap();
    }

    let map = dev.map(map_id).unwrap();
    assert_eq!(map.status, MapStatus::Active);
    assert_eq!(map.mode, Mode::Linear);
    assert_eq!(map.range, Some([0.0, 127.0, 0.0, 1.0]));
    assert_eq!(map.sources[0].sig_type, Some(SignalType::Int32));
    assert_eq!(map.destination.sig_type, Some(SignalType::Float));

    // the self-link exists and carries the map
    assert_eq!(dev.links().count(), 1);
    let link = dev.links().next().unwrap();
    assert_eq!(link.remote_name, name);
    assert_eq!(link.num_outgoing_maps, 1);

    dev.close().await.unwrap();
}

#[tokio::test]
async fn test_two_device_map_and_modify() {
    let Some(mut a) = try_device("sender", 9500, test_config(7595)).await else {
        return;
    };
    a.add_signal(
        Direction::Outgoing,
        "o",
        1,
        SignalType::Int32,
        None,
        Some(vec![0.0]),
        Some(vec![127.0]),
        None,
    )
    .unwrap();

    let mut b = try_device("recv", 9600, test_config(7595)).await.unwrap();
    b.add_signal(
        Direction::Incoming,
        "i",
        1,
        SignalType::Float,
        None,
        Some(vec![0.0]),
        Some(vec![1.0]),
        None,
    )
    .unwrap();

    // both ready and mutually discovered
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        a.poll(5).await.unwrap();
        b.poll(5).await.unwrap();
        if a.db().device_by_name("/recv.1").is_some()
            && b.db().device_by_name("/sender.1").is_some()
        {
            break;
        }
        assert!(Instant::now() < deadline, "devices never discovered each other");
    }

    let map_id = a.new_map(&["o"], "/recv.1/i").unwrap();
    a.push(map_id).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        a.poll(5).await.unwrap();
        b.poll(5).await.unwrap();
        let a_active = a.map(map_id).map(|m| m.status) == Some(MapStatus::Active);
        let b_active = b
            .db()
            .map_by_id(map_id)
            .map(|m| m.status == MapStatus::Active)
            .unwrap_or(false);
        if a_active && b_active {
            break;
        }
        assert!(Instant::now() < deadline, "map never became active");
    }

    // both endpoints agree on the canonical state
    let ma = a.map(map_id).unwrap();
    let mb = b.db().map_by_id(map_id).unwrap();
    assert_eq!(ma.mode, Mode::Linear);
    assert_eq!(mb.mode, Mode::Linear);
    assert_eq!(ma.range, Some([0.0, 127.0, 0.0, 1.0]));
    assert_eq!(mb.range, ma.range);
    assert_eq!(ma.expression, mb.expression);
    assert_eq!(ma.scope, mb.scope);
    assert_eq!(
        ma.source_names(),
        vec!["/sender.1/o".to_owned()]
    );

    // the destination built its own link half toward the source
    assert!(a.links().any(|l| l.remote_name == "/recv.1"));
    assert!(b.links().any(|l| l.remote_name == "/sender.1"));

    // modify from the observer side: the source applies and re-announces
    {
        let mut params = ParamSet::new();
        params.insert(Param::Scaling, vec![Arg::Str("expression".to_owned())]);
        params.insert(Param::Expression, vec![Arg::Str("y=x*2+1".to_owned())]);
        let map = b.db_mut().map_by_id_mut(map_id).unwrap();
        assert!(map.set_from_params(&params));
    }
    b.push(map_id).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        a.poll(5).await.unwrap();
        b.poll(5).await.unwrap();
        if a.map(map_id).map(|m| m.mode) == Some(Mode::Expression) {
            break;
        }
        assert!(Instant::now() < deadline, "modify never reached the source");
    }
    assert_eq!(a.map(map_id).unwrap().expression, "y=x*2+1");

    // an invalid expression is rejected; the previous one is retained
    let mut args = a.map(map_id).unwrap().name_args();
    let mut params = ParamSet::new();
    params.insert(Param::Id, vec![Arg::Long(map_id as i64)]);
    params.insert(Param::Expression, vec![Arg::Str("y=(".to_owned())]);
    params.append_to(&mut args);
    b.bus.send(&Message::new("/map/modify", args)).await.unwrap();

    for _ in 0..20 {
        a.poll(5).await.unwrap();
        b.poll(5).await.unwrap();
    }
    assert_eq!(a.map(map_id).unwrap().expression, "y=x*2+1");
    assert_eq!(a.map(map_id).unwrap().mode, Mode::Expression);
    assert_eq!(b.db().map_by_id(map_id).unwrap().expression, "y=x*2+1");

    // teardown removes the map everywhere and retires the idle link
    a.unmap(map_id).await.unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        a.poll(5).await.unwrap();
        b.poll(5).await.unwrap();
        if a.map(map_id).is_none()
            && b.db().map_by_id(map_id).is_none()
            && a.links().count() == 0
        {
            break;
        }
        assert!(Instant::now() < deadline, "unmap never completed");
    }

    a.close().await.unwrap();
    b.close().await.unwrap();
}

#[tokio::test]
async fn test_subscription_and_expiry() {
    let config = Config {
        bus_port: 7596,
        // a short soft-state window keeps the test quick
        timeout_sec: 3,
        ..Config::default()
    };
    let Some(mut a) = try_device("mort", 9700, config.clone()).await else {
        return;
    };
    let mut b = try_device("watch", 9800, config).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        a.poll(5).await.unwrap();
        b.poll(5).await.unwrap();
        if b.db().device_by_name("/mort.1").is_some() && a.is_ready() {
            break;
        }
        assert!(Instant::now() < deadline, "devices never discovered each other");
    }

    b.subscribe(Some("/mort.1"), SubscribeFlags::ALL, -1)
        .await
        .unwrap();
    let mort_id = b.db().device_by_name("/mort.1").unwrap().id;
    assert!(b.db().subscription(mort_id).is_some());

    // signals added after subscribing are pushed to the observer
    a.add_signal(
        Direction::Outgoing,
        "pulse",
        1,
        SignalType::Float,
        Some("Hz"),
        None,
        None,
        None,
    )
    .unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        a.poll(5).await.unwrap();
        b.poll(5).await.unwrap();
        if b.db().device_signal_by_name("/mort.1", "pulse").is_some() {
            break;
        }
        assert!(Instant::now() < deadline, "signal never reached the observer");
    }
    let sig = b.db().device_signal_by_name("/mort.1", "pulse").unwrap();
    assert_eq!(sig.sig_type, SignalType::Float);
    assert_eq!(sig.unit.as_deref(), Some("Hz"));

    // watch the lifecycle of the peer record
    let events: Rc<RefCell<Vec<RecordAction>>> = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    b.db_mut().add_device_callback(move |dev, action| {
        // in-flight keepalives may still fire Modified; the law under
        // test concerns the expiry pair only
        if dev.name == "/mort.1"
            && matches!(action, RecordAction::Expired | RecordAction::Removed)
        {
            sink.borrow_mut().push(action);
        }
    });

    // kill the peer without /logout; only silence follows
    drop(a);

    let deadline = Instant::now() + Duration::from_secs(6);
    while b.db().device_by_name("/mort.1").is_some() && Instant::now() < deadline {
        b.poll(10).await.unwrap();
    }

    assert!(b.db().device_by_name("/mort.1").is_none());
    assert!(b.db().device_signal_by_name("/mort.1", "pulse").is_none());
    // exactly one Expired followed by one Removed
    assert_eq!(
        events.borrow().as_slice(),
        &[RecordAction::Expired, RecordAction::Removed]
    );
    // the subscription went silently with the device
    assert!(b.db().subscription(mort_id).is_none());

    b.close().await.unwrap();
}
