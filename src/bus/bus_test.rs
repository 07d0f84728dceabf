use std::time::Duration;

use super::*;
use crate::message::Arg;

fn test_config(port: u16) -> Config {
    Config {
        bus_port: port,
        ..Config::default()
    }
}

#[test]
fn test_dispatch_table() {
    // routing is pure table lookup; no sockets needed
    let handlers = vec![("/who".to_owned(), Handler::Who)];

    assert_eq!(route_path(&handlers, "/who"), Some(Handler::Who));
    assert_eq!(route_path(&handlers, "/nope"), None);
    assert_eq!(
        route_path(&handlers, "/synth.1/signal"),
        Some(Handler::SignalInfo)
    );
    assert_eq!(
        route_path(&handlers, "/synth.1/signal/removed"),
        Some(Handler::SignalRemoved)
    );
}

#[tokio::test]
async fn test_handler_rebind() {
    let mut bus = match Bus::open(&test_config(7581)) {
        Ok(bus) => bus,
        // no multicast-capable interface in this environment
        Err(Error::ErrNoInterface) => return,
        Err(e) => panic!("{e}"),
    };

    bus.add_handler("/port/registered", Handler::PortRegistered);
    assert_eq!(bus.route("/port/registered"), Some(Handler::PortRegistered));

    bus.add_handler("/port/registered", Handler::PortProbe);
    assert_eq!(bus.route("/port/registered"), Some(Handler::PortProbe));

    bus.remove_handler("/port/registered");
    assert_eq!(bus.route("/port/registered"), None);
}

#[tokio::test]
async fn test_bus_loopback() {
    let bus = match Bus::open(&test_config(7582)) {
        Ok(bus) => bus,
        Err(Error::ErrNoInterface) => return,
        Err(e) => panic!("{e}"),
    };

    let msg = Message::new("/who", vec![]);
    bus.send(&msg).await.unwrap();

    // multicast loop is enabled, so our own announcement comes back
    let mut received = None;
    for _ in 0..50 {
        if let Some((m, _src)) = bus.try_recv() {
            received = Some(m);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(received, Some(msg));
}

#[tokio::test]
async fn test_mesh_unicast() {
    let bus = match Bus::open(&test_config(7583)) {
        Ok(bus) => bus,
        Err(Error::ErrNoInterface) => return,
        Err(e) => panic!("{e}"),
    };

    let addr = bus.mesh_addr().unwrap();
    let target = SocketAddr::new(bus.interface_ip().into(), addr.port());
    let msg = Message::new("/ping", vec![Arg::Int(1)]);
    bus.send_to(&msg, target).await.unwrap();

    let mut received = None;
    for _ in 0..50 {
        if let Some((m, _src)) = bus.try_recv() {
            received = Some(m);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(received, Some(msg));
}
