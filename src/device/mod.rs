#[cfg(test)]
mod device_test;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::time::{sleep, Duration, Instant};

use crate::alloc::{AllocatedResource, Check};
use crate::bus::{Bus, Handler};
use crate::clock::Clock;
use crate::config::Config;
use crate::db::{name_hash, Db, SignalRecord, SubscribeFlags};
use crate::error::{Error, Result};
use crate::map::{Direction, MapRecord, MapStatus, Mode, SignalType, Slot};
use crate::message::{parse_signal_path, split_args, Arg, Message, Param, ParamSet};

pub const LIB_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Messages drained from the bus per poll tick.
const MAX_RECV_PER_POLL: usize = 10;

/// Autorenewing subscriptions ask for this lease and renew 10 s early.
const SUBSCRIBE_INTERVAL_SEC: u32 = 60;
const SUBSCRIBE_RENEW_BUFFER_SEC: u32 = 10;

/// A peer observing this device under a lease.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub addr: SocketAddr,
    pub flags: SubscribeFlags,
    pub lease_expiration_sec: u32,
}

/// The data-plane capability toward a peer device. The control plane only
/// resolves and owns the addressing; streaming happens elsewhere.
#[derive(Debug, Clone)]
pub struct Link {
    pub remote_name: String,
    pub remote_id: u64,
    pub data_addr: SocketAddr,
    pub num_incoming_maps: u32,
    pub num_outgoing_maps: u32,
}

/// Handler invoked by the data plane when an input signal updates; the
/// control plane merely stores it at configuration time.
pub type SignalUpdateHandler = Box<dyn FnMut(&SignalRecord, &[f64])>;

enum Outbound {
    Bus(Message),
    Subscribers(Message, SubscribeFlags),
}

/// A participant on the mapping bus: allocates its name and data port by
/// collision probing, replicates the network state, and drives the link
/// and map handshakes. All activity happens inside `poll`.
pub struct Device {
    identifier: String,
    name: Option<String>,
    device_id: u64,
    config: Config,
    bus: Bus,
    db: Db,
    clock: Clock,
    rng: StdRng,

    ordinal: AllocatedResource,
    port: AllocatedResource,
    registered: bool,
    closed: bool,
    version: i32,

    links: Vec<Link>,
    subscribers: Vec<Subscriber>,
    /// `/map_to` messages waiting for their `/link` handshake, keyed by
    /// target device name.
    pending_maps: Vec<(String, Message)>,
    staged_signals: Vec<SignalRecord>,
    update_handlers: HashMap<u64, SignalUpdateHandler>,
    outbox: Vec<Outbound>,
    next_status_check_sec: u32,
}

impl Device {
    /// Opens the bus and starts probing for a name ordinal and data port.
    /// The device is usable once `poll` has driven both to a lock; see
    /// `is_ready`. Construction fails only on fatal conditions: no usable
    /// interface, or the bus socket cannot be opened.
    pub async fn new(identifier: &str, initial_port: u16, config: Config) -> Result<Device> {
        if identifier.is_empty() || identifier.contains('/') || identifier.contains('.') {
            return Err(Error::Other(format!("bad identifier {identifier:?}")));
        }

        let mut bus = Bus::open(&config)?;

        let mut clock = Clock::new();
        let now = clock.tick();
        // per-device generator; the allocator must not share process state
        let rng = StdRng::seed_from_u64((now * 1_000_000.0) as u64 % 100_000);

        // only the allocation handlers exist until registration
        bus.add_handler("/port/probe", Handler::PortProbe);
        bus.add_handler("/port/registered", Handler::PortRegistered);
        bus.add_handler("/name/probe", Handler::NameProbe);
        bus.add_handler("/name/registered", Handler::NameRegistered);

        let mut dev = Device {
            identifier: identifier.to_owned(),
            name: None,
            device_id: 0,
            db: Db::new(config.timeout_sec),
            config,
            bus,
            clock,
            rng,
            ordinal: AllocatedResource::new(1, now),
            port: AllocatedResource::new(initial_port as u32, now),
            registered: false,
            closed: false,
            version: 0,
            links: Vec::new(),
            subscribers: Vec::new(),
            pending_maps: Vec::new(),
            staged_signals: Vec::new(),
            update_handlers: HashMap::new(),
            outbox: Vec::new(),
            next_status_check_sec: 0,
        };

        dev.probe_port().await?;
        dev.probe_name().await?;
        Ok(dev)
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Canonical name "/{identifier}.{ordinal}", available once locked.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn id(&self) -> Option<u64> {
        self.registered.then_some(self.device_id)
    }

    pub fn port(&self) -> Option<u16> {
        self.port.locked.then_some(self.port.value as u16)
    }

    /// True once both the ordinal and the data port are locked.
    pub fn is_ready(&self) -> bool {
        self.ordinal.locked && self.port.locked
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn db_mut(&mut self) -> &mut Db {
        &mut self.db
    }

    pub fn links(&self) -> impl Iterator<Item = &Link> {
        self.links.iter()
    }

    pub fn subscribers(&self) -> impl Iterator<Item = &Subscriber> {
        self.subscribers.iter()
    }

    pub fn version(&self) -> i32 {
        self.version
    }

    /// Declares a signal on this device. Before registration the record
    /// is staged; it enters the database and is advertised to subscribers
    /// once the device name is locked.
    #[allow(clippy::too_many_arguments)]
    pub fn add_signal(
        &mut self,
        direction: Direction,
        name: &str,
        length: u32,
        sig_type: SignalType,
        unit: Option<&str>,
        minimum: Option<Vec<f64>>,
        maximum: Option<Vec<f64>>,
        handler: Option<SignalUpdateHandler>,
    ) -> Result<u64> {
        if name.is_empty() || name.starts_with('/') {
            return Err(Error::Other(format!("bad signal name {name:?}")));
        }

        let mut record = SignalRecord::new("", name);
        record.direction = direction;
        record.sig_type = sig_type;
        record.length = length.max(1);
        record.unit = unit.map(str::to_owned);
        record.minimum = minimum;
        record.maximum = maximum;
        record.local = true;

        let id = if let Some(device) = self.name.clone() {
            record.device = device.clone();
            record.id = name_hash(&record.full_name());
            if self.db.device_signal_by_name(&device, name).is_some() {
                return Err(Error::Other(format!("duplicate signal {name:?}")));
            }
            let id = self.db.insert_local_signal(record.clone());
            self.sync_signal_counts();
            self.queue_signal_announcement(&record);
            id
        } else {
            if self.staged_signals.iter().any(|s| s.name == name) {
                return Err(Error::Other(format!("duplicate signal {name:?}")));
            }
            let id = record.id;
            self.staged_signals.push(record);
            id
        };

        if let Some(handler) = handler {
            self.update_handlers.insert(id, handler);
        }
        self.version += 1;
        Ok(id)
    }

    /// Withdraws a local signal and announces the removal.
    pub fn remove_signal(&mut self, name: &str) -> Result<()> {
        if let Some(pos) = self.staged_signals.iter().position(|s| s.name == name) {
            let record = self.staged_signals.remove(pos);
            self.update_handlers.remove(&record.id);
            return Ok(());
        }

        let device = self.name.clone().ok_or(Error::ErrUnknownSignal)?;
        let sig = self
            .db
            .device_signal_by_name(&device, name)
            .filter(|s| s.local)
            .ok_or(Error::ErrUnknownSignal)?;
        let id = sig.id;

        self.db.remove_signal(id);
        self.update_handlers.remove(&id);
        self.sync_signal_counts();
        self.version += 1;

        let msg = Message::new(
            format!("{device}/signal/removed"),
            vec![Arg::Str(name.to_owned())],
        );
        self.outbox.push(Outbound::Bus(msg));
        Ok(())
    }

    /// Stages a map from source signals to one destination input. Names
    /// may be full paths ("/dev.1/sig"); bare names refer to local
    /// signals. The handshake starts on the first `push`.
    pub fn new_map(&mut self, srcs: &[&str], dst: &str) -> Result<u64> {
        let name = self
            .name
            .clone()
            .ok_or(Error::ErrNotRegistered)?;
        if srcs.is_empty() {
            return Err(Error::ErrNoSources);
        }
        if srcs.len() > crate::map::MAX_NUM_SOURCES {
            return Err(Error::ErrTooManySources);
        }

        let full = |s: &str| -> String {
            if s.starts_with('/') {
                s.to_owned()
            } else {
                format!("{name}/{s}")
            }
        };

        let mut sources = Vec::with_capacity(srcs.len());
        for (slot_id, src) in srcs.iter().enumerate() {
            let full_name = full(src);
            let (dev, sig) = parse_signal_path(&full_name)?;
            let mut slot = Slot::new(dev, sig, Direction::Outgoing);
            slot.id = slot_id as u32;
            self.resolve_slot(&mut slot);
            sources.push(slot);
        }

        let full_dst = full(dst);
        let (dev, sig) = parse_signal_path(&full_dst)?;
        let mut destination = Slot::new(dev, sig, Direction::Incoming);
        self.resolve_slot(&mut destination);

        let id = self.db.generate_map_id(self.device_id);
        let mut record = MapRecord::new(id, sources, destination);
        record.local = true;
        record.status = MapStatus::Staged;
        self.db.insert_map(record);
        Ok(id)
    }

    pub fn map(&self, id: u64) -> Option<&MapRecord> {
        self.db.map_by_id(id)
    }

    /// Mutable access to a staged map so properties (expression, range,
    /// scaling, mute) can be set before `push`.
    pub fn map_mut(&mut self, id: u64) -> Option<&mut MapRecord> {
        self.db.map_by_id_mut(id)
    }

    /// Emits `/map` for a staged map, or `/map/modify` with the canonical
    /// state for an established one.
    pub async fn push(&mut self, id: u64) -> Result<()> {
        let map = self.db.map_by_id(id).ok_or(Error::ErrUnknownMap)?;
        let mut args = map.name_args();

        if map.status <= MapStatus::Requested {
            let mut params = ParamSet::new();
            params.insert(Param::Id, vec![Arg::Long(map.id as i64)]);
            if map.mode != Mode::Raw || map.destination.calibrating {
                let token = if map.destination.calibrating {
                    "calibrate"
                } else {
                    map.mode.token()
                };
                params.insert(Param::Scaling, vec![Arg::Str(token.to_owned())]);
            }
            if let Some([a, b, c, d]) = map.range {
                params.insert(
                    Param::Range,
                    vec![Arg::Float(a), Arg::Float(b), Arg::Float(c), Arg::Float(d)],
                );
            }
            if !map.expression.is_empty() {
                params.insert(Param::Expression, vec![Arg::Str(map.expression.clone())]);
            }
            if map.muted {
                params.insert(Param::Mute, vec![Arg::Int(1)]);
            }
            if !map.scope.is_empty() {
                params.insert(
                    Param::Scope,
                    map.scope.iter().map(|s| Arg::Str(s.clone())).collect(),
                );
            }
            params.append_to(&mut args);
            self.bus.send(&Message::new("/map", args)).await?;
            if let Some(map) = self.db.map_by_id_mut(id) {
                map.status = MapStatus::Requested;
            }
        } else {
            map.canonical_params().append_to(&mut args);
            self.bus.send(&Message::new("/map/modify", args)).await?;
        }
        Ok(())
    }

    /// Asks the network to tear the map down. The source endpoint (which
    /// may be this device, via loopback) performs the removal and
    /// announces `/unmapped`.
    pub async fn unmap(&mut self, id: u64) -> Result<()> {
        let map = self.db.map_by_id(id).ok_or(Error::ErrUnknownMap)?;
        let args = map.name_args();
        self.bus.send(&Message::new("/unmap", args)).await?;
        Ok(())
    }

    /// Begins observing a device's metadata. `timeout == -1` installs an
    /// autorenewing lease; other values are one-shot. `device == None`
    /// toggles autosubscribe-all: every device discovered from now on is
    /// subscribed with `flags`.
    pub async fn subscribe(
        &mut self,
        device: Option<&str>,
        flags: SubscribeFlags,
        timeout: i32,
    ) -> Result<()> {
        let Some(device) = device else {
            return self.autosubscribe(flags).await;
        };

        let record = self
            .db
            .device_by_name(device)
            .ok_or(Error::ErrUnknownDevice)?;
        let (dev_id, dev_name) = (record.id, record.name.clone());

        if timeout == -1 {
            let lease_expiration =
                self.clock.now.sec + SUBSCRIBE_INTERVAL_SEC - SUBSCRIBE_RENEW_BUFFER_SEC;
            self.db.upsert_subscription(dev_id, flags, lease_expiration);
            self.send_subscribe(&dev_name, flags, SUBSCRIBE_INTERVAL_SEC as i32, Some(0))
                .await
        } else {
            self.send_subscribe(&dev_name, flags, timeout, Some(0)).await
        }
    }

    /// Stops observing `device`; `None` turns autosubscribe-all off and
    /// drops every subscription.
    pub async fn unsubscribe(&mut self, device: Option<&str>) -> Result<()> {
        match device {
            Some(device) => self.unsubscribe_device(device).await,
            None => self.autosubscribe(SubscribeFlags::NONE).await,
        }
    }

    async fn unsubscribe_device(&mut self, device: &str) -> Result<()> {
        let Some(record) = self.db.device_by_name(device) else {
            return Ok(());
        };
        let (dev_id, dev_name) = (record.id, record.name.clone());
        if self.db.remove_subscription(dev_id) {
            let msg = Message::new(format!("{dev_name}/unsubscribe"), vec![]);
            self.bus.send_from_mesh(&msg).await?;
        }
        Ok(())
    }

    async fn autosubscribe(&mut self, flags: SubscribeFlags) -> Result<()> {
        if self.db.autosubscribe.is_empty() && !flags.is_empty() {
            self.db.autosubscribe = flags;
            // catch up on devices we already know about
            let known: Vec<String> = self
                .db
                .devices()
                .filter(|d| !d.local)
                .map(|d| d.name.clone())
                .collect();
            for name in known {
                self.subscribe_autorenew(&name).await?;
            }
            self.request_devices().await?;
        } else if !self.db.autosubscribe.is_empty() && flags.is_empty() {
            self.db.autosubscribe = SubscribeFlags::NONE;
            let subscribed: Vec<String> = self
                .db
                .subscriptions()
                .filter_map(|s| self.db.device_by_id(s.device_id))
                .map(|d| d.name.clone())
                .collect();
            for name in subscribed {
                self.unsubscribe_device(&name).await?;
            }
        } else {
            self.db.autosubscribe = flags;
        }
        Ok(())
    }

    /// Asks every device on the bus to announce itself.
    pub async fn request_devices(&self) -> Result<()> {
        self.bus.send(&Message::new("/who", vec![])).await
    }

    /// Emits a best-effort `/logout` and marks the device closed.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::ErrClosed);
        }
        if let Some(name) = self.name.clone() {
            let msg = Message::new("/logout", vec![Arg::Str(name)]);
            if let Err(e) = self.bus.send(&msg).await {
                log::warn!("logout failed: {e}");
            }
        }
        self.closed = true;
        Ok(())
    }

    /// One cooperative step: drains up to 10 bus messages, runs the
    /// allocator and registration, sends keepalives, renews and expires
    /// leases, flushes queued announcements, and sweeps expired peers.
    /// With `block_ms > 0` the step repeats until the deadline passes.
    pub async fn poll(&mut self, block_ms: u64) -> Result<usize> {
        if self.closed {
            return Err(Error::ErrClosed);
        }

        let mut count = self.tick().await?;

        if block_ms > 0 {
            let deadline = Instant::now() + Duration::from_millis(block_ms);
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    break;
                }
                sleep(remaining.min(Duration::from_millis(10))).await;
                count += self.tick().await?;
            }
        }
        Ok(count)
    }

    async fn tick(&mut self) -> Result<usize> {
        self.clock.tick();

        let mut count = 0;
        while count < MAX_RECV_PER_POLL {
            let Some((msg, src)) = self.bus.try_recv() else {
                break;
            };
            count += 1;
            let Some(handler) = self.bus.route(&msg.path) else {
                log::trace!("no handler for {}", msg.path);
                continue;
            };
            if let Err(e) = self.handle(handler, msg, src).await {
                log::trace!("handler error: {e}");
            }
        }

        self.run_allocator().await?;
        self.maybe_register().await?;
        self.keepalive().await?;
        self.renew_subscriptions().await?;
        self.expire_subscribers();
        self.flush_outbox().await?;
        self.sweep_expired();

        Ok(count)
    }

    /**** Allocation ****/

    async fn probe_port(&self) -> Result<()> {
        log::trace!("</{}.?> probing port {}", self.identifier, self.port.value);
        let msg = Message::new("/port/probe", vec![Arg::Int(self.port.value as i32)]);
        self.bus.send(&msg).await
    }

    async fn probe_name(&self) -> Result<()> {
        let name = format!("/{}.{}", self.identifier, self.ordinal.value);
        log::trace!("</{}.?> probing name {}", self.identifier, name);
        let msg = Message::new("/name/probe", vec![Arg::Str(name)]);
        self.bus.send(&msg).await
    }

    async fn announce_port(&self) -> Result<()> {
        let msg = Message::new("/port/registered", vec![Arg::Int(self.port.value as i32)]);
        self.bus.send(&msg).await
    }

    async fn announce_name(&self) -> Result<()> {
        let name = format!("/{}.{}", self.identifier, self.ordinal.value);
        let msg = Message::new("/name/registered", vec![Arg::Str(name)]);
        self.bus.send(&msg).await
    }

    async fn run_allocator(&mut self) -> Result<()> {
        let now = self.clock.now.as_secs_f64();

        if !self.port.locked {
            match self.port.check_collisions(now, &mut self.rng) {
                Check::Reprobe => self.probe_port().await?,
                Check::Locked => self.announce_port().await?,
                Check::Wait => {}
            }
        }
        if !self.ordinal.locked {
            match self.ordinal.check_collisions(now, &mut self.rng) {
                Check::Reprobe => self.probe_name().await?,
                Check::Locked => self.announce_name().await?,
                Check::Wait => {}
            }
        }
        Ok(())
    }

    /// Once both resources are locked: bind the named handlers, drop the
    /// claim handlers used during allocation, enter ourselves in the
    /// database, absorb staged signals, and ask the bus who is out there.
    async fn maybe_register(&mut self) -> Result<()> {
        if self.registered || !self.is_ready() {
            return Ok(());
        }

        let name = format!("/{}.{}", self.identifier, self.ordinal.value);
        self.device_id = name_hash(&name);
        self.name = Some(name.clone());

        self.bus.add_handler("/who", Handler::Who);
        self.bus.add_handler("/registered", Handler::Registered);
        self.bus.add_handler("/logout", Handler::Logout);
        self.bus.add_handler("/sync", Handler::Sync);
        self.bus.add_handler("/link", Handler::Link);
        self.bus.add_handler("/link_to", Handler::LinkTo);
        self.bus.add_handler("/linked", Handler::Linked);
        self.bus.add_handler("/unlink", Handler::Unlink);
        self.bus.add_handler("/unlinked", Handler::Unlinked);
        self.bus.add_handler("/map", Handler::Map);
        self.bus.add_handler("/map_to", Handler::MapTo);
        self.bus.add_handler("/mapped", Handler::Mapped);
        self.bus.add_handler("/map/modify", Handler::MapModify);
        // legacy spelling kept for older peers
        self.bus.add_handler("/connection/modify", Handler::MapModify);
        self.bus.add_handler("/unmap", Handler::Unmap);
        self.bus.add_handler("/unmapped", Handler::Unmapped);
        self.bus.add_handler(format!("{name}/subscribe"), Handler::Subscribe);
        self.bus.add_handler(format!("{name}/unsubscribe"), Handler::Unsubscribe);
        self.bus.add_handler(format!("{name}/info/get"), Handler::InfoGet);
        self.bus.add_handler(format!("{name}/namespace/get"), Handler::NamespaceGet);
        self.bus.add_handler(format!("{name}/signals/get"), Handler::SignalsGet);
        self.bus.add_handler(format!("{name}/links/get"), Handler::LinksGet);
        self.bus.add_handler(format!("{name}/maps/get"), Handler::MapsGet);

        self.bus.remove_handler("/port/registered");
        self.bus.remove_handler("/name/registered");

        self.db
            .add_or_update_device(&name, &ParamSet::new(), self.clock.now);
        if let Some(dev) = self.db.device_by_name_mut(&name) {
            dev.local = true;
            dev.host = Some(self.bus.interface_ip().to_string());
            dev.port = Some(self.port.value as u16);
            dev.lib_version = Some(LIB_VERSION.to_owned());
        }

        for mut record in std::mem::take(&mut self.staged_signals) {
            let staged_id = record.id;
            record.device = name.clone();
            record.id = name_hash(&record.full_name());
            if let Some(handler) = self.update_handlers.remove(&staged_id) {
                self.update_handlers.insert(record.id, handler);
            }
            self.db.insert_local_signal(record.clone());
            self.queue_signal_announcement(&record);
        }
        self.sync_signal_counts();

        self.registered = true;
        self.version += 1;
        log::info!("</{}.?> registered as <{}>", self.identifier, name);

        self.request_devices().await
    }

    /**** Periodic work ****/

    async fn keepalive(&mut self) -> Result<()> {
        if !self.registered || self.clock.now.sec < self.clock.next_ping {
            return Ok(());
        }
        self.clock.next_ping = self.clock.now.sec + self.config.ping_sec;

        let name = self.name.clone().unwrap_or_default();
        self.db.touch_device(&name, self.clock.now);
        let msg = Message::new(
            "/sync",
            vec![Arg::Str(name), Arg::Int(self.version)],
        );
        self.bus.send(&msg).await
    }

    async fn renew_subscriptions(&mut self) -> Result<()> {
        let now_sec = self.clock.now.sec;
        let due: Vec<(u64, SubscribeFlags)> = self
            .db
            .subscriptions()
            .filter(|s| s.lease_expiration_sec < now_sec)
            .map(|s| (s.device_id, s.flags))
            .collect();

        for (dev_id, flags) in due {
            let Some(name) = self.db.device_by_id(dev_id).map(|d| d.name.clone()) else {
                continue;
            };
            self.send_subscribe(&name, flags, SUBSCRIBE_INTERVAL_SEC as i32, None)
                .await?;
            self.db.upsert_subscription(
                dev_id,
                flags,
                now_sec + SUBSCRIBE_INTERVAL_SEC - SUBSCRIBE_RENEW_BUFFER_SEC,
            );
        }
        Ok(())
    }

    fn expire_subscribers(&mut self) {
        let now_sec = self.clock.now.sec;
        self.subscribers.retain(|s| {
            let keep = s.lease_expiration_sec >= now_sec;
            if !keep {
                log::trace!("subscriber {} lease expired", s.addr);
            }
            keep
        });
    }

    async fn flush_outbox(&mut self) -> Result<()> {
        for item in std::mem::take(&mut self.outbox) {
            match item {
                Outbound::Bus(msg) => self.bus.send(&msg).await?,
                Outbound::Subscribers(msg, class) => {
                    for sub in &self.subscribers {
                        if sub.flags.intersects(class) {
                            self.bus.send_to(&msg, sub.addr).await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Once per second, expire peers that stopped syncing and drop any
    /// local state that pointed at them.
    fn sweep_expired(&mut self) {
        if self.clock.now.sec < self.next_status_check_sec {
            return;
        }
        self.next_status_check_sec = self.clock.now.sec + 1;

        let expired = self.db.check_device_status(self.clock.now.sec);
        for name in expired {
            self.links.retain(|l| l.remote_name != name);
            self.pending_maps.retain(|(target, _)| *target != name);
        }
    }

    /**** Helpers ****/

    fn resolve_slot(&self, slot: &mut Slot) {
        if let Some(sig) = self.db.device_signal_by_name(&slot.device, &slot.signal) {
            slot.sig_type = Some(sig.sig_type);
            slot.length = sig.length;
            slot.num_instances = sig.num_instances;
            slot.use_as_instance = sig.num_instances > 1;
            if slot.minimum.is_none() {
                slot.minimum = sig.minimum.clone();
            }
            if slot.maximum.is_none() {
                slot.maximum = sig.maximum.clone();
            }
        }
    }

    fn sync_signal_counts(&mut self) {
        let Some(name) = self.name.clone() else {
            return;
        };
        let num_inputs = self
            .db
            .device_signals(&name, Some(Direction::Incoming))
            .count() as i32;
        let num_outputs = self
            .db
            .device_signals(&name, Some(Direction::Outgoing))
            .count() as i32;
        if let Some(dev) = self.db.device_by_name_mut(&name) {
            dev.num_inputs = num_inputs;
            dev.num_outputs = num_outputs;
        }
    }

    fn queue_signal_announcement(&mut self, record: &SignalRecord) {
        let mut args = vec![Arg::Str(record.name.clone())];
        record.advertisement().append_to(&mut args);
        let msg = Message::new(format!("{}/signal", record.device), args);
        let class = match record.direction {
            Direction::Incoming => SubscribeFlags::INPUTS,
            Direction::Outgoing => SubscribeFlags::OUTPUTS,
            Direction::Both => SubscribeFlags::SIGNALS,
        };
        self.outbox.push(Outbound::Subscribers(msg, class));
    }

    fn registered_message(&self) -> Message {
        let name = self.name.clone().unwrap_or_default();
        let mut args = vec![Arg::Str(name.clone())];
        let dev = self.db.device_by_name(&name);
        let mut params = ParamSet::new();
        params.insert(
            Param::Ip,
            vec![Arg::Str(self.bus.interface_ip().to_string())],
        );
        params.insert(Param::Port, vec![Arg::Int(self.port.value as i32)]);
        params.insert(Param::CanAlias, vec![Arg::Int(0)]);
        params.insert(
            Param::NumInputs,
            vec![Arg::Int(dev.map(|d| d.num_inputs).unwrap_or(0))],
        );
        params.insert(
            Param::NumOutputs,
            vec![Arg::Int(dev.map(|d| d.num_outputs).unwrap_or(0))],
        );
        params.insert(
            Param::NumIncomingMaps,
            vec![Arg::Int(dev.map(|d| d.num_incoming_maps).unwrap_or(0))],
        );
        params.insert(
            Param::NumOutgoingMaps,
            vec![Arg::Int(dev.map(|d| d.num_outgoing_maps).unwrap_or(0))],
        );
        params.insert(Param::Rev, vec![Arg::Int(self.version)]);
        params.insert(
            Param::LibVersion,
            vec![Arg::Str(LIB_VERSION.to_owned())],
        );
        params.append_to(&mut args);
        Message::new("/registered", args)
    }

    async fn send_subscribe(
        &self,
        device: &str,
        flags: SubscribeFlags,
        lease: i32,
        version: Option<i32>,
    ) -> Result<()> {
        let mut args: Vec<Arg> = flags
            .tokens()
            .into_iter()
            .map(|t| Arg::Str(t.to_owned()))
            .collect();
        args.push(Arg::Str("@lease".to_owned()));
        args.push(Arg::Int(lease));
        if let Some(v) = version {
            args.push(Arg::Str("@version".to_owned()));
            args.push(Arg::Int(v));
        }
        let msg = Message::new(format!("{device}/subscribe"), args);
        // sent from the mesh socket so the reply stream reaches us alone
        self.bus.send_from_mesh(&msg).await
    }

    async fn subscribe_autorenew(&mut self, device: &str) -> Result<()> {
        let flags = self.db.autosubscribe;
        let Some(record) = self.db.device_by_name(device) else {
            return Ok(());
        };
        let (dev_id, dev_name) = (record.id, record.name.clone());
        if self.db.subscription(dev_id).is_some() {
            return Ok(());
        }
        let lease_expiration =
            self.clock.now.sec + SUBSCRIBE_INTERVAL_SEC - SUBSCRIBE_RENEW_BUFFER_SEC;
        self.db.upsert_subscription(dev_id, flags, lease_expiration);
        self.send_subscribe(&dev_name, flags, SUBSCRIBE_INTERVAL_SEC as i32, Some(0))
            .await
    }

    fn link_to(&self, remote: &str) -> Option<usize> {
        self.links.iter().position(|l| l.remote_name == remote)
    }

    /**** Message handlers ****/

    async fn handle(&mut self, handler: Handler, msg: Message, src: SocketAddr) -> Result<()> {
        match handler {
            Handler::Who => self.handle_who().await,
            Handler::Registered => self.handle_registered(msg).await,
            Handler::Logout => self.handle_logout(msg),
            Handler::Sync => self.handle_sync(msg).await,
            Handler::PortProbe | Handler::PortRegistered => self.handle_port_alloc(msg).await,
            Handler::NameProbe | Handler::NameRegistered => self.handle_name_alloc(msg).await,
            Handler::Link => self.handle_link(msg).await,
            Handler::LinkTo => self.handle_link_to(msg).await,
            Handler::Linked => self.handle_linked(msg),
            Handler::Unlink => self.handle_unlink(msg).await,
            Handler::Unlinked => self.handle_unlinked(msg),
            Handler::Map => self.handle_map(msg).await,
            Handler::MapTo => self.handle_map_to(msg).await,
            Handler::Mapped => self.handle_mapped(msg),
            Handler::MapModify => self.handle_map_modify(msg).await,
            Handler::Unmap => self.handle_unmap(msg).await,
            Handler::Unmapped => self.handle_unmapped(msg),
            Handler::SignalInfo => self.handle_signal_info(msg),
            Handler::SignalRemoved => self.handle_signal_removed(msg),
            Handler::Subscribe => self.handle_subscribe(msg, src).await,
            Handler::Unsubscribe => {
                self.subscribers.retain(|s| s.addr != src);
                Ok(())
            }
            Handler::InfoGet => {
                let reply = self.registered_message();
                self.bus.send_to(&reply, src).await
            }
            Handler::NamespaceGet | Handler::SignalsGet => self.send_namespace(src).await,
            Handler::LinksGet => self.send_links(src).await,
            Handler::MapsGet => self.send_maps(src).await,
        }
    }

    /// `/who`: announce ourselves. Our own `/who` also loops back here,
    /// which is how the network first learns of us after registration.
    async fn handle_who(&mut self) -> Result<()> {
        if !self.registered {
            return Ok(());
        }
        let msg = self.registered_message();
        self.bus.send(&msg).await
    }

    async fn handle_registered(&mut self, msg: Message) -> Result<()> {
        let (fixed, params) = split_args(&msg.args);
        let Some(name) = fixed.first().and_then(Arg::as_str) else {
            return Ok(());
        };
        if Some(name) == self.name.as_deref() {
            return Ok(());
        }
        log::trace!("<{}> got /registered {}", self.debug_name(), name);

        let name = name.to_owned();
        self.db.add_or_update_device(&name, &params, self.clock.now);
        if !self.db.autosubscribe.is_empty() {
            self.subscribe_autorenew(&name).await?;
        }
        Ok(())
    }

    fn handle_logout(&mut self, msg: Message) -> Result<()> {
        let (fixed, _) = split_args(&msg.args);
        let Some(name) = fixed.first().and_then(Arg::as_str) else {
            return Ok(());
        };
        if Some(name) == self.name.as_deref() {
            return Ok(());
        }
        log::trace!("<{}> got /logout {}", self.debug_name(), name);

        if let Some(dev) = self.db.device_by_name(name) {
            let id = dev.id;
            self.db.remove_device(id, false);
        }
        let name = name.to_owned();
        self.links.retain(|l| l.remote_name != name);
        self.pending_maps.retain(|(target, _)| *target != name);
        Ok(())
    }

    async fn handle_sync(&mut self, msg: Message) -> Result<()> {
        let (fixed, _) = split_args(&msg.args);
        let Some(name) = fixed.first().and_then(Arg::as_str) else {
            return Ok(());
        };
        if Some(name) == self.name.as_deref() {
            return Ok(());
        }

        let mut params = ParamSet::new();
        if let Some(rev) = fixed.get(1).and_then(Arg::as_i32) {
            params.insert(Param::Rev, vec![Arg::Int(rev)]);
        }
        // a keepalive resurrects a lapsed record as well as refreshing it
        let name = name.to_owned();
        self.db.add_or_update_device(&name, &params, self.clock.now);
        if !self.db.autosubscribe.is_empty() {
            self.subscribe_autorenew(&name).await?;
        }
        Ok(())
    }

    async fn handle_port_alloc(&mut self, msg: Message) -> Result<()> {
        let (fixed, _) = split_args(&msg.args);
        let Some(probed) = fixed.first().and_then(Arg::as_i32) else {
            return Ok(());
        };
        if probed as u32 == self.port.value
            && self.port.collide(self.clock.now.as_secs_f64())
        {
            // we hold this port; restate the claim so the prober moves on
            self.announce_port().await?;
        }
        Ok(())
    }

    async fn handle_name_alloc(&mut self, msg: Message) -> Result<()> {
        let (fixed, _) = split_args(&msg.args);
        let Some(probed) = fixed.first().and_then(Arg::as_str) else {
            return Ok(());
        };
        let Some((identifier, ordinal)) = parse_device_name(probed) else {
            return Ok(());
        };
        // collisions are counted per identifier: "/a.3" never collides
        // with a locked "/b.3"
        if identifier == self.identifier
            && ordinal == self.ordinal.value
            && self.ordinal.collide(self.clock.now.as_secs_f64())
        {
            self.announce_name().await?;
        }
        Ok(())
    }

    /// `/link src dst`: the destination answers with its own endpoint so
    /// the source can set up a router toward it.
    async fn handle_link(&mut self, msg: Message) -> Result<()> {
        let (fixed, _) = split_args(&msg.args);
        let (Some(src), Some(dst)) = (
            fixed.first().and_then(Arg::as_str),
            fixed.get(1).and_then(Arg::as_str),
        ) else {
            return Ok(());
        };
        log::trace!("<{}> got /link {} {}", self.debug_name(), src, dst);

        if Some(dst) != self.name.as_deref() {
            return Ok(());
        }

        let mut args = vec![Arg::Str(src.to_owned()), Arg::Str(dst.to_owned())];
        let mut params = ParamSet::new();
        params.insert(
            Param::Ip,
            vec![Arg::Str(self.bus.interface_ip().to_string())],
        );
        params.insert(Param::Port, vec![Arg::Int(self.port.value as i32)]);
        params.insert(Param::CanAlias, vec![Arg::Int(0)]);
        params.append_to(&mut args);
        self.bus.send(&Message::new("/link_to", args)).await
    }

    /// `/link_to src dst @IP @port`: the source resolves the peer address
    /// and creates its half of the link, then confirms with `/linked`.
    async fn handle_link_to(&mut self, msg: Message) -> Result<()> {
        let (fixed, params) = split_args(&msg.args);
        let (Some(src), Some(dst)) = (
            fixed.first().and_then(Arg::as_str),
            fixed.get(1).and_then(Arg::as_str),
        ) else {
            return Ok(());
        };

        if Some(src) != self.name.as_deref() {
            log::trace!("<{}> ignoring /link_to {} {}", self.debug_name(), src, dst);
            return Ok(());
        }
        log::trace!("<{}> got /link_to {} {}", self.debug_name(), src, dst);

        if self.link_to(dst).is_some() {
            // already linked, nothing to do
            return Ok(());
        }

        let Some(host) = params.if_str(Param::Ip).or(params.if_str(Param::Host)) else {
            log::trace!("can't perform /link_to, host unknown");
            return Ok(());
        };
        let Some(port) = params.if_i32(Param::Port) else {
            log::trace!("can't perform /link_to, port unknown");
            return Ok(());
        };
        let Ok(ip) = host.parse::<IpAddr>() else {
            log::trace!("can't perform /link_to, bad host {host:?}");
            return Ok(());
        };

        let dst = dst.to_owned();
        self.links.push(Link {
            remote_name: dst.clone(),
            remote_id: name_hash(&dst),
            data_addr: SocketAddr::new(ip, port as u16),
            num_incoming_maps: 0,
            num_outgoing_maps: 0,
        });
        log::trace!("new router to {} -> {}:{}", dst, host, port);

        let src = src.to_owned();
        self.db
            .add_or_update_link(&src, &dst, true, self.clock.now);

        let args = vec![Arg::Str(src), Arg::Str(dst.clone())];
        self.bus.send(&Message::new("/linked", args)).await?;

        // replay any maps that were waiting for this link
        let pending: Vec<Message> = {
            let mut kept = Vec::new();
            let mut flushed = Vec::new();
            for (target, msg) in std::mem::take(&mut self.pending_maps) {
                if target == dst {
                    flushed.push(msg);
                } else {
                    kept.push((target, msg));
                }
            }
            self.pending_maps = kept;
            flushed
        };
        for msg in pending {
            self.handle_map_to(msg).await?;
        }
        Ok(())
    }

    /// `/linked src dst`: record the link in the replica; the destination
    /// endpoint materialises its own half from the device record.
    fn handle_linked(&mut self, msg: Message) -> Result<()> {
        let (fixed, _) = split_args(&msg.args);
        let (Some(src), Some(dst)) = (
            fixed.first().and_then(Arg::as_str),
            fixed.get(1).and_then(Arg::as_str),
        ) else {
            return Ok(());
        };
        log::trace!("<{}> got /linked {} {}", self.debug_name(), src, dst);

        let us = self.name.as_deref();
        let local = Some(src) == us || Some(dst) == us;
        let (src, dst) = (src.to_owned(), dst.to_owned());
        self.db
            .add_or_update_link(&src, &dst, local, self.clock.now);

        if Some(dst.as_str()) == self.name.as_deref()
            && src != dst
            && self.link_to(&src).is_none()
        {
            if let Some(dev) = self.db.device_by_name(&src) {
                if let (Some(host), Some(port)) = (dev.host.clone(), dev.port) {
                    if let Ok(ip) = host.parse::<IpAddr>() {
                        self.links.push(Link {
                            remote_name: src.clone(),
                            remote_id: dev.id,
                            data_addr: SocketAddr::new(ip, port),
                            num_incoming_maps: 0,
                            num_outgoing_maps: 0,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// `/unlink src dst`: the source tears down the link and every map
    /// riding on it, then confirms with `/unlinked`.
    async fn handle_unlink(&mut self, msg: Message) -> Result<()> {
        let (fixed, _) = split_args(&msg.args);
        let (Some(src), Some(dst)) = (
            fixed.first().and_then(Arg::as_str),
            fixed.get(1).and_then(Arg::as_str),
        ) else {
            return Ok(());
        };
        log::trace!("<{}> got /unlink {} {}", self.debug_name(), src, dst);

        if Some(src) != self.name.as_deref() {
            return Ok(());
        }
        let (src, dst) = (src.to_owned(), dst.to_owned());

        let Some(idx) = self.link_to(&dst) else {
            return Ok(());
        };
        self.links.remove(idx);

        // drop the maps that rode on this link
        let doomed: Vec<(u64, Vec<Arg>)> = self
            .db
            .maps()
            .filter(|m| m.sourced_by(&src) && m.destination.device == dst)
            .map(|m| (m.id, m.name_args()))
            .collect();
        for (id, args) in doomed {
            self.db.remove_map(id);
            self.bus.send(&Message::new("/unmapped", args)).await?;
        }

        self.db.remove_link(crate::db::LinkRecord::link_id(&src, &dst));
        let args = vec![Arg::Str(src), Arg::Str(dst)];
        self.bus.send(&Message::new("/unlinked", args)).await
    }

    fn handle_unlinked(&mut self, msg: Message) -> Result<()> {
        let (fixed, _) = split_args(&msg.args);
        let (Some(src), Some(dst)) = (
            fixed.first().and_then(Arg::as_str),
            fixed.get(1).and_then(Arg::as_str),
        ) else {
            return Ok(());
        };
        log::trace!("<{}> got /unlinked {} {}", self.debug_name(), src, dst);

        self.db
            .remove_link(crate::db::LinkRecord::link_id(src, dst));
        if Some(dst) == self.name.as_deref() {
            let src = src.to_owned();
            self.links.retain(|l| l.remote_name != src);
        }
        Ok(())
    }

    /// `/map src… dst`: the destination device validates its input and
    /// replies `/map_to` enriched with the input's metadata and its own
    /// endpoint address.
    async fn handle_map(&mut self, msg: Message) -> Result<()> {
        let Some((srcs, dst, params)) = parse_map_args(&msg.args) else {
            return Ok(());
        };
        let Ok((dst_dev, dst_sig)) = parse_signal_path(dst) else {
            return Ok(());
        };
        if Some(dst_dev) != self.name.as_deref() {
            return Ok(());
        }
        log::trace!("<{}> got /map {:?} {}", self.debug_name(), srcs, dst);

        let Some(sig) = self
            .db
            .device_signal_by_name(dst_dev, dst_sig)
            .filter(|s| s.local && s.direction.matches(Some(Direction::Incoming)))
        else {
            log::trace!("<{}> /map names unknown input {}", self.debug_name(), dst);
            return Ok(());
        };

        let mut reply = params.clone();
        reply.insert(Param::Type, vec![Arg::Char(sig.sig_type.tag())]);
        if let Some(min) = &sig.minimum {
            reply.insert(Param::Min, min.iter().map(|x| Arg::Double(*x)).collect());
        }
        if let Some(max) = &sig.maximum {
            reply.insert(Param::Max, max.iter().map(|x| Arg::Double(*x)).collect());
        }
        reply.insert(
            Param::Ip,
            vec![Arg::Str(self.bus.interface_ip().to_string())],
        );
        reply.insert(Param::Port, vec![Arg::Int(self.port.value as i32)]);
        if !params.contains(Param::Id) {
            let id = self.db.generate_map_id(self.device_id);
            reply.insert(Param::Id, vec![Arg::Long(id as i64)]);
        }

        let mut args: Vec<Arg> = srcs.iter().map(|s| Arg::Str((*s).to_owned())).collect();
        args.push(Arg::Str(dst.to_owned()));
        reply.append_to(&mut args);
        self.bus.send(&Message::new("/map_to", args)).await
    }

    /// `/map_to src… dst @…`: the source endpoint builds the map state.
    /// Without a link to the destination the message is parked and a
    /// `/link` handshake started; otherwise the map becomes `Ready` and
    /// the canonical `/mapped` announcement goes out.
    async fn handle_map_to(&mut self, msg: Message) -> Result<()> {
        let Some((srcs, dst, params)) = parse_map_args(&msg.args) else {
            return Ok(());
        };
        let Some(us) = self.name.clone() else {
            return Ok(());
        };

        // every source slot must be ours; otherwise the message is not
        // addressed to this device
        let mut src_devs = Vec::with_capacity(srcs.len());
        for src in &srcs {
            let Ok((dev, _)) = parse_signal_path(src) else {
                return Ok(());
            };
            src_devs.push(dev);
        }
        if !src_devs.iter().all(|d| *d == us) {
            log::trace!("<{}> ignoring /map_to for {:?}", self.debug_name(), srcs);
            return Ok(());
        }
        let Ok((dst_dev, _)) = parse_signal_path(dst) else {
            return Ok(());
        };
        log::trace!("<{}> got /map_to {:?} {}", self.debug_name(), srcs, dst);

        if self.link_to(dst_dev).is_none() {
            // park the map until the link handshake completes
            let dst_dev = dst_dev.to_owned();
            let link_args = vec![Arg::Str(us.clone()), Arg::Str(dst_dev.clone())];
            self.pending_maps.push((dst_dev, msg.clone()));
            return self.bus.send(&Message::new("/link", link_args)).await;
        }

        let id = match params.if_i64(Param::Id) {
            Some(id) => id as u64,
            None => match self.db.map_by_names(&srcs, dst) {
                Some(map) => map.id,
                None => self.db.generate_map_id(self.device_id),
            },
        };

        let dst = dst.to_owned();
        let srcs: Vec<String> = srcs.iter().map(|s| (*s).to_owned()).collect();
        let src_refs: Vec<&str> = srcs.iter().map(String::as_str).collect();
        // a map we staged ourselves already has a record; the link count
        // moves on the first transition into Ready either way
        let first_ready = !matches!(
            self.db.map_by_id(id).map(|m| m.status),
            Some(s) if s >= MapStatus::Ready
        );
        self.db
            .add_or_update_map(id, &src_refs, &dst, &params, self.clock.now)?;

        // resolve local signal metadata into the source slots
        let slot_names: Vec<(String, String)> = {
            let map = self.db.map_by_id(id).unwrap();
            map.sources
                .iter()
                .map(|s| (s.device.clone(), s.signal.clone()))
                .collect()
        };
        let mut resolved = Vec::with_capacity(slot_names.len());
        for (dev, sig_name) in &slot_names {
            if let Some(sig) = self.db.device_signal_by_name(dev, sig_name) {
                resolved.push((
                    dev.clone(),
                    sig_name.clone(),
                    sig.sig_type,
                    sig.length,
                    sig.num_instances,
                    sig.minimum.clone(),
                    sig.maximum.clone(),
                ));
            }
        }

        let map = self.db.map_by_id_mut(id).unwrap();
        map.local = true;
        map.status = MapStatus::Ready;
        if map.scope.is_empty() {
            map.scope = vec![us.clone()];
        }
        let mut src_min = None;
        let mut src_max = None;
        for (dev, sig_name, sig_type, length, instances, min, max) in resolved {
            if src_min.is_none() {
                src_min = min.as_ref().and_then(|v| v.first().copied());
                src_max = max.as_ref().and_then(|v| v.first().copied());
            }
            if let Some(slot) = map
                .sources
                .iter_mut()
                .find(|s| s.device == dev && s.signal == sig_name)
            {
                slot.sig_type = Some(sig_type);
                slot.length = length;
                slot.num_instances = instances;
                slot.use_as_instance = instances > 1;
                if slot.minimum.is_none() {
                    slot.minimum = min;
                }
                if slot.maximum.is_none() {
                    slot.maximum = max;
                }
            }
        }

        // the linear default needs extents for both ends of the route
        if map.range.is_none() {
            let dst_min = map
                .destination
                .minimum
                .as_ref()
                .and_then(|v| v.first().copied());
            let dst_max = map
                .destination
                .maximum
                .as_ref()
                .and_then(|v| v.first().copied());
            if let (Some(a), Some(b), Some(c), Some(d)) = (src_min, src_max, dst_min, dst_max) {
                map.range = Some([a as f32, b as f32, c as f32, d as f32]);
            }
        }
        map.apply_default_mode(&params);

        if first_ready {
            if let Some(idx) = self.link_to(dst_dev) {
                self.links[idx].num_outgoing_maps += 1;
            }
            self.bump_map_counts();
        }
        self.version += 1;

        let map = self.db.map_by_id(id).unwrap();
        let mut args = map.name_args();
        map.canonical_params().append_to(&mut args);
        self.bus.send(&Message::new("/mapped", args)).await
    }

    /// `/mapped src… dst @…`: every observer records the canonical state;
    /// the endpoints promote their local state to `Active`. Duplicates
    /// only refresh `synced` and never trigger a reciprocal announcement.
    fn handle_mapped(&mut self, msg: Message) -> Result<()> {
        let Some((srcs, dst, params)) = parse_map_args(&msg.args) else {
            return Ok(());
        };
        let id = match params.if_i64(Param::Id) {
            Some(id) => id as u64,
            None => match self.db.map_by_names(&srcs, dst) {
                Some(map) => map.id,
                None => return Ok(()),
            },
        };
        log::trace!("<{}> got /mapped {:?} {}", self.debug_name(), srcs, dst);

        let created = self.db.map_by_id(id).is_none();
        let dst = dst.to_owned();
        let srcs_owned: Vec<String> = srcs.iter().map(|s| (*s).to_owned()).collect();
        let src_refs: Vec<&str> = srcs_owned.iter().map(String::as_str).collect();
        self.db
            .add_or_update_map(id, &src_refs, &dst, &params, self.clock.now)?;

        if let Some(us) = self.name.clone() {
            let (involved, incoming, src_dev) = {
                let map = self.db.map_by_id_mut(id).unwrap();
                if !map.has_endpoint_on(&us) {
                    (false, false, None)
                } else {
                    map.local = true;
                    if map.status < MapStatus::Active {
                        map.status = MapStatus::Active;
                    }
                    (
                        true,
                        map.destination.device == us,
                        map.sources.first().map(|s| s.device.clone()),
                    )
                }
            };
            if involved {
                if incoming && created {
                    if let Some(src_dev) = src_dev {
                        if let Some(idx) = self.link_to(&src_dev) {
                            self.links[idx].num_incoming_maps += 1;
                        }
                    }
                }
                self.bump_map_counts();
            }
        }
        Ok(())
    }

    /// `/map/modify`: only the source endpoint is authoritative for the
    /// transformation; anyone else drops the request silently. The diff
    /// is applied and the canonical state re-announced.
    async fn handle_map_modify(&mut self, msg: Message) -> Result<()> {
        let Some((srcs, dst, params)) = parse_map_args(&msg.args) else {
            return Ok(());
        };
        let Some(us) = self.name.clone() else {
            return Ok(());
        };

        let id = match params.if_i64(Param::Id) {
            Some(id) => id as u64,
            None => match self.db.map_by_names(&srcs, dst) {
                Some(map) => map.id,
                None => return Ok(()),
            },
        };
        let debug_name = self.debug_name();
        let Some(map) = self.db.map_by_id_mut(id) else {
            return Ok(());
        };
        if !map.sourced_by(&us) || map.status < MapStatus::Ready {
            return Ok(());
        }
        log::trace!("<{}> got /map/modify {:?} {}", debug_name, srcs, dst);

        let updated = map.set_from_params(&params);
        if updated {
            map.version += 1;
            self.version += 1;
        }

        let map = self.db.map_by_id(id).unwrap();
        let mut args = map.name_args();
        map.canonical_params().append_to(&mut args);
        self.bus.send(&Message::new("/mapped", args)).await
    }

    /// `/unmap src… dst`: the source endpoint removes the map and
    /// announces `/unmapped`; the link goes too once its last map is
    /// gone.
    async fn handle_unmap(&mut self, msg: Message) -> Result<()> {
        let Some((srcs, dst, params)) = parse_map_args(&msg.args) else {
            return Ok(());
        };
        let Some(us) = self.name.clone() else {
            return Ok(());
        };

        let id = match params.if_i64(Param::Id) {
            Some(id) => id as u64,
            None => match self.db.map_by_names(&srcs, dst) {
                Some(map) => map.id,
                None => return Ok(()),
            },
        };
        let Some(map) = self.db.map_by_id(id) else {
            return Ok(());
        };
        if !map.sourced_by(&us) {
            return Ok(());
        }
        log::trace!("<{}> got /unmap {:?} {}", self.debug_name(), srcs, dst);

        let dst_dev = map.destination.device.clone();
        let args = map.name_args();
        self.db.remove_map(id);
        self.version += 1;
        self.bump_map_counts();
        self.bus.send(&Message::new("/unmapped", args)).await?;

        if let Some(idx) = self.link_to(&dst_dev) {
            let link = &mut self.links[idx];
            link.num_outgoing_maps = link.num_outgoing_maps.saturating_sub(1);
            if link.num_incoming_maps == 0 && link.num_outgoing_maps == 0 {
                // the last map is gone; retire the link as well
                let args = vec![Arg::Str(us), Arg::Str(dst_dev)];
                self.bus.send(&Message::new("/unlink", args)).await?;
            }
        }
        Ok(())
    }

    fn handle_unmapped(&mut self, msg: Message) -> Result<()> {
        let Some((srcs, dst, params)) = parse_map_args(&msg.args) else {
            return Ok(());
        };
        let id = match params.if_i64(Param::Id) {
            Some(id) => id as u64,
            None => match self.db.map_by_names(&srcs, dst) {
                Some(map) => map.id,
                None => return Ok(()),
            },
        };
        log::trace!("<{}> got /unmapped {:?} {}", self.debug_name(), srcs, dst);

        let Some(map) = self.db.map_by_id(id) else {
            return Ok(()); // removing twice is fine
        };

        if let Some(us) = self.name.clone() {
            if map.destination.device == us {
                if let Some(src_dev) = map.sources.first().map(|s| s.device.clone()) {
                    if let Some(idx) = self.link_to(&src_dev) {
                        let link = &mut self.links[idx];
                        link.num_incoming_maps = link.num_incoming_maps.saturating_sub(1);
                    }
                }
            }
        }
        self.db.remove_map(id);
        self.bump_map_counts();
        Ok(())
    }

    /// `/{device}/signal name @…`: a peer advertising one of its signals.
    fn handle_signal_info(&mut self, msg: Message) -> Result<()> {
        let Some(device) = msg.path.strip_suffix("/signal") else {
            return Ok(());
        };
        if Some(device) == self.name.as_deref() {
            return Ok(());
        }
        let (fixed, params) = split_args(&msg.args);
        let Some(name) = fixed.first().and_then(Arg::as_str) else {
            return Ok(());
        };
        let (device, name) = (device.to_owned(), name.to_owned());
        self.db.add_or_update_signal(&device, &name, &params);
        self.db.touch_device(&device, self.clock.now);
        Ok(())
    }

    fn handle_signal_removed(&mut self, msg: Message) -> Result<()> {
        let Some(device) = msg.path.strip_suffix("/signal/removed") else {
            return Ok(());
        };
        if Some(device) == self.name.as_deref() {
            return Ok(());
        }
        let (fixed, _) = split_args(&msg.args);
        let Some(name) = fixed.first().and_then(Arg::as_str) else {
            return Ok(());
        };
        let (device, name) = (device.to_owned(), name.to_owned());
        self.db.remove_signal_by_name(&device, &name);
        Ok(())
    }

    /// `/{name}/subscribe flags… @lease n`: store the subscriber and push
    /// the current state it asked for over the mesh.
    async fn handle_subscribe(&mut self, msg: Message, src: SocketAddr) -> Result<()> {
        let (fixed, params) = split_args(&msg.args);

        let mut flags = SubscribeFlags::NONE;
        for arg in fixed {
            if let Some(token) = arg.as_str() {
                flags = flags | SubscribeFlags::from_token(token);
            }
        }
        if flags.is_empty() {
            flags = SubscribeFlags::ALL;
        }
        let lease = params.if_i32(Param::Lease).unwrap_or(SUBSCRIBE_INTERVAL_SEC as i32);
        let lease_expiration_sec = self.clock.now.sec + lease.max(0) as u32;

        match self.subscribers.iter_mut().find(|s| s.addr == src) {
            Some(sub) => {
                sub.flags = flags;
                sub.lease_expiration_sec = lease_expiration_sec;
            }
            None => self.subscribers.push(Subscriber {
                addr: src,
                flags,
                lease_expiration_sec,
            }),
        }
        log::trace!("<{}> subscriber {} flags {}", self.debug_name(), src, flags);

        if flags.intersects(SubscribeFlags::DEVICE) {
            let reply = self.registered_message();
            self.bus.send_to(&reply, src).await?;
        }
        if flags.intersects(SubscribeFlags::SIGNALS) {
            self.push_signals(src, flags).await?;
        }
        if flags.intersects(SubscribeFlags::MAPS) {
            self.push_maps(src, flags).await?;
        }
        Ok(())
    }

    async fn push_signals(&self, dest: SocketAddr, flags: SubscribeFlags) -> Result<()> {
        let Some(us) = self.name.as_deref() else {
            return Ok(());
        };
        let dir = if flags.contains(SubscribeFlags::SIGNALS) {
            None
        } else if flags.intersects(SubscribeFlags::INPUTS) {
            Some(Direction::Incoming)
        } else {
            Some(Direction::Outgoing)
        };
        let msgs: Vec<Message> = self
            .db
            .device_signals(us, dir)
            .map(|sig| {
                let mut args = vec![Arg::Str(sig.name.clone())];
                sig.advertisement().append_to(&mut args);
                Message::new(format!("{us}/signal"), args)
            })
            .collect();
        for msg in msgs {
            self.bus.send_to(&msg, dest).await?;
        }
        Ok(())
    }

    async fn push_maps(&self, dest: SocketAddr, flags: SubscribeFlags) -> Result<()> {
        let Some(us) = self.name.as_deref() else {
            return Ok(());
        };
        let dir = if flags.contains(SubscribeFlags::MAPS) {
            None
        } else if flags.intersects(SubscribeFlags::MAPS_IN) {
            Some(Direction::Incoming)
        } else {
            Some(Direction::Outgoing)
        };
        let msgs: Vec<Message> = self
            .db
            .device_maps(us, dir)
            .filter(|m| m.status >= MapStatus::Ready)
            .map(|m| {
                let mut args = m.name_args();
                m.canonical_params().append_to(&mut args);
                Message::new("/mapped", args)
            })
            .collect();
        for msg in msgs {
            self.bus.send_to(&msg, dest).await?;
        }
        Ok(())
    }

    async fn send_namespace(&self, dest: SocketAddr) -> Result<()> {
        self.push_signals(dest, SubscribeFlags::SIGNALS).await
    }

    async fn send_links(&self, dest: SocketAddr) -> Result<()> {
        let Some(us) = self.name.as_deref() else {
            return Ok(());
        };
        for link in &self.links {
            let msg = Message::new(
                "/linked",
                vec![Arg::Str(us.to_owned()), Arg::Str(link.remote_name.clone())],
            );
            self.bus.send_to(&msg, dest).await?;
        }
        Ok(())
    }

    async fn send_maps(&self, dest: SocketAddr) -> Result<()> {
        self.push_maps(dest, SubscribeFlags::MAPS).await
    }

    fn bump_map_counts(&mut self) {
        let Some(name) = self.name.clone() else {
            return;
        };
        let incoming = self
            .db
            .device_maps(&name, Some(Direction::Incoming))
            .count() as i32;
        let outgoing = self
            .db
            .device_maps(&name, Some(Direction::Outgoing))
            .count() as i32;
        if let Some(dev) = self.db.device_by_name_mut(&name) {
            dev.num_incoming_maps = incoming;
            dev.num_outgoing_maps = outgoing;
        }
    }

    fn debug_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("/{}.?", self.identifier),
        }
    }
}

/// Parses "/identifier.ordinal" the way the allocator advertises it.
/// Trailing junk after the digits is tolerated, digits are required.
fn parse_device_name(name: &str) -> Option<(&str, u32)> {
    let rest = name.strip_prefix('/')?;
    let (identifier, suffix) = rest.split_once('.')?;
    let digits: String = suffix.chars().take_while(|c| c.is_ascii_digit()).collect();
    if identifier.is_empty() || digits.is_empty() {
        return None;
    }
    Some((identifier, digits.parse().ok()?))
}

/// Splits map message arguments into source names, destination name, and
/// parameters. At least one source and the destination are required.
fn parse_map_args(args: &[Arg]) -> Option<(Vec<&str>, &str, ParamSet)> {
    let (fixed, params) = split_args(args);
    let mut names = Vec::with_capacity(fixed.len());
    for arg in fixed {
        names.push(arg.as_str()?);
    }
    if names.len() < 2 {
        return None;
    }
    let dst = names.pop()?;
    Some((names, dst, params))
}
