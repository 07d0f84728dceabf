#[cfg(test)]
mod db_test;

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::rc::Rc;

use crc::{Crc, CRC_32_ISO_HDLC};

use crate::clock::Timetag;
use crate::map::{Direction, MapRecord, SignalType, Slot};
use crate::message::{parse_signal_path, Arg, Param, ParamSet};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Stable 64-bit id of a canonical name: crc32 of the name without its
/// leading slash, in the upper half so the lower half can carry counters.
pub fn name_hash(name: &str) -> u64 {
    (CRC32.checksum(skip_slash(name).as_bytes()) as u64) << 32
}

pub fn skip_slash(name: &str) -> &str {
    name.strip_prefix('/').unwrap_or(name)
}

fn canonical(name: &str) -> String {
    if name.starts_with('/') {
        name.to_owned()
    } else {
        format!("/{name}")
    }
}

/// What happened to a record when a callback fires.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RecordAction {
    Added,
    Modified,
    Removed,
    Expired,
}

/// Comparison operator for property queries.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
    Exists,
    NotExists,
}

/// Classes of announcements a subscriber asks a device to push.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct SubscribeFlags(u16);

impl SubscribeFlags {
    pub const NONE: SubscribeFlags = SubscribeFlags(0);
    pub const DEVICE: SubscribeFlags = SubscribeFlags(0x01);
    pub const INPUTS: SubscribeFlags = SubscribeFlags(0x02);
    pub const OUTPUTS: SubscribeFlags = SubscribeFlags(0x04);
    pub const SIGNALS: SubscribeFlags = SubscribeFlags(0x02 | 0x04);
    pub const MAPS_IN: SubscribeFlags = SubscribeFlags(0x08);
    pub const MAPS_OUT: SubscribeFlags = SubscribeFlags(0x10);
    pub const MAPS: SubscribeFlags = SubscribeFlags(0x08 | 0x10);
    pub const ALL: SubscribeFlags = SubscribeFlags(0x1f);

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn intersects(self, other: SubscribeFlags) -> bool {
        self.0 & other.0 != 0
    }

    pub fn contains(self, other: SubscribeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Wire tokens carried in a `/subscribe` message.
    pub fn tokens(self) -> Vec<&'static str> {
        if self.contains(SubscribeFlags::ALL) {
            return vec!["all"];
        }
        let mut out = Vec::new();
        if self.contains(SubscribeFlags::DEVICE) {
            out.push("device");
        }
        if self.contains(SubscribeFlags::SIGNALS) {
            out.push("signals");
        } else if self.contains(SubscribeFlags::INPUTS) {
            out.push("inputs");
        } else if self.contains(SubscribeFlags::OUTPUTS) {
            out.push("outputs");
        }
        if self.contains(SubscribeFlags::MAPS) {
            out.push("maps");
        } else if self.contains(SubscribeFlags::MAPS_IN) {
            out.push("incoming_maps");
        } else if self.contains(SubscribeFlags::MAPS_OUT) {
            out.push("outgoing_maps");
        }
        out
    }

    pub fn from_token(token: &str) -> SubscribeFlags {
        match token {
            "all" => SubscribeFlags::ALL,
            "device" => SubscribeFlags::DEVICE,
            "signals" => SubscribeFlags::SIGNALS,
            "inputs" => SubscribeFlags::INPUTS,
            "outputs" => SubscribeFlags::OUTPUTS,
            "maps" => SubscribeFlags::MAPS,
            "incoming_maps" => SubscribeFlags::MAPS_IN,
            "outgoing_maps" => SubscribeFlags::MAPS_OUT,
            _ => SubscribeFlags::NONE,
        }
    }
}

impl BitOr for SubscribeFlags {
    type Output = SubscribeFlags;

    fn bitor(self, rhs: SubscribeFlags) -> SubscribeFlags {
        SubscribeFlags(self.0 | rhs.0)
    }
}

impl fmt::Display for SubscribeFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tokens().join("|"))
    }
}

/// An autorenewing observation of a remote device's metadata.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub device_id: u64,
    pub flags: SubscribeFlags,
    pub lease_expiration_sec: u32,
}

/// A replica record of a device seen on the bus.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub id: u64,
    /// Canonical name, e.g. "/synth.1".
    pub name: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub lib_version: Option<String>,
    pub num_inputs: i32,
    pub num_outputs: i32,
    pub num_incoming_maps: i32,
    pub num_outgoing_maps: i32,
    /// Reported state version, bumped by the owner on any local change.
    pub version: i32,
    /// Last time this device was observed alive.
    pub synced: Timetag,
    pub local: bool,
    pub extra: HashMap<String, Vec<Arg>>,
}

impl DeviceRecord {
    fn new(name: &str) -> Self {
        let name = canonical(name);
        DeviceRecord {
            id: name_hash(&name),
            name,
            host: None,
            port: None,
            lib_version: None,
            num_inputs: 0,
            num_outputs: 0,
            num_incoming_maps: 0,
            num_outgoing_maps: 0,
            version: 0,
            synced: Timetag::default(),
            local: false,
            extra: HashMap::new(),
        }
    }

    fn set_from_params(&mut self, params: &ParamSet) -> bool {
        let mut updated = false;

        if let Some(host) = params.if_str(Param::Ip).or(params.if_str(Param::Host)) {
            if self.host.as_deref() != Some(host) {
                self.host = Some(host.to_owned());
                updated = true;
            }
        }
        if let Some(port) = params.if_i32(Param::Port) {
            let port = port as u16;
            if self.port != Some(port) {
                self.port = Some(port);
                updated = true;
            }
        }
        if let Some(v) = params.if_str(Param::LibVersion) {
            if self.lib_version.as_deref() != Some(v) {
                self.lib_version = Some(v.to_owned());
                updated = true;
            }
        }

        let counters = [
            (Param::NumInputs, &mut self.num_inputs),
            (Param::NumOutputs, &mut self.num_outputs),
            (Param::NumIncomingMaps, &mut self.num_incoming_maps),
            (Param::NumOutgoingMaps, &mut self.num_outgoing_maps),
        ];
        for (param, field) in counters {
            if let Some(v) = params.if_i32(param) {
                if *field != v {
                    *field = v;
                    updated = true;
                }
            }
        }

        if let Some(rev) = params.if_i32(Param::Rev) {
            if self.version != rev {
                self.version = rev;
                updated = true;
            }
        }

        for (key, vals) in params.extra() {
            if self.extra.get(key) != Some(vals) {
                self.extra.insert(key.clone(), vals.clone());
                updated = true;
            }
        }

        updated
    }

    /// Named property lookup for queries; extras may be addressed with or
    /// without their `@` prefix.
    pub fn property(&self, key: &str) -> Option<Vec<Arg>> {
        match key {
            "name" => Some(vec![Arg::Str(self.name.clone())]),
            "host" => self.host.as_ref().map(|h| vec![Arg::Str(h.clone())]),
            "port" => self.port.map(|p| vec![Arg::Int(p as i32)]),
            "lib_version" => self
                .lib_version
                .as_ref()
                .map(|v| vec![Arg::Str(v.clone())]),
            "num_inputs" => Some(vec![Arg::Int(self.num_inputs)]),
            "num_outputs" => Some(vec![Arg::Int(self.num_outputs)]),
            "num_incoming_maps" => Some(vec![Arg::Int(self.num_incoming_maps)]),
            "num_outgoing_maps" => Some(vec![Arg::Int(self.num_outgoing_maps)]),
            "version" => Some(vec![Arg::Int(self.version)]),
            "synced" => Some(vec![Arg::Time(self.synced)]),
            _ => lookup_extra(&self.extra, key),
        }
    }
}

/// A replica record of a signal bound to a device.
#[derive(Debug, Clone)]
pub struct SignalRecord {
    pub id: u64,
    /// Canonical name of the owning device.
    pub device: String,
    /// Bare signal name, unique within the device.
    pub name: String,
    pub direction: Direction,
    pub sig_type: SignalType,
    pub length: u32,
    pub num_instances: u32,
    pub minimum: Option<Vec<f64>>,
    pub maximum: Option<Vec<f64>>,
    pub unit: Option<String>,
    pub description: Option<String>,
    pub rate: f32,
    pub local: bool,
    pub extra: HashMap<String, Vec<Arg>>,
}

impl SignalRecord {
    pub(crate) fn new(device: &str, name: &str) -> Self {
        let device = canonical(device);
        let full = format!("{device}/{name}");
        SignalRecord {
            id: name_hash(&full),
            device,
            name: name.to_owned(),
            direction: Direction::Incoming,
            sig_type: SignalType::Int32,
            length: 1,
            num_instances: 1,
            minimum: None,
            maximum: None,
            unit: None,
            description: None,
            rate: 0.0,
            local: false,
            extra: HashMap::new(),
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.device, self.name)
    }

    fn set_from_params(&mut self, params: &ParamSet) -> bool {
        let mut updated = false;

        if let Some(tag) = params.if_char(Param::Type) {
            if let Some(t) = SignalType::from_tag(tag) {
                if self.sig_type != t {
                    self.sig_type = t;
                    updated = true;
                }
            }
        }
        if let Some(len) = params.if_i32(Param::Length) {
            let len = len.max(1) as u32;
            if self.length != len {
                self.length = len;
                updated = true;
            }
        }
        if let Some(dir) = params.if_str(Param::Direction).and_then(Direction::from_token) {
            if self.direction != dir {
                self.direction = dir;
                updated = true;
            }
        }
        if let Some(n) = params.if_i32(Param::Instances) {
            let n = n.max(1) as u32;
            if self.num_instances != n {
                self.num_instances = n;
                updated = true;
            }
        }
        if let Some(vals) = params.get(Param::Min) {
            let min: Option<Vec<f64>> = vals.iter().map(|a| a.as_f64()).collect();
            if min.is_some() && self.minimum != min {
                self.minimum = min;
                updated = true;
            }
        }
        if let Some(vals) = params.get(Param::Max) {
            let max: Option<Vec<f64>> = vals.iter().map(|a| a.as_f64()).collect();
            if max.is_some() && self.maximum != max {
                self.maximum = max;
                updated = true;
            }
        }
        if let Some(unit) = params.if_str(Param::Units) {
            if self.unit.as_deref() != Some(unit) {
                self.unit = Some(unit.to_owned());
                updated = true;
            }
        }
        if let Some(rate) = params.if_f32(Param::Rate) {
            if self.rate != rate {
                self.rate = rate;
                updated = true;
            }
        }

        for (key, vals) in params.extra() {
            if self.extra.get(key) != Some(vals) {
                self.extra.insert(key.clone(), vals.clone());
                updated = true;
            }
        }

        updated
    }

    pub fn property(&self, key: &str) -> Option<Vec<Arg>> {
        match key {
            "name" => Some(vec![Arg::Str(self.name.clone())]),
            "device" => Some(vec![Arg::Str(self.device.clone())]),
            "direction" => Some(vec![Arg::Str(self.direction.token().to_owned())]),
            "type" => Some(vec![Arg::Char(self.sig_type.tag())]),
            "length" => Some(vec![Arg::Int(self.length as i32)]),
            "num_instances" => Some(vec![Arg::Int(self.num_instances as i32)]),
            "min" => self
                .minimum
                .as_ref()
                .map(|v| v.iter().map(|x| Arg::Double(*x)).collect()),
            "max" => self
                .maximum
                .as_ref()
                .map(|v| v.iter().map(|x| Arg::Double(*x)).collect()),
            "unit" => self.unit.as_ref().map(|u| vec![Arg::Str(u.clone())]),
            "description" => self
                .description
                .as_ref()
                .map(|d| vec![Arg::Str(d.clone())]),
            "rate" => Some(vec![Arg::Float(self.rate)]),
            _ => lookup_extra(&self.extra, key),
        }
    }

    /// The advertisement pushed to subscribers and namespace queries.
    pub fn advertisement(&self) -> ParamSet {
        let mut params = ParamSet::new();
        params.insert(Param::Type, vec![Arg::Char(self.sig_type.tag())]);
        params.insert(Param::Length, vec![Arg::Int(self.length as i32)]);
        params.insert(
            Param::Direction,
            vec![Arg::Str(self.direction.token().to_owned())],
        );
        if let Some(min) = &self.minimum {
            params.insert(Param::Min, min.iter().map(|x| Arg::Double(*x)).collect());
        }
        if let Some(max) = &self.maximum {
            params.insert(Param::Max, max.iter().map(|x| Arg::Double(*x)).collect());
        }
        if let Some(unit) = &self.unit {
            params.insert(Param::Units, vec![Arg::Str(unit.clone())]);
        }
        if self.rate != 0.0 {
            params.insert(Param::Rate, vec![Arg::Float(self.rate)]);
        }
        if self.num_instances > 1 {
            params.insert(
                Param::Instances,
                vec![Arg::Int(self.num_instances as i32)],
            );
        }
        params
    }
}

/// A replica record of a data-plane link between two devices.
#[derive(Debug, Clone)]
pub struct LinkRecord {
    pub id: u64,
    /// Canonical name of the source device.
    pub src: String,
    /// Canonical name of the destination device.
    pub dst: String,
    pub synced: Timetag,
    pub local: bool,
}

impl LinkRecord {
    pub fn link_id(src: &str, dst: &str) -> u64 {
        name_hash(&format!("{}>{}", skip_slash(src), skip_slash(dst)))
    }
}

type Callback<R> = Rc<RefCell<dyn FnMut(&R, RecordAction)>>;

/// The polymorphic handler set: each registration gets a token so it can
/// be removed again without function-pointer identity.
struct CallbackList<R> {
    entries: Vec<(u64, Callback<R>)>,
    next_token: u64,
}

impl<R> Default for CallbackList<R> {
    fn default() -> Self {
        CallbackList {
            entries: Vec::new(),
            next_token: 1,
        }
    }
}

impl<R> CallbackList<R> {
    fn add(&mut self, cb: impl FnMut(&R, RecordAction) + 'static) -> u64 {
        let token = self.next_token;
        self.next_token += 1;
        self.entries.push((token, Rc::new(RefCell::new(cb))));
        token
    }

    fn remove(&mut self, token: u64) {
        self.entries.retain(|(t, _)| *t != token);
    }

    /// Fires on a snapshot of the list, so a callback may add or remove
    /// registrations (including its own) while running.
    fn fire(&self, record: &R, action: RecordAction) {
        let snapshot: Vec<Callback<R>> = self.entries.iter().map(|(_, cb)| cb.clone()).collect();
        for cb in snapshot {
            (cb.borrow_mut())(record, action);
        }
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

/// The soft-state replica of everything observed on the bus: devices,
/// signals, maps, and links, with callbacks per category, predicate
/// queries, and timeout-based expiry.
pub struct Db {
    devices: Vec<DeviceRecord>,
    signals: Vec<SignalRecord>,
    maps: Vec<MapRecord>,
    links: Vec<LinkRecord>,

    device_callbacks: CallbackList<DeviceRecord>,
    signal_callbacks: CallbackList<SignalRecord>,
    map_callbacks: CallbackList<MapRecord>,
    link_callbacks: CallbackList<LinkRecord>,

    pub(crate) subscriptions: Vec<Subscription>,
    pub(crate) autosubscribe: SubscribeFlags,

    timeout_sec: u32,
    resource_counter: u32,
}

impl Default for Db {
    fn default() -> Self {
        Db::new(crate::config::DEFAULT_TIMEOUT_SEC)
    }
}

impl Db {
    pub fn new(timeout_sec: u32) -> Self {
        Db {
            devices: Vec::new(),
            signals: Vec::new(),
            maps: Vec::new(),
            links: Vec::new(),
            device_callbacks: CallbackList::default(),
            signal_callbacks: CallbackList::default(),
            map_callbacks: CallbackList::default(),
            link_callbacks: CallbackList::default(),
            subscriptions: Vec::new(),
            autosubscribe: SubscribeFlags::NONE,
            timeout_sec,
            resource_counter: 0,
        }
    }

    pub fn set_timeout(&mut self, timeout_sec: u32) {
        self.timeout_sec = timeout_sec;
    }

    pub fn timeout(&self) -> u32 {
        self.timeout_sec
    }

    /// Allocates a map id within a device's id space.
    pub fn generate_map_id(&mut self, device_id: u64) -> u64 {
        self.resource_counter += 1;
        device_id | self.resource_counter as u64
    }

    pub fn add_device_callback(
        &mut self,
        cb: impl FnMut(&DeviceRecord, RecordAction) + 'static,
    ) -> u64 {
        self.device_callbacks.add(cb)
    }

    pub fn remove_device_callback(&mut self, token: u64) {
        self.device_callbacks.remove(token);
    }

    pub fn add_signal_callback(
        &mut self,
        cb: impl FnMut(&SignalRecord, RecordAction) + 'static,
    ) -> u64 {
        self.signal_callbacks.add(cb)
    }

    pub fn remove_signal_callback(&mut self, token: u64) {
        self.signal_callbacks.remove(token);
    }

    pub fn add_map_callback(&mut self, cb: impl FnMut(&MapRecord, RecordAction) + 'static) -> u64 {
        self.map_callbacks.add(cb)
    }

    pub fn remove_map_callback(&mut self, token: u64) {
        self.map_callbacks.remove(token);
    }

    pub fn add_link_callback(
        &mut self,
        cb: impl FnMut(&LinkRecord, RecordAction) + 'static,
    ) -> u64 {
        self.link_callbacks.add(cb)
    }

    pub fn remove_link_callback(&mut self, token: u64) {
        self.link_callbacks.remove(token);
    }

    pub fn remove_all_callbacks(&mut self) {
        self.device_callbacks.clear();
        self.signal_callbacks.clear();
        self.map_callbacks.clear();
        self.link_callbacks.clear();
    }

    /**** Device records ****/

    /// Creates or refreshes a device record from announcement parameters.
    /// `synced` is refreshed on every touch.
    pub fn add_or_update_device(&mut self, name: &str, params: &ParamSet, now: Timetag) -> u64 {
        let name = canonical(name);
        let (idx, created) = match self.devices.iter().position(|d| d.name == name) {
            Some(idx) => (idx, false),
            None => {
                self.devices.push(DeviceRecord::new(&name));
                (self.devices.len() - 1, true)
            }
        };

        let dev = &mut self.devices[idx];
        let updated = dev.set_from_params(params);
        if now > dev.synced {
            dev.synced = now;
        }
        let id = dev.id;

        if created || updated {
            let action = if created {
                RecordAction::Added
            } else {
                RecordAction::Modified
            };
            let record = self.devices[idx].clone();
            self.device_callbacks.fire(&record, action);
        }
        id
    }

    pub fn touch_device(&mut self, name: &str, now: Timetag) {
        let name = canonical(name);
        if let Some(dev) = self.devices.iter_mut().find(|d| d.name == name) {
            if now > dev.synced {
                dev.synced = now;
            }
        }
    }

    /// Removes a device and cascades: its signals go, maps referencing
    /// those signals go unless the map has a local endpoint elsewhere,
    /// its links go, and its subscription record is dropped silently.
    pub fn remove_device(&mut self, id: u64, quiet: bool) {
        let Some(idx) = self.devices.iter().position(|d| d.id == id) else {
            return;
        };
        let name = self.devices[idx].name.clone();

        let map_ids: Vec<u64> = self
            .maps
            .iter()
            .filter(|m| m.has_endpoint_on(&name) && !m.local)
            .map(|m| m.id)
            .collect();
        for map_id in map_ids {
            self.remove_map(map_id);
        }

        let signal_ids: Vec<u64> = self
            .signals
            .iter()
            .filter(|s| s.device == name)
            .map(|s| s.id)
            .collect();
        for sig_id in signal_ids {
            self.remove_signal(sig_id);
        }

        let link_ids: Vec<u64> = self
            .links
            .iter()
            .filter(|l| l.src == name || l.dst == name)
            .map(|l| l.id)
            .collect();
        for link_id in link_ids {
            self.remove_link(link_id);
        }

        self.subscriptions.retain(|s| s.device_id != id);

        let record = self.devices.remove(idx);
        if !quiet {
            self.device_callbacks.fire(&record, RecordAction::Removed);
        }
    }

    /// Fires `Expired` then removes every non-local device whose last
    /// sync is older than the timeout window. Peers are assumed gone, so
    /// no `/unsubscribe` is owed for their subscription records.
    pub fn check_device_status(&mut self, now_sec: u32) -> Vec<String> {
        let cutoff = now_sec.saturating_sub(self.timeout_sec);
        let expired: Vec<u64> = self
            .devices
            .iter()
            .filter(|d| !d.local && !d.synced.is_zero() && d.synced.sec < cutoff)
            .map(|d| d.id)
            .collect();

        let mut names = Vec::new();
        for id in expired {
            if let Some(dev) = self.devices.iter().find(|d| d.id == id) {
                names.push(dev.name.clone());
                let record = dev.clone();
                self.device_callbacks.fire(&record, RecordAction::Expired);
            }
            self.remove_device(id, false);
        }
        names
    }

    pub fn devices(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.iter()
    }

    pub fn local_devices(&self) -> impl Iterator<Item = &DeviceRecord> {
        self.devices.iter().filter(|d| d.local)
    }

    pub fn device_by_id(&self, id: u64) -> Option<&DeviceRecord> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn device_by_name(&self, name: &str) -> Option<&DeviceRecord> {
        let name = canonical(name);
        self.devices.iter().find(|d| d.name == name)
    }

    pub fn device_by_name_mut(&mut self, name: &str) -> Option<&mut DeviceRecord> {
        let name = canonical(name);
        self.devices.iter_mut().find(move |d| d.name == name)
    }

    pub fn devices_by_name_match<'a>(
        &'a self,
        pattern: &'a str,
    ) -> impl Iterator<Item = &'a DeviceRecord> + 'a {
        self.devices.iter().filter(move |d| d.name.contains(pattern))
    }

    pub fn devices_by_property<'a>(
        &'a self,
        key: &'a str,
        value: &'a [Arg],
        op: Op,
    ) -> impl Iterator<Item = &'a DeviceRecord> + 'a {
        self.devices
            .iter()
            .filter(move |d| match_property(d.property(key), value, op))
    }

    /**** Signal records ****/

    pub fn add_or_update_signal(&mut self, device: &str, name: &str, params: &ParamSet) -> u64 {
        let device = canonical(device);
        // the owning device record is implied even if unannounced yet
        if self.device_by_name(&device).is_none() {
            self.add_or_update_device(&device, &ParamSet::new(), Timetag::default());
        }

        let (idx, created) = match self
            .signals
            .iter()
            .position(|s| s.device == device && s.name == name)
        {
            Some(idx) => {
                if self.signals[idx].local {
                    // local metadata is authoritative; ignore echoes
                    return self.signals[idx].id;
                }
                (idx, false)
            }
            None => {
                self.signals.push(SignalRecord::new(&device, name));
                (self.signals.len() - 1, true)
            }
        };

        let updated = self.signals[idx].set_from_params(params);
        let id = self.signals[idx].id;

        if created || updated {
            let action = if created {
                RecordAction::Added
            } else {
                RecordAction::Modified
            };
            let record = self.signals[idx].clone();
            self.signal_callbacks.fire(&record, action);
        }
        id
    }

    pub(crate) fn insert_local_signal(&mut self, mut record: SignalRecord) -> u64 {
        record.local = true;
        let id = record.id;
        self.signals.push(record);
        let snapshot = self.signals.last().unwrap().clone();
        self.signal_callbacks.fire(&snapshot, RecordAction::Added);
        id
    }

    pub fn remove_signal(&mut self, id: u64) {
        let Some(idx) = self.signals.iter().position(|s| s.id == id) else {
            return;
        };
        let (device, name) = {
            let s = &self.signals[idx];
            (s.device.clone(), s.name.clone())
        };

        let map_ids: Vec<u64> = self
            .maps
            .iter()
            .filter(|m| {
                !m.local
                    && (m.destination.refers_to(&device, &name)
                        || m.sources.iter().any(|s| s.refers_to(&device, &name)))
            })
            .map(|m| m.id)
            .collect();
        for map_id in map_ids {
            self.remove_map(map_id);
        }

        let record = self.signals.remove(idx);
        self.signal_callbacks.fire(&record, RecordAction::Removed);
    }

    pub fn remove_signal_by_name(&mut self, device: &str, name: &str) {
        let device = canonical(device);
        if let Some(sig) = self
            .signals
            .iter()
            .find(|s| s.device == device && s.name == name && !s.local)
        {
            self.remove_signal(sig.id);
        }
    }

    pub fn signals(&self, dir: Option<Direction>) -> impl Iterator<Item = &SignalRecord> {
        self.signals.iter().filter(move |s| s.direction.matches(dir))
    }

    pub fn local_signals(&self) -> impl Iterator<Item = &SignalRecord> {
        self.signals.iter().filter(|s| s.local)
    }

    pub fn signal_by_id(&self, id: u64) -> Option<&SignalRecord> {
        self.signals.iter().find(|s| s.id == id)
    }

    pub fn signals_by_name<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a SignalRecord> + 'a {
        self.signals.iter().filter(move |s| s.name == name)
    }

    pub fn signals_by_name_match<'a>(
        &'a self,
        pattern: &'a str,
    ) -> impl Iterator<Item = &'a SignalRecord> + 'a {
        self.signals.iter().filter(move |s| s.name.contains(pattern))
    }

    pub fn signals_by_property<'a>(
        &'a self,
        key: &'a str,
        value: &'a [Arg],
        op: Op,
    ) -> impl Iterator<Item = &'a SignalRecord> + 'a {
        self.signals
            .iter()
            .filter(move |s| match_property(s.property(key), value, op))
    }

    pub fn device_signals<'a>(
        &'a self,
        device: &str,
        dir: Option<Direction>,
    ) -> impl Iterator<Item = &'a SignalRecord> + 'a {
        let device = canonical(device);
        self.signals
            .iter()
            .filter(move |s| s.device == device && s.direction.matches(dir))
    }

    pub fn device_signal_by_name(&self, device: &str, name: &str) -> Option<&SignalRecord> {
        let device = canonical(device);
        self.signals
            .iter()
            .find(|s| s.device == device && s.name == name)
    }

    pub(crate) fn signal_mut(&mut self, device: &str, name: &str) -> Option<&mut SignalRecord> {
        let device = canonical(device);
        self.signals
            .iter_mut()
            .find(move |s| s.device == device && s.name == name)
    }

    /**** Map records ****/

    /// Creates or refreshes a map record. Creation resolves the named
    /// slots (adding placeholder signal records where needed); updates may
    /// extend a convergent map with additional sources. Slot order is the
    /// lexicographic `(device, signal)` invariant; each slot keeps the
    /// numeric id it was advertised under.
    pub fn add_or_update_map(
        &mut self,
        id: u64,
        src_names: &[&str],
        dst_name: &str,
        params: &ParamSet,
        now: Timetag,
    ) -> crate::error::Result<u64> {
        use crate::error::Error;

        if src_names.is_empty() {
            return Err(Error::ErrNoSources);
        }
        if src_names.len() > crate::map::MAX_NUM_SOURCES {
            return Err(Error::ErrTooManySources);
        }

        let existing = self.maps.iter().position(|m| m.id == id);
        let created = existing.is_none();

        let idx = match existing {
            Some(idx) => {
                // a convergent map may grow sources it did not know about
                for (slot_id, full) in src_names.iter().enumerate() {
                    let (dev, sig) = parse_signal_path(full)?;
                    let known = self.maps[idx]
                        .sources
                        .iter()
                        .any(|s| s.refers_to(dev, sig));
                    if !known {
                        self.add_or_update_signal(dev, sig, &ParamSet::new());
                        let mut slot = Slot::new(dev, sig, Direction::Outgoing);
                        slot.id = slot_id as u32;
                        self.maps[idx].sources.push(slot);
                        self.maps[idx].sort_sources();
                    }
                }
                idx
            }
            None => {
                let mut sources = Vec::with_capacity(src_names.len());
                for (slot_id, full) in src_names.iter().enumerate() {
                    let (dev, sig) = parse_signal_path(full)?;
                    self.add_or_update_signal(dev, sig, &ParamSet::new());
                    let mut slot = Slot::new(dev, sig, Direction::Outgoing);
                    slot.id = slot_id as u32;
                    sources.push(slot);
                }
                let (dev, sig) = parse_signal_path(dst_name)?;
                self.add_or_update_signal(dev, sig, &ParamSet::new());
                let destination = Slot::new(dev, sig, Direction::Incoming);

                self.maps.push(MapRecord::new(id, sources, destination));
                self.maps.len() - 1
            }
        };

        let map = &mut self.maps[idx];
        let updated = map.set_from_params(params);
        if now > map.synced {
            map.synced = now;
        }
        if created || updated {
            map.version += 1;
        }
        let id = map.id;

        if created || updated {
            let action = if created {
                RecordAction::Added
            } else {
                RecordAction::Modified
            };
            let record = self.maps[idx].clone();
            self.map_callbacks.fire(&record, action);
        }
        Ok(id)
    }

    pub(crate) fn insert_map(&mut self, record: MapRecord) -> u64 {
        let id = record.id;
        self.maps.push(record);
        let snapshot = self.maps.last().unwrap().clone();
        self.map_callbacks.fire(&snapshot, RecordAction::Added);
        id
    }

    pub fn remove_map(&mut self, id: u64) {
        let Some(idx) = self.maps.iter().position(|m| m.id == id) else {
            return;
        };
        let record = self.maps.remove(idx);
        self.map_callbacks.fire(&record, RecordAction::Removed);
    }

    pub fn maps(&self) -> impl Iterator<Item = &MapRecord> {
        self.maps.iter()
    }

    pub fn map_by_id(&self, id: u64) -> Option<&MapRecord> {
        self.maps.iter().find(|m| m.id == id)
    }

    pub(crate) fn map_by_id_mut(&mut self, id: u64) -> Option<&mut MapRecord> {
        self.maps.iter_mut().find(|m| m.id == id)
    }

    /// Finds a map by its advertised slot names.
    pub fn map_by_names(&self, src_names: &[&str], dst_name: &str) -> Option<&MapRecord> {
        self.maps.iter().find(|m| {
            m.destination.full_name() == dst_name
                && m.sources.len() == src_names.len()
                && src_names
                    .iter()
                    .all(|n| m.sources.iter().any(|s| s.full_name() == *n))
        })
    }

    pub fn maps_by_property<'a>(
        &'a self,
        key: &'a str,
        value: &'a [Arg],
        op: Op,
    ) -> impl Iterator<Item = &'a MapRecord> + 'a {
        self.maps
            .iter()
            .filter(move |m| match_property(map_property(m, key), value, op))
    }

    /// Maps with a slot whose property matches; `dir` restricts the side
    /// (incoming = destination slot, outgoing = source slots).
    pub fn maps_by_slot_property<'a>(
        &'a self,
        key: &'a str,
        value: &'a [Arg],
        op: Op,
        dir: Option<Direction>,
    ) -> impl Iterator<Item = &'a MapRecord> + 'a {
        self.maps.iter().filter(move |m| {
            let check_dst = Direction::Incoming.matches(dir);
            let check_src = Direction::Outgoing.matches(dir);
            (check_dst && match_property(slot_property(&m.destination, key), value, op))
                || (check_src
                    && m.sources
                        .iter()
                        .any(|s| match_property(slot_property(s, key), value, op)))
        })
    }

    pub fn device_maps<'a>(
        &'a self,
        device: &str,
        dir: Option<Direction>,
    ) -> impl Iterator<Item = &'a MapRecord> + 'a {
        let device = canonical(device);
        self.maps.iter().filter(move |m| {
            (Direction::Outgoing.matches(dir) && m.sources.iter().any(|s| s.device == device))
                || (Direction::Incoming.matches(dir) && m.destination.device == device)
        })
    }

    pub fn signal_maps<'a>(
        &'a self,
        device: &str,
        signal: &'a str,
        dir: Option<Direction>,
    ) -> impl Iterator<Item = &'a MapRecord> + 'a {
        let device = canonical(device);
        self.maps.iter().filter(move |m| {
            (Direction::Outgoing.matches(dir)
                && m.sources.iter().any(|s| s.refers_to(&device, signal)))
                || (Direction::Incoming.matches(dir) && m.destination.refers_to(&device, signal))
        })
    }

    pub fn local_maps(&self) -> impl Iterator<Item = &MapRecord> {
        self.maps.iter().filter(|m| m.local)
    }

    /**** Link records ****/

    pub fn add_or_update_link(&mut self, src: &str, dst: &str, local: bool, now: Timetag) -> u64 {
        let src = canonical(src);
        let dst = canonical(dst);
        let id = LinkRecord::link_id(&src, &dst);

        match self.links.iter_mut().find(|l| l.id == id) {
            Some(link) => {
                if now > link.synced {
                    link.synced = now;
                }
                if local && !link.local {
                    link.local = true;
                    let record = link.clone();
                    self.link_callbacks.fire(&record, RecordAction::Modified);
                }
            }
            None => {
                let record = LinkRecord {
                    id,
                    src,
                    dst,
                    synced: now,
                    local,
                };
                self.links.push(record.clone());
                self.link_callbacks.fire(&record, RecordAction::Added);
            }
        }
        id
    }

    pub fn remove_link(&mut self, id: u64) {
        let Some(idx) = self.links.iter().position(|l| l.id == id) else {
            return;
        };
        let record = self.links.remove(idx);
        self.link_callbacks.fire(&record, RecordAction::Removed);
    }

    pub fn links(&self) -> impl Iterator<Item = &LinkRecord> {
        self.links.iter()
    }

    pub fn link_by_names(&self, src: &str, dst: &str) -> Option<&LinkRecord> {
        let id = LinkRecord::link_id(&canonical(src), &canonical(dst));
        self.links.iter().find(|l| l.id == id)
    }

    pub fn device_links<'a>(&'a self, device: &str) -> impl Iterator<Item = &'a LinkRecord> + 'a {
        let device = canonical(device);
        self.links
            .iter()
            .filter(move |l| l.src == device || l.dst == device)
    }

    /**** Subscription records ****/

    pub fn subscriptions(&self) -> impl Iterator<Item = &Subscription> {
        self.subscriptions.iter()
    }

    pub fn subscription(&self, device_id: u64) -> Option<&Subscription> {
        self.subscriptions.iter().find(|s| s.device_id == device_id)
    }

    pub(crate) fn upsert_subscription(
        &mut self,
        device_id: u64,
        flags: SubscribeFlags,
        lease_expiration_sec: u32,
    ) {
        match self
            .subscriptions
            .iter_mut()
            .find(|s| s.device_id == device_id)
        {
            Some(s) => {
                s.flags = flags;
                s.lease_expiration_sec = lease_expiration_sec;
            }
            None => self.subscriptions.push(Subscription {
                device_id,
                flags,
                lease_expiration_sec,
            }),
        }
    }

    pub(crate) fn remove_subscription(&mut self, device_id: u64) -> bool {
        let before = self.subscriptions.len();
        self.subscriptions.retain(|s| s.device_id != device_id);
        self.subscriptions.len() != before
    }
}

fn lookup_extra(extra: &HashMap<String, Vec<Arg>>, key: &str) -> Option<Vec<Arg>> {
    extra
        .get(key)
        .or_else(|| extra.get(&format!("@{key}")))
        .cloned()
}

fn map_property(map: &MapRecord, key: &str) -> Option<Vec<Arg>> {
    match key {
        "id" => Some(vec![Arg::Long(map.id as i64)]),
        "mode" | "scaling" => Some(vec![Arg::Str(map.mode.token().to_owned())]),
        "expression" => {
            if map.expression.is_empty() {
                None
            } else {
                Some(vec![Arg::Str(map.expression.clone())])
            }
        }
        "muted" => Some(vec![Arg::Int(map.muted as i32)]),
        "process" => Some(vec![Arg::Str(map.process_location.token().to_owned())]),
        "num_sources" => Some(vec![Arg::Int(map.sources.len() as i32)]),
        "version" => Some(vec![Arg::Int(map.version)]),
        _ => lookup_extra(&map.extra, key),
    }
}

fn slot_property(slot: &Slot, key: &str) -> Option<Vec<Arg>> {
    match key {
        "device" => Some(vec![Arg::Str(slot.device.clone())]),
        "signal" => Some(vec![Arg::Str(slot.signal.clone())]),
        "name" => Some(vec![Arg::Str(slot.full_name())]),
        "type" => slot.sig_type.map(|t| vec![Arg::Char(t.tag())]),
        "length" => Some(vec![Arg::Int(slot.length as i32)]),
        "min" => slot
            .minimum
            .as_ref()
            .map(|v| v.iter().map(|x| Arg::Double(*x)).collect()),
        "max" => slot
            .maximum
            .as_ref()
            .map(|v| v.iter().map(|x| Arg::Double(*x)).collect()),
        "calibrating" => Some(vec![Arg::Int(slot.calibrating as i32)]),
        "causes_update" => Some(vec![Arg::Int(slot.causes_update as i32)]),
        "use_as_instance" => Some(vec![Arg::Int(slot.use_as_instance as i32)]),
        _ => None,
    }
}

fn match_property(prop: Option<Vec<Arg>>, value: &[Arg], op: Op) -> bool {
    let Some(prop) = prop else {
        return op == Op::NotExists;
    };
    match op {
        Op::Exists => true,
        Op::NotExists => false,
        _ => compare_value(op, &prop, value),
    }
}

/// Element-wise vector comparison: `compare` accumulates the sign per
/// element, `difference` accumulates `|compare|`. Equality requires every
/// element equal; the ordering operators test the running sum. Operands
/// of different type or length never match.
pub fn compare_value(op: Op, a: &[Arg], b: &[Arg]) -> bool {
    if a.len() != b.len() || a.is_empty() {
        return false;
    }

    let mut compare: i64 = 0;
    let mut difference: i64 = 0;

    for (x, y) in a.iter().zip(b) {
        let step = match (x, y) {
            (Arg::Str(l) | Arg::Sym(l), Arg::Str(r) | Arg::Sym(r)) => sign(l.cmp(r)),
            (Arg::Int(l), Arg::Int(r)) => sign(l.cmp(r)),
            (Arg::Long(l), Arg::Long(r)) => sign(l.cmp(r)),
            (Arg::Float(l), Arg::Float(r)) => float_sign(*l as f64, *r as f64),
            (Arg::Double(l), Arg::Double(r)) => float_sign(*l, *r),
            (Arg::Char(l), Arg::Char(r)) => sign(l.cmp(r)),
            (Arg::Time(l), Arg::Time(r)) => sign(l.cmp(r)),
            _ => return false,
        };
        compare += step;
        difference += compare.abs();
    }

    match op {
        Op::Eq => compare == 0 && difference == 0,
        Op::Ne => compare != 0 || difference != 0,
        Op::Gt => compare > 0,
        Op::Ge => compare >= 0,
        Op::Lt => compare < 0,
        Op::Le => compare <= 0,
        Op::Exists => true,
        Op::NotExists => false,
    }
}

fn sign(ord: std::cmp::Ordering) -> i64 {
    match ord {
        std::cmp::Ordering::Less => -1,
        std::cmp::Ordering::Equal => 0,
        std::cmp::Ordering::Greater => 1,
    }
}

fn float_sign(l: f64, r: f64) -> i64 {
    if l > r {
        1
    } else if l < r {
        -1
    } else {
        0
    }
}
