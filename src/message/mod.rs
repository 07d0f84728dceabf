#[cfg(test)]
mod message_test;

use std::collections::HashMap;

use crate::clock::Timetag;
use crate::error::{Error, Result};

/// One typed argument of a control message. String-typed parameters may
/// arrive as either `Str` or `Sym` on the wire and are treated alike.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Sym(String),
    Char(char),
    Time(Timetag),
}

impl Arg {
    pub fn type_tag(&self) -> u8 {
        match self {
            Arg::Int(_) => b'i',
            Arg::Long(_) => b'h',
            Arg::Float(_) => b'f',
            Arg::Double(_) => b'd',
            Arg::Str(_) => b's',
            Arg::Sym(_) => b'S',
            Arg::Char(_) => b'c',
            Arg::Time(_) => b't',
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::Str(s) | Arg::Sym(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view; float arguments are truncated, since probes and
    /// counters may arrive as either `i` or `f` on the wire.
    pub fn as_i32(&self) -> Option<i32> {
        match *self {
            Arg::Int(i) => Some(i),
            Arg::Long(h) => Some(h as i32),
            Arg::Float(f) => Some(f as i32),
            Arg::Double(d) => Some(d as i32),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            Arg::Int(i) => Some(i as i64),
            Arg::Long(h) => Some(h),
            Arg::Float(f) => Some(f as i64),
            Arg::Double(d) => Some(d as i64),
            _ => None,
        }
    }

    /// Numeric view; integer-or-float range parameters coerce to float.
    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            Arg::Int(i) => Some(i as f32),
            Arg::Long(h) => Some(h as f32),
            Arg::Float(f) => Some(f),
            Arg::Double(d) => Some(d as f32),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Arg::Int(i) => Some(i as f64),
            Arg::Long(h) => Some(h as f64),
            Arg::Float(f) => Some(f as f64),
            Arg::Double(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_char(&self) -> Option<char> {
        match self {
            Arg::Char(c) => Some(*c),
            Arg::Str(s) | Arg::Sym(s) => s.chars().next(),
            _ => None,
        }
    }

    /// True for a string argument naming an `@`-parameter key.
    pub fn is_param_key(&self) -> bool {
        matches!(self.as_str(), Some(s) if s.starts_with('@'))
    }
}

/// A control message: an address path plus typed arguments. Packs to and
/// from a single datagram with 4-byte-aligned strings and big-endian
/// payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub path: String,
    pub args: Vec<Arg>,
}

impl Message {
    pub fn new(path: impl Into<String>, args: Vec<Arg>) -> Self {
        Message {
            path: path.into(),
            args,
        }
    }

    pub fn pack(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        pack_str(&mut buf, &self.path);

        let mut tags = String::with_capacity(self.args.len() + 1);
        tags.push(',');
        for arg in &self.args {
            tags.push(arg.type_tag() as char);
        }
        pack_str(&mut buf, &tags);

        for arg in &self.args {
            match arg {
                Arg::Int(i) => buf.extend_from_slice(&i.to_be_bytes()),
                Arg::Long(h) => buf.extend_from_slice(&h.to_be_bytes()),
                Arg::Float(f) => buf.extend_from_slice(&f.to_bits().to_be_bytes()),
                Arg::Double(d) => buf.extend_from_slice(&d.to_bits().to_be_bytes()),
                Arg::Str(s) | Arg::Sym(s) => pack_str(&mut buf, s),
                Arg::Char(c) => buf.extend_from_slice(&(*c as u32).to_be_bytes()),
                Arg::Time(t) => {
                    buf.extend_from_slice(&t.sec.to_be_bytes());
                    buf.extend_from_slice(&t.frac.to_be_bytes());
                }
            }
        }
        Ok(buf)
    }

    pub fn unpack(buf: &[u8]) -> Result<Message> {
        let mut pos = 0;
        let path = unpack_str(buf, &mut pos)?;
        if !path.starts_with('/') {
            return Err(Error::ErrInvalidString);
        }
        let tags = unpack_str(buf, &mut pos)?;
        let tags = tags.strip_prefix(',').ok_or(Error::ErrUnknownTypeTag)?;

        let mut args = Vec::with_capacity(tags.len());
        for tag in tags.bytes() {
            let arg = match tag {
                b'i' => Arg::Int(i32::from_be_bytes(take4(buf, &mut pos)?)),
                b'h' => Arg::Long(i64::from_be_bytes(take8(buf, &mut pos)?)),
                b'f' => Arg::Float(f32::from_bits(u32::from_be_bytes(take4(buf, &mut pos)?))),
                b'd' => Arg::Double(f64::from_bits(u64::from_be_bytes(take8(buf, &mut pos)?))),
                b's' => Arg::Str(unpack_str(buf, &mut pos)?),
                b'S' => Arg::Sym(unpack_str(buf, &mut pos)?),
                b'c' => {
                    let v = u32::from_be_bytes(take4(buf, &mut pos)?);
                    Arg::Char(char::from_u32(v).ok_or(Error::ErrInvalidString)?)
                }
                b't' => {
                    let sec = u32::from_be_bytes(take4(buf, &mut pos)?);
                    let frac = u32::from_be_bytes(take4(buf, &mut pos)?);
                    Arg::Time(Timetag::new(sec, frac))
                }
                _ => return Err(Error::ErrUnknownTypeTag),
            };
            args.push(arg);
        }
        Ok(Message { path, args })
    }
}

fn pack_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn unpack_str(buf: &[u8], pos: &mut usize) -> Result<String> {
    let start = *pos;
    let end = buf[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|i| start + i)
        .ok_or(Error::ErrTruncatedMessage)?;
    let s = std::str::from_utf8(&buf[start..end]).map_err(|_| Error::ErrInvalidString)?;
    // skip the terminator and padding
    *pos = end + 1;
    while *pos % 4 != 0 {
        *pos += 1;
    }
    if *pos > buf.len() {
        return Err(Error::ErrTruncatedMessage);
    }
    Ok(s.to_owned())
}

fn take4(buf: &[u8], pos: &mut usize) -> Result<[u8; 4]> {
    if *pos + 4 > buf.len() {
        return Err(Error::ErrTruncatedMessage);
    }
    let out = buf[*pos..*pos + 4].try_into().unwrap();
    *pos += 4;
    Ok(out)
}

fn take8(buf: &[u8], pos: &mut usize) -> Result<[u8; 8]> {
    if *pos + 8 > buf.len() {
        return Err(Error::ErrTruncatedMessage);
    }
    let out = buf[*pos..*pos + 8].try_into().unwrap();
    *pos += 8;
    Ok(out)
}

/// Recognised `@`-parameter keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Param {
    CanAlias,
    CausesUpdate,
    ClipMax,
    ClipMin,
    Direction,
    Expression,
    Host,
    Id,
    Instances,
    Ip,
    Lease,
    Length,
    LibVersion,
    Max,
    Min,
    Mute,
    NumIncomingMaps,
    NumInputs,
    NumOutgoingMaps,
    NumOutputs,
    Port,
    Process,
    Range,
    Rate,
    Rev,
    Scaling,
    Scope,
    Slot,
    Status,
    Type,
    Units,
    UseAsInstance,
    Version,
}

impl Param {
    pub fn key(&self) -> &'static str {
        match self {
            Param::CanAlias => "@canAlias",
            Param::CausesUpdate => "@causesUpdate",
            Param::ClipMax => "@clipMax",
            Param::ClipMin => "@clipMin",
            Param::Direction => "@direction",
            Param::Expression => "@expression",
            Param::Host => "@host",
            Param::Id => "@id",
            Param::Instances => "@instances",
            Param::Ip => "@IP",
            Param::Lease => "@lease",
            Param::Length => "@length",
            Param::LibVersion => "@libVersion",
            Param::Max => "@max",
            Param::Min => "@min",
            Param::Mute => "@mute",
            Param::NumIncomingMaps => "@numIncomingMaps",
            Param::NumInputs => "@numInputs",
            Param::NumOutgoingMaps => "@numOutgoingMaps",
            Param::NumOutputs => "@numOutputs",
            Param::Port => "@port",
            Param::Process => "@process",
            Param::Range => "@range",
            Param::Rate => "@rate",
            Param::Rev => "@rev",
            Param::Scaling => "@scaling",
            Param::Scope => "@scope",
            Param::Slot => "@slot",
            Param::Status => "@status",
            Param::Type => "@type",
            Param::Units => "@units",
            Param::UseAsInstance => "@useAsInstance",
            Param::Version => "@version",
        }
    }

    pub fn from_key(key: &str) -> Option<Param> {
        ALL_PARAMS.iter().find(|p| p.key() == key).copied()
    }
}

const ALL_PARAMS: &[Param] = &[
    Param::CanAlias,
    Param::CausesUpdate,
    Param::ClipMax,
    Param::ClipMin,
    Param::Direction,
    Param::Expression,
    Param::Host,
    Param::Id,
    Param::Instances,
    Param::Ip,
    Param::Lease,
    Param::Length,
    Param::LibVersion,
    Param::Max,
    Param::Min,
    Param::Mute,
    Param::NumIncomingMaps,
    Param::NumInputs,
    Param::NumOutgoingMaps,
    Param::NumOutputs,
    Param::Port,
    Param::Process,
    Param::Range,
    Param::Rate,
    Param::Rev,
    Param::Scaling,
    Param::Scope,
    Param::Slot,
    Param::Status,
    Param::Type,
    Param::Units,
    Param::UseAsInstance,
    Param::Version,
];

/// An unordered set of `@key value…` parameters parsed from the tail of a
/// control message. A value run belongs to the most recent key; keys
/// outside the recognised vocabulary are kept in the `extra` table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSet {
    values: HashMap<Param, Vec<Arg>>,
    extra: HashMap<String, Vec<Arg>>,
}

impl ParamSet {
    pub fn new() -> Self {
        ParamSet::default()
    }

    pub fn parse(args: &[Arg]) -> Self {
        let mut set = ParamSet::new();
        let mut key: Option<ParamKey> = None;
        let mut vals: Vec<Arg> = Vec::new();

        for arg in args {
            if arg.is_param_key() {
                if let Some(k) = key.take() {
                    set.store(k, std::mem::take(&mut vals));
                }
                let s = arg.as_str().unwrap();
                key = Some(match Param::from_key(s) {
                    Some(p) => ParamKey::Known(p),
                    None => ParamKey::Unknown(s.to_owned()),
                });
            } else if key.is_some() {
                vals.push(arg.clone());
            }
            // values before the first key are not parameters; skip them
        }
        if let Some(k) = key {
            set.store(k, vals);
        }
        set
    }

    fn store(&mut self, key: ParamKey, vals: Vec<Arg>) {
        match key {
            ParamKey::Known(p) => {
                self.values.insert(p, vals);
            }
            ParamKey::Unknown(s) => {
                self.extra.insert(s, vals);
            }
        }
    }

    pub fn insert(&mut self, param: Param, vals: Vec<Arg>) -> &mut Self {
        self.values.insert(param, vals);
        self
    }

    pub fn insert_extra(&mut self, key: impl Into<String>, vals: Vec<Arg>) -> &mut Self {
        self.extra.insert(key.into(), vals);
        self
    }

    pub fn get(&self, param: Param) -> Option<&[Arg]> {
        self.values.get(&param).map(|v| v.as_slice())
    }

    pub fn contains(&self, param: Param) -> bool {
        self.values.contains_key(&param)
    }

    pub fn extra(&self) -> &HashMap<String, Vec<Arg>> {
        &self.extra
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.extra.is_empty()
    }

    pub fn if_str(&self, param: Param) -> Option<&str> {
        self.get(param)?.first()?.as_str()
    }

    pub fn if_i32(&self, param: Param) -> Option<i32> {
        self.get(param)?.first()?.as_i32()
    }

    pub fn if_i64(&self, param: Param) -> Option<i64> {
        self.get(param)?.first()?.as_i64()
    }

    pub fn if_f32(&self, param: Param) -> Option<f32> {
        self.get(param)?.first()?.as_f32()
    }

    pub fn if_char(&self, param: Param) -> Option<char> {
        self.get(param)?.first()?.as_char()
    }

    /// `@range src_min src_max dst_min dst_max`, all coerced to float.
    pub fn range(&self) -> Option<[f32; 4]> {
        let vals = self.get(Param::Range)?;
        if vals.len() < 4 {
            return None;
        }
        let mut out = [0.0f32; 4];
        for (slot, val) in out.iter_mut().zip(vals) {
            *slot = val.as_f32()?;
        }
        Some(out)
    }

    /// Re-encodes the set as trailing message arguments, recognised keys
    /// first in a stable order, then extras sorted by key.
    pub fn append_to(&self, args: &mut Vec<Arg>) {
        let mut keys: Vec<Param> = self.values.keys().copied().collect();
        keys.sort();
        for param in keys {
            args.push(Arg::Str(param.key().to_owned()));
            args.extend(self.values[&param].iter().cloned());
        }
        let mut extras: Vec<&String> = self.extra.keys().collect();
        extras.sort();
        for key in extras {
            args.push(Arg::Str(key.clone()));
            args.extend(self.extra[key].iter().cloned());
        }
    }
}

enum ParamKey {
    Known(Param),
    Unknown(String),
}

/// Splits message arguments into the fixed prefix (everything before the
/// first `@key`) and the parsed parameter tail.
pub fn split_args(args: &[Arg]) -> (&[Arg], ParamSet) {
    let split = args
        .iter()
        .position(|a| a.is_param_key())
        .unwrap_or(args.len());
    (&args[..split], ParamSet::parse(&args[split..]))
}

/// Splits a full signal path "/device.N/signal" into the canonical device
/// name and the bare signal name.
pub fn parse_signal_path(path: &str) -> Result<(&str, &str)> {
    let rest = path.strip_prefix('/').ok_or(Error::ErrMalformedPath)?;
    let slash = rest.find('/').ok_or(Error::ErrMalformedPath)?;
    if slash == 0 || slash + 1 >= rest.len() {
        return Err(Error::ErrMalformedPath);
    }
    Ok((&path[..slash + 1], &rest[slash + 1..]))
}
