#[cfg(test)]
mod map_test;

use std::collections::HashMap;
use std::fmt;

use crate::clock::Timetag;
use crate::expr;
use crate::message::{Arg, Param, ParamSet};

/// Upper bound on convergent map sources.
pub const MAX_NUM_SOURCES: usize = 8;

/// Data direction of a signal or slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Incoming,
    Outgoing,
    Both,
}

impl Direction {
    fn bits(self) -> u8 {
        match self {
            Direction::Incoming => 0b01,
            Direction::Outgoing => 0b10,
            Direction::Both => 0b11,
        }
    }

    /// True when `self` matches `filter`; `None` matches any direction.
    pub fn matches(self, filter: Option<Direction>) -> bool {
        match filter {
            None => true,
            Some(f) => self.bits() & f.bits() != 0,
        }
    }

    pub fn token(self) -> &'static str {
        match self {
            Direction::Incoming => "input",
            Direction::Outgoing => "output",
            Direction::Both => "both",
        }
    }

    pub fn from_token(s: &str) -> Option<Direction> {
        match s {
            "input" => Some(Direction::Incoming),
            "output" => Some(Direction::Outgoing),
            "both" => Some(Direction::Both),
            _ => None,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token())
    }
}

/// Scalar element type of a signal vector.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SignalType {
    Int32,
    Float,
    Double,
    Str,
    Char,
    Time,
}

impl SignalType {
    pub fn tag(self) -> char {
        match self {
            SignalType::Int32 => 'i',
            SignalType::Float => 'f',
            SignalType::Double => 'd',
            SignalType::Str => 's',
            SignalType::Char => 'c',
            SignalType::Time => 't',
        }
    }

    pub fn from_tag(c: char) -> Option<SignalType> {
        match c {
            'i' => Some(SignalType::Int32),
            'f' => Some(SignalType::Float),
            'd' => Some(SignalType::Double),
            's' => Some(SignalType::Str),
            'c' => Some(SignalType::Char),
            't' => Some(SignalType::Time),
            _ => None,
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, SignalType::Int32 | SignalType::Float | SignalType::Double)
    }
}

/// Transformation applied between source and destination samples.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Direct copy.
    Raw,
    /// Linear interpolation over the advertised range.
    Linear,
    /// Arbitrary compiled expression.
    Expression,
}

impl Mode {
    pub fn token(self) -> &'static str {
        match self {
            Mode::Raw => "bypass",
            Mode::Linear => "linear",
            Mode::Expression => "expression",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token())
    }
}

/// Parses an `@scaling` token. `calibrate` selects linear scaling with the
/// destination slot calibrating.
pub fn parse_scaling(s: &str) -> Option<(Mode, bool)> {
    match s {
        "bypass" => Some((Mode::Raw, false)),
        "linear" => Some((Mode::Linear, false)),
        "expression" => Some((Mode::Expression, false)),
        "calibrate" => Some((Mode::Linear, true)),
        _ => None,
    }
}

/// Policy applied when a sample exceeds a slot bound.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum BoundaryAction {
    #[default]
    None,
    Mute,
    Clamp,
    Fold,
    Wrap,
}

impl BoundaryAction {
    pub fn token(self) -> &'static str {
        match self {
            BoundaryAction::None => "none",
            BoundaryAction::Mute => "mute",
            BoundaryAction::Clamp => "clamp",
            BoundaryAction::Fold => "fold",
            BoundaryAction::Wrap => "wrap",
        }
    }

    pub fn from_token(s: &str) -> Option<BoundaryAction> {
        match s {
            "none" => Some(BoundaryAction::None),
            "mute" => Some(BoundaryAction::Mute),
            "clamp" => Some(BoundaryAction::Clamp),
            "fold" => Some(BoundaryAction::Fold),
            "wrap" => Some(BoundaryAction::Wrap),
            _ => None,
        }
    }
}

/// Which endpoint runs the transformation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ProcessLocation {
    #[default]
    Source,
    Destination,
}

impl ProcessLocation {
    pub fn token(self) -> &'static str {
        match self {
            ProcessLocation::Source => "source",
            ProcessLocation::Destination => "destination",
        }
    }

    pub fn from_token(s: &str) -> Option<ProcessLocation> {
        match s {
            "source" => Some(ProcessLocation::Source),
            "destination" => Some(ProcessLocation::Destination),
            _ => None,
        }
    }
}

/// Lifecycle of a map as seen by an endpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum MapStatus {
    /// Created locally, nothing sent yet.
    Staged,
    /// `/map` emitted on the bus.
    Requested,
    /// `/map_to` received; slots resolved, expression compiled.
    Ready,
    /// `/mapped` observed; the data plane may run.
    Active,
    /// Torn down.
    Removed,
}

/// One endpoint of a map.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    /// Canonical device name, e.g. "/synth.1".
    pub device: String,
    /// Bare signal name within the device.
    pub signal: String,
    /// Numeric identifier advertised on the wire.
    pub id: u32,
    pub direction: Direction,
    pub sig_type: Option<SignalType>,
    pub length: u32,
    pub num_instances: u32,
    pub minimum: Option<Vec<f64>>,
    pub maximum: Option<Vec<f64>>,
    pub bound_min: BoundaryAction,
    pub bound_max: BoundaryAction,
    pub calibrating: bool,
    pub causes_update: bool,
    pub use_as_instance: bool,
}

impl Slot {
    pub fn new(device: impl Into<String>, signal: impl Into<String>, direction: Direction) -> Self {
        Slot {
            device: device.into(),
            signal: signal.into(),
            id: 0,
            direction,
            sig_type: None,
            length: 1,
            num_instances: 1,
            minimum: None,
            maximum: None,
            bound_min: BoundaryAction::None,
            bound_max: BoundaryAction::None,
            calibrating: false,
            causes_update: true,
            use_as_instance: false,
        }
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.device, self.signal)
    }

    /// Slot identity on the wire is the `(device, signal)` pair.
    pub fn refers_to(&self, device: &str, signal: &str) -> bool {
        self.device == device && self.signal == signal
    }
}

/// A unidirectional transformed route from 1..8 source signals to one
/// destination signal.
#[derive(Debug, Clone)]
pub struct MapRecord {
    pub id: u64,
    pub sources: Vec<Slot>,
    pub destination: Slot,
    pub mode: Mode,
    pub expression: String,
    /// Compiled form, present on processing endpoints.
    pub tree: Option<expr::Tree>,
    pub muted: bool,
    pub process_location: ProcessLocation,
    /// Devices whose instance events propagate through this map.
    pub scope: Vec<String>,
    pub range: Option<[f32; 4]>,
    pub status: MapStatus,
    pub version: i32,
    pub synced: Timetag,
    /// True when one of the endpoints is owned by this process.
    pub local: bool,
    pub extra: HashMap<String, Vec<Arg>>,
}

impl MapRecord {
    pub fn new(id: u64, sources: Vec<Slot>, destination: Slot) -> Self {
        let mut map = MapRecord {
            id,
            sources,
            destination,
            mode: Mode::Raw,
            expression: String::new(),
            tree: None,
            muted: false,
            process_location: ProcessLocation::Source,
            scope: Vec::new(),
            range: None,
            status: MapStatus::Staged,
            version: 0,
            synced: Timetag::default(),
            local: false,
            extra: HashMap::new(),
        };
        map.sort_sources();
        map
    }

    /// Source slots are kept in lexicographic `(device, signal)` order;
    /// `slot.id` keeps the wire identifier regardless of position.
    pub fn sort_sources(&mut self) {
        self.sources
            .sort_by(|l, r| (&l.device, &l.signal).cmp(&(&r.device, &r.signal)));
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.full_name()).collect()
    }

    /// True when every source slot lives on `device`.
    pub fn sourced_by(&self, device: &str) -> bool {
        self.sources.iter().all(|s| s.device == device)
    }

    pub fn has_endpoint_on(&self, device: &str) -> bool {
        self.destination.device == device || self.sources.iter().any(|s| s.device == device)
    }

    /// Applies a parameter diff, returning true when any attribute
    /// changed. A failed `@expression` compile retains the previous
    /// expression and is not counted as a change.
    pub fn set_from_params(&mut self, params: &ParamSet) -> bool {
        let mut updated = false;

        let calibrate = if let Some(s) = params.if_str(Param::Scaling) {
            match parse_scaling(s) {
                Some((mode, calibrate)) => {
                    if self.mode != mode {
                        self.mode = mode;
                        updated = true;
                    }
                    Some(calibrate)
                }
                None => None,
            }
        } else {
            None
        };
        if let Some(calibrate) = calibrate {
            if self.destination.calibrating != calibrate {
                self.destination.calibrating = calibrate;
                updated = true;
            }
        }

        if let Some(range) = params.range() {
            if self.range != Some(range) {
                self.range = Some(range);
                updated = true;
            }
        }

        if let Some(src) = params.if_str(Param::Expression) {
            if src != self.expression {
                match expr::parse(src) {
                    Ok(tree) => {
                        self.expression = src.to_owned();
                        self.tree = Some(tree);
                        updated = true;
                    }
                    Err(_) => {
                        log::trace!("map {:#x}: rejecting expression {:?}", self.id, src);
                    }
                }
            }
        }

        if let Some(mute) = params.if_i32(Param::Mute) {
            let mute = mute != 0;
            if self.muted != mute {
                self.muted = mute;
                updated = true;
            }
        }

        if let Some(s) = params.if_str(Param::Process) {
            if let Some(loc) = ProcessLocation::from_token(s) {
                if self.process_location != loc {
                    self.process_location = loc;
                    updated = true;
                }
            }
        }

        if let Some(vals) = params.get(Param::Scope) {
            let scope: Vec<String> = vals
                .iter()
                .filter_map(|a| a.as_str())
                .map(str::to_owned)
                .collect();
            if self.scope != scope {
                self.scope = scope;
                updated = true;
            }
        }

        if let Some(s) = params.if_str(Param::ClipMin) {
            if let Some(b) = BoundaryAction::from_token(s) {
                if self.destination.bound_min != b {
                    self.destination.bound_min = b;
                    updated = true;
                }
            }
        }
        if let Some(s) = params.if_str(Param::ClipMax) {
            if let Some(b) = BoundaryAction::from_token(s) {
                if self.destination.bound_max != b {
                    self.destination.bound_max = b;
                    updated = true;
                }
            }
        }

        if let Some(tag) = params.if_char(Param::Type) {
            if let Some(t) = SignalType::from_tag(tag) {
                if self.destination.sig_type != Some(t) {
                    self.destination.sig_type = Some(t);
                    updated = true;
                }
            }
        }
        if let Some(vals) = params.get(Param::Min) {
            let min: Option<Vec<f64>> = vals.iter().map(|a| a.as_f64()).collect();
            if min.is_some() && self.destination.minimum != min {
                self.destination.minimum = min;
                updated = true;
            }
        }
        if let Some(vals) = params.get(Param::Max) {
            let max: Option<Vec<f64>> = vals.iter().map(|a| a.as_f64()).collect();
            if max.is_some() && self.destination.maximum != max {
                self.destination.maximum = max;
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

    /// Resolves the effective scaling after a handshake step: an explicit
    /// `@scaling` wins; otherwise linear iff the advertised range has
    /// distinct numeric extents on both ends; otherwise bypass.
    pub fn apply_default_mode(&mut self, params: &ParamSet) {
        if params.contains(Param::Scaling) {
            return;
        }
        let numeric = |t: Option<SignalType>| t.map(SignalType::is_numeric).unwrap_or(false);
        let linear = match self.range {
            Some([src_min, src_max, dst_min, dst_max]) => {
                src_min != src_max
                    && dst_min != dst_max
                    && self.sources.iter().all(|s| numeric(s.sig_type))
                    && numeric(self.destination.sig_type)
            }
            None => false,
        };
        self.mode = if linear { Mode::Linear } else { Mode::Raw };
    }

    /// The canonical parameter set announced in `/mapped`.
    pub fn canonical_params(&self) -> ParamSet {
        let mut params = ParamSet::new();
        params.insert(Param::Id, vec![Arg::Long(self.id as i64)]);
        let scaling = if self.destination.calibrating {
            "calibrate"
        } else {
            self.mode.token()
        };
        params.insert(Param::Scaling, vec![Arg::Str(scaling.to_owned())]);
        if let Some([a, b, c, d]) = self.range {
            params.insert(
                Param::Range,
                vec![Arg::Float(a), Arg::Float(b), Arg::Float(c), Arg::Float(d)],
            );
        }
        if !self.expression.is_empty() {
            params.insert(Param::Expression, vec![Arg::Str(self.expression.clone())]);
        }
        params.insert(Param::Mute, vec![Arg::Int(self.muted as i32)]);
        params.insert(
            Param::Process,
            vec![Arg::Str(self.process_location.token().to_owned())],
        );
        params.insert(
            Param::ClipMin,
            vec![Arg::Str(self.destination.bound_min.token().to_owned())],
        );
        params.insert(
            Param::ClipMax,
            vec![Arg::Str(self.destination.bound_max.token().to_owned())],
        );
        if !self.scope.is_empty() {
            params.insert(
                Param::Scope,
                self.scope.iter().map(|s| Arg::Str(s.clone())).collect(),
            );
        }
        for (key, vals) in &self.extra {
            params.insert_extra(key.clone(), vals.clone());
        }
        params
    }

    /// Fixed message arguments: source full names then the destination.
    pub fn name_args(&self) -> Vec<Arg> {
        let mut args: Vec<Arg> = self
            .sources
            .iter()
            .map(|s| Arg::Str(s.full_name()))
            .collect();
        args.push(Arg::Str(self.destination.full_name()));
        args
    }
}
