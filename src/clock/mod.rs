#[cfg(test)]
mod clock_test;

use std::time::{SystemTime, UNIX_EPOCH};

/// A fixed-point timestamp: whole seconds since the Unix epoch plus a
/// 32-bit binary fraction, ordered lexicographically.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timetag {
    pub sec: u32,
    pub frac: u32,
}

impl Timetag {
    pub fn new(sec: u32, frac: u32) -> Self {
        Timetag { sec, frac }
    }

    pub fn from_secs_f64(t: f64) -> Self {
        let sec = t.floor();
        Timetag {
            sec: sec as u32,
            frac: ((t - sec) * (u32::MAX as f64 + 1.0)) as u32,
        }
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.sec as f64 + self.frac as f64 / (u32::MAX as f64 + 1.0)
    }

    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.frac == 0
    }
}

/// Current wall time as fractional seconds since the epoch. Every timing
/// decision in the protocol is local, so wall-clock correctness on a
/// single host is all that is required.
pub fn current_time() -> f64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(_) => 0.0,
    }
}

/// Clock state threaded through the poll loop: the cached `now` and the
/// deadline for the next keepalive ping.
#[derive(Debug, Default, Clone)]
pub struct Clock {
    pub now: Timetag,
    pub next_ping: u32,
}

impl Clock {
    pub fn new() -> Self {
        let mut clock = Clock::default();
        clock.tick();
        clock
    }

    /// Re-reads wall time into `now` and returns it as f64 seconds.
    pub fn tick(&mut self) -> f64 {
        let t = current_time();
        self.now = Timetag::from_secs_f64(t);
        t
    }
}
