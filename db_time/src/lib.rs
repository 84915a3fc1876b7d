//! Injectable time sources.
//!
//! Components never call the system clock directly; they take an
//! `Arc<dyn TimeProvider>` so tests can drive time deterministically with
//! [`MockProvider`].
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use chrono::{DateTime, TimeZone, Utc};
use parking_lot::RwLock;
use std::{
    fmt::Debug,
    ops::{Add, Sub},
    time::Duration,
};

/// An instant in wall-clock time with millisecond precision.
///
/// Milliseconds since the Unix epoch is the resolution everything in the
/// database operates at (event timestamps, retention cutoffs, window
/// boundaries), so this type stores exactly that.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Time(i64);

impl Time {
    /// Minimum representable time.
    pub const MIN: Self = Self(i64::MIN);

    /// Maximum representable time.
    pub const MAX: Self = Self(i64::MAX);

    /// Create from milliseconds since the Unix epoch.
    pub fn from_timestamp_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Create from a chrono UTC datetime, truncating to milliseconds.
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis())
    }

    /// Milliseconds since the Unix epoch.
    pub fn timestamp_millis(&self) -> i64 {
        self.0
    }

    /// Convert to a chrono UTC datetime.
    pub fn to_datetime(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.0).single().expect("valid ms timestamp")
    }

    /// Add a duration, returning `None` on overflow.
    pub fn checked_add(&self, d: Duration) -> Option<Self> {
        let millis = i64::try_from(d.as_millis()).ok()?;
        self.0.checked_add(millis).map(Self)
    }

    /// Subtract a duration, returning `None` on underflow.
    pub fn checked_sub(&self, d: Duration) -> Option<Self> {
        let millis = i64::try_from(d.as_millis()).ok()?;
        self.0.checked_sub(millis).map(Self)
    }

    /// Duration since `earlier`, or `None` if `earlier` is in the future.
    pub fn checked_duration_since(&self, earlier: Self) -> Option<Duration> {
        let delta = self.0.checked_sub(earlier.0)?;
        u64::try_from(delta).ok().map(Duration::from_millis)
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339())
    }
}

impl Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        self.checked_add(rhs).expect("time overflow")
    }
}

impl Sub<Duration> for Time {
    type Output = Self;

    fn sub(self, rhs: Duration) -> Self::Output {
        self.checked_sub(rhs).expect("time underflow")
    }
}

/// A source of wall-clock time.
pub trait TimeProvider: Debug + Send + Sync + 'static {
    /// The current time.
    fn now(&self) -> Time;
}

/// [`TimeProvider`] backed by the system clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProvider {}

impl SystemProvider {
    /// Create a new system clock provider.
    pub fn new() -> Self {
        Self::default()
    }
}

impl TimeProvider for SystemProvider {
    fn now(&self) -> Time {
        Time::from_datetime(Utc::now())
    }
}

/// A [`TimeProvider`] whose time only moves when told to.
#[derive(Debug)]
pub struct MockProvider {
    now: RwLock<Time>,
}

impl MockProvider {
    /// Create a provider frozen at `start`.
    pub fn new(start: Time) -> Self {
        Self {
            now: RwLock::new(start),
        }
    }

    /// Advance the clock by `d` and return the new time.
    pub fn inc(&self, d: Duration) -> Time {
        let mut now = self.now.write();
        *now = *now + d;
        *now
    }

    /// Jump the clock to `t`.
    pub fn set(&self, t: Time) {
        *self.now.write() = t;
    }
}

impl TimeProvider for MockProvider {
    fn now(&self) -> Time {
        *self.now.read()
    }
}
