//! Shared primitives used across the control loop: resource quantities, a wall-clock
//! abstraction injectable at construction, and object metadata shared by nodes and pods.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Seconds since the Unix epoch. Kept as a plain newtype (rather than `SystemTime`)
/// so that tests can construct and compare values without going through the OS clock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(pub u64);

impl Timestamp {
    pub fn zero() -> Self {
        Timestamp(0)
    }

    /// Saturating duration since an earlier timestamp, in seconds.
    pub fn since(&self, earlier: Timestamp) -> u64 {
        self.0.saturating_sub(earlier.0)
    }

    pub fn plus_seconds(&self, seconds: u64) -> Timestamp {
        Timestamp(self.0.saturating_add(seconds))
    }
}

/// Injectable wall clock. The source mixes ambient `time.Now()` calls throughout its
/// control loop; those become an explicit collaborator here so that every deadline and
/// dwell-time computation in the loop is deterministic under test.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

#[derive(Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Timestamp(secs)
    }
}

/// A clock whose reading is set explicitly by a test, advanced only by explicit calls.
pub struct FakeClock {
    now: AtomicU64,
}

impl FakeClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start.0),
        }
    }

    pub fn set(&self, t: Timestamp) {
        self.now.store(t.0, Ordering::SeqCst);
    }

    pub fn advance(&self, seconds: u64) {
        self.now.fetch_add(seconds, Ordering::SeqCst);
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.now.load(Ordering::SeqCst))
    }
}

/// Resource quantities, in the finest unit the scheduler reasons about: millicores of
/// CPU and bytes of memory. Mirrors the teacher's `core::common::Resources { cpu, ram }`
/// pair, spelled out with explicit units since this crate has no simulation config doc
/// elsewhere to pin down what `cpu`/`ram` mean.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}

impl Resources {
    pub fn new(cpu_millis: u64, memory_bytes: u64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn fits_within(&self, available: &Resources) -> bool {
        self.cpu_millis <= available.cpu_millis && self.memory_bytes <= available.memory_bytes
    }

    pub fn saturating_add(&self, other: &Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
        }
    }

    pub fn saturating_sub(&self, other: &Resources) -> Resources {
        Resources {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
        }
    }

    /// Max of cpu and memory utilization fractions, used by the scale-down planner's
    /// candidate gate (spec 4.F.2).
    pub fn utilization_against(&self, capacity: &Resources) -> f64 {
        let cpu = if capacity.cpu_millis == 0 {
            0.0
        } else {
            self.cpu_millis as f64 / capacity.cpu_millis as f64
        };
        let mem = if capacity.memory_bytes == 0 {
            0.0
        } else {
            self.memory_bytes as f64 / capacity.memory_bytes as f64
        };
        cpu.max(mem)
    }
}

/// Metadata common to nodes and pods, mirroring the `ObjectMeta` triad the teacher's
/// later scheduler code already assumes (`node.metadata.name`, `pod.metadata.labels`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
    #[serde(default)]
    pub creation_timestamp: Timestamp,
}

impl ObjectMeta {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: String::new(),
            labels: HashMap::new(),
            annotations: HashMap::new(),
            creation_timestamp: Timestamp::zero(),
        }
    }
}

/// Identifier of a node group as owned by the cloud provider (spec 3).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeGroupId(pub String);

impl std::fmt::Display for NodeGroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NodeGroupId {
    fn from(s: &str) -> Self {
        NodeGroupId(s.to_string())
    }
}

impl From<String> for NodeGroupId {
    fn from(s: String) -> Self {
        NodeGroupId(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utilization_picks_max_of_cpu_and_memory() {
        let requested = Resources::new(800, 100);
        let capacity = Resources::new(1000, 1000);
        assert_eq!(requested.utilization_against(&capacity), 0.8);
    }

    #[test]
    fn test_fake_clock_advances_deterministically() {
        let clock = FakeClock::new(Timestamp(10));
        assert_eq!(clock.now(), Timestamp(10));
        clock.advance(5);
        assert_eq!(clock.now(), Timestamp(15));
        clock.set(Timestamp(100));
        assert_eq!(clock.now(), Timestamp(100));
    }

    #[test]
    fn test_timestamp_since_saturates_at_zero() {
        let earlier = Timestamp(10);
        let later = Timestamp(5);
        assert_eq!(later.since(earlier), 0);
    }
}
