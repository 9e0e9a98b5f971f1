use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::CoreError;

pub const MAX_DRIFT_MS: u64 = 300_000; // 5 minutes

/// Source of physical time in milliseconds since Unix epoch.
pub trait TimeSource: Send + Sync {
    fn now_ms(&self) -> Result<u64, CoreError>;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl TimeSource for WallClock {
    fn now_ms(&self) -> Result<u64, CoreError> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .map_err(|_| CoreError::InvalidData("system clock before epoch".into()))
    }
}

/// A manually advanced clock. Clones share the same instant.
#[derive(Debug, Clone, Default)]
pub struct ManualTime(Arc<AtomicU64>);

impl ManualTime {
    pub fn new(start_ms: u64) -> Self {
        Self(Arc::new(AtomicU64::new(start_ms)))
    }

    pub fn set(&self, ms: u64) {
        self.0.store(ms, AtomicOrdering::SeqCst);
    }

    pub fn advance(&self, ms: u64) {
        self.0.fetch_add(ms, AtomicOrdering::SeqCst);
    }

    pub fn get(&self) -> u64 {
        self.0.load(AtomicOrdering::SeqCst)
    }
}

impl TimeSource for ManualTime {
    fn now_ms(&self) -> Result<u64, CoreError> {
        Ok(self.get())
    }
}

/// A 12-byte Hybrid Logical Clock timestamp: 8 bytes wall_ms (big-endian u64)
/// followed by 4 bytes counter (big-endian u32).
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug)]
pub struct Hlc {
    wall_ms: u64,
    counter: u32,
}

impl Hlc {
    pub const ZERO: Hlc = Hlc {
        wall_ms: 0,
        counter: 0,
    };

    pub fn new(wall_ms: u64, counter: u32) -> Self {
        Self { wall_ms, counter }
    }

    pub fn wall_ms(&self) -> u64 {
        self.wall_ms
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    /// The smallest timestamp strictly greater than `self`.
    pub fn successor(&self) -> Self {
        match self.counter.checked_add(1) {
            Some(counter) => Self::new(self.wall_ms, counter),
            None => Self::new(self.wall_ms + 1, 0),
        }
    }

    pub fn to_bytes(&self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[..8].copy_from_slice(&self.wall_ms.to_be_bytes());
        buf[8..].copy_from_slice(&self.counter.to_be_bytes());
        buf
    }

    pub fn from_bytes(bytes: &[u8; 12]) -> Self {
        let mut wall = [0u8; 8];
        let mut counter = [0u8; 4];
        wall.copy_from_slice(&bytes[..8]);
        counter.copy_from_slice(&bytes[8..]);
        Self {
            wall_ms: u64::from_be_bytes(wall),
            counter: u32::from_be_bytes(counter),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, CoreError> {
        let arr: [u8; 12] = bytes
            .try_into()
            .map_err(|_| CoreError::InvalidData(format!("hlc must be 12 bytes, got {}", bytes.len())))?;
        Ok(Self::from_bytes(&arr))
    }
}

impl Ord for Hlc {
    fn cmp(&self, other: &Self) -> Ordering {
        self.to_bytes().cmp(&other.to_bytes())
    }
}

impl PartialOrd for Hlc {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for Hlc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.to_bytes())
    }
}

impl<'de> Deserialize<'de> for Hlc {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = serde_bytes_compat(deserializer)?;
        Hlc::from_slice(&bytes).map_err(serde::de::Error::custom)
    }
}

fn serde_bytes_compat<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    struct BytesVisitor;

    impl<'de> serde::de::Visitor<'de> for BytesVisitor {
        type Value = Vec<u8>;

        fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            f.write_str("12 bytes")
        }

        fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            Ok(v.to_vec())
        }

        fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut out = Vec::with_capacity(12);
            while let Some(b) = seq.next_element::<u8>()? {
                out.push(b);
            }
            Ok(out)
        }
    }

    deserializer.deserialize_bytes(BytesVisitor)
}

/// A clock that generates monotonically increasing HLC timestamps.
pub struct HlcClock {
    source: Arc<dyn TimeSource>,
    wall_ms: u64,
    counter: u32,
}

impl HlcClock {
    pub fn new(source: Arc<dyn TimeSource>) -> Self {
        Self {
            source,
            wall_ms: 0,
            counter: 0,
        }
    }

    pub fn wall() -> Self {
        Self::new(Arc::new(WallClock))
    }

    /// Physical time of the underlying source, without advancing the clock.
    pub fn physical_now(&self) -> Result<u64, CoreError> {
        self.source.now_ms()
    }

    /// Generate the next monotonically increasing timestamp.
    pub fn tick(&mut self) -> Result<Hlc, CoreError> {
        let now = self.source.now_ms()?;

        let hlc = if now > self.wall_ms {
            Hlc::new(now, 0)
        } else {
            Hlc::new(self.wall_ms, self.counter + 1)
        };

        self.wall_ms = hlc.wall_ms;
        self.counter = hlc.counter;
        Ok(hlc)
    }

    /// Merge with a remote timestamp, producing a timestamp greater than both.
    pub fn receive(&mut self, remote: &Hlc) -> Result<Hlc, CoreError> {
        let now = self.source.now_ms()?;

        // Reject remote timestamps too far in the future
        if remote.wall_ms > now + MAX_DRIFT_MS {
            return Err(CoreError::HlcDriftTooLarge {
                delta_ms: remote.wall_ms - now,
                max_ms: MAX_DRIFT_MS,
            });
        }

        let wall_ms = now.max(self.wall_ms).max(remote.wall_ms);
        let counter = if wall_ms == self.wall_ms && wall_ms == remote.wall_ms {
            self.counter.max(remote.counter) + 1
        } else if wall_ms == self.wall_ms {
            self.counter + 1
        } else if wall_ms == remote.wall_ms {
            remote.counter + 1
        } else {
            0
        };

        self.wall_ms = wall_ms;
        self.counter = counter;
        Ok(Hlc::new(wall_ms, counter))
    }
}

impl Default for HlcClock {
    fn default() -> Self {
        Self::wall()
    }
}
