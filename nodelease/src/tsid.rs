// Time-sorted 64-bit identifiers
//
// Layout, most significant bit first:
//
//   | timestamp: 42 bits | node: 10 bits | sequence: 12 bits |
//
// The timestamp counts milliseconds since 2020-01-01T00:00:00Z, good for
// roughly 139 years. The node bits come from the lease this process holds;
// nothing else may choose them.

use crate::allocator::NodeAssignment;
use crate::time::{Clock, SystemClock};
use crate::{Error, NodeId, Result};
use parking_lot::Mutex;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};

pub const NODE_BITS: u32 = 10;
pub const SEQUENCE_BITS: u32 = 12;
pub const TIMESTAMP_BITS: u32 = 42;

/// 2020-01-01T00:00:00Z in Unix milliseconds
pub const TSID_EPOCH_MILLIS: u64 = 1_577_836_800_000;

const SEQUENCE_MASK: u64 = (1 << SEQUENCE_BITS) - 1;
const NODE_MASK: u64 = (1 << NODE_BITS) - 1;
const TIMESTAMP_MASK: u64 = (1 << TIMESTAMP_BITS) - 1;

const ALPHABET: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
const ENCODED_LEN: usize = 13;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct Tsid(u64);

impl Tsid {
    pub fn from_parts(timestamp_millis: u64, node: NodeId, sequence: u16) -> Self {
        Self(
            (timestamp_millis & TIMESTAMP_MASK) << (NODE_BITS + SEQUENCE_BITS)
                | u64::from(node.get()) << SEQUENCE_BITS
                | u64::from(sequence) & SEQUENCE_MASK,
        )
    }

    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// Milliseconds since the TSID epoch
    pub fn timestamp_millis(self) -> u64 {
        self.0 >> (NODE_BITS + SEQUENCE_BITS)
    }

    /// Milliseconds since the Unix epoch
    pub fn unix_millis(self) -> u64 {
        self.timestamp_millis() + TSID_EPOCH_MILLIS
    }

    pub fn node(self) -> u16 {
        ((self.0 >> SEQUENCE_BITS) & NODE_MASK) as u16
    }

    pub fn sequence(self) -> u16 {
        (self.0 & SEQUENCE_MASK) as u16
    }
}

impl From<Tsid> for u64 {
    fn from(tsid: Tsid) -> Self {
        tsid.0
    }
}

impl From<Tsid> for i64 {
    fn from(tsid: Tsid) -> Self {
        tsid.0 as i64
    }
}

/// Crockford base32, 13 characters, lexicographic order matches numeric order
impl std::fmt::Display for Tsid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut out = [0u8; ENCODED_LEN];
        for (i, c) in out.iter_mut().enumerate() {
            let shift = 5 * (ENCODED_LEN - 1 - i);
            *c = ALPHABET[((self.0 >> shift) & 0x1f) as usize];
        }
        // ALPHABET is pure ASCII
        f.write_str(std::str::from_utf8(&out).map_err(|_| std::fmt::Error)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid TSID string: {0:?}")]
pub struct ParseTsidError(String);

fn decode_char(c: u8) -> Option<u64> {
    let c = c.to_ascii_uppercase();
    let c = match c {
        b'O' => b'0',
        b'I' | b'L' => b'1',
        other => other,
    };
    ALPHABET.iter().position(|&a| a == c).map(|p| p as u64)
}

impl FromStr for Tsid {
    type Err = ParseTsidError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = s.as_bytes();
        if bytes.len() != ENCODED_LEN {
            return Err(ParseTsidError(s.to_string()));
        }
        let mut value: u64 = 0;
        for (i, &b) in bytes.iter().enumerate() {
            let digit = decode_char(b).ok_or_else(|| ParseTsidError(s.to_string()))?;
            // The leading character only carries the top 4 bits
            if i == 0 && digit > 0xf {
                return Err(ParseTsidError(s.to_string()));
            }
            value = (value << 5) | digit;
        }
        Ok(Self(value))
    }
}

#[derive(Debug)]
struct FactoryState {
    last_millis: u64,
    sequence: u64,
}

/// Produces strictly increasing TSIDs for one node.
#[derive(Debug)]
pub struct TsidFactory {
    node: NodeId,
    clock: Arc<dyn Clock>,
    state: Mutex<FactoryState>,
}

impl TsidFactory {
    pub fn new(node: NodeId) -> Self {
        Self::with_clock(node, Arc::new(SystemClock))
    }

    pub fn with_clock(node: NodeId, clock: Arc<dyn Clock>) -> Self {
        Self {
            node,
            clock,
            state: Mutex::new(FactoryState {
                last_millis: 0,
                sequence: 0,
            }),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn create(&self) -> Tsid {
        let now = self.clock.now_millis().saturating_sub(TSID_EPOCH_MILLIS);
        let mut state = self.state.lock();

        if now > state.last_millis {
            state.last_millis = now;
            state.sequence = 0;
        } else {
            // Same millisecond, or the wall clock stepped backwards: keep
            // counting from where we were
            state.sequence += 1;
            if state.sequence > SEQUENCE_MASK {
                state.last_millis += 1;
                state.sequence = 0;
            }
        }

        Tsid::from_parts(state.last_millis, self.node, state.sequence as u16)
    }
}

/// The ID-generation facility handed to everything that mints ids.
///
/// It starts empty and accepts exactly one node assignment. Asking for an id
/// before that is a programming error and is reported, never papered over
/// with a default node.
#[derive(Debug)]
pub struct IdGenerator {
    clock: Arc<dyn Clock>,
    factory: OnceLock<TsidFactory>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            factory: OnceLock::new(),
        }
    }

    pub fn install(&self, assignment: &NodeAssignment) -> Result<()> {
        let factory = TsidFactory::with_clock(assignment.node_id, self.clock.clone());
        self.factory
            .set(factory)
            .map_err(|_| Error::AlreadyInitialized)?;
        tracing::info!(node_id = %assignment.node_id, "TSID generator initialized");
        Ok(())
    }

    pub fn node_id(&self) -> Option<NodeId> {
        self.factory.get().map(TsidFactory::node)
    }

    pub fn next_id(&self) -> Result<Tsid> {
        self.factory
            .get()
            .map(TsidFactory::create)
            .ok_or(Error::NotInitialized)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
