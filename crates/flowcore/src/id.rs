use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::FlowError;

/// Stable address of one flow instance: the registered flow type name plus
/// an argument string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId {
    name: String,
    arguments: String,
}

impl FlowId {
    pub fn new(name: impl Into<String>, arguments: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &str {
        &self.arguments
    }

    /// Deterministic 64-bit key used for shard routing (FNV-1a over the
    /// textual form, so every process agrees on it).
    pub fn shard_key(&self) -> u64 {
        const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const PRIME: u64 = 0x0000_0100_0000_01b3;

        let mut hash = OFFSET;
        let bytes = self
            .name
            .bytes()
            .chain(std::iter::once(b'/'))
            .chain(self.arguments.bytes());
        for byte in bytes {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(PRIME);
        }
        hash
    }

    pub fn shard_index(&self, shard_count: usize) -> usize {
        if shard_count == 0 {
            return 0;
        }
        (self.shard_key() % shard_count as u64) as usize
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.arguments)
    }
}

impl FromStr for FlowId {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((name, arguments)) if !name.is_empty() => Ok(FlowId::new(name, arguments)),
            _ => Err(FlowError::Internal(format!("Invalid flow id: '{}'", s))),
        }
    }
}
