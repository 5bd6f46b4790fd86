use core::fmt;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use crate::dpth::Location;

/// A BLAKE3 digest confirming exact content equality after a weak hit.
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StrongHash(pub [u8; 32]);

static EMPTY: LazyLock<StrongHash> = LazyLock::new(|| StrongHash::of(b""));

impl StrongHash {
    pub fn of(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// The hash of the empty string.
    pub fn empty() -> Self {
        *EMPTY
    }

    pub fn to_hex(&self) -> String {
        base16ct::lower::encode_string(&self.0)
    }

    pub fn from_hex(hex: &str) -> Option<Self> {
        let mut bytes = [0; 32];
        let decoded = base16ct::mixed::decode(hex, &mut bytes).ok()?;
        (decoded.len() == 32).then_some(Self(bytes))
    }
}

impl fmt::Debug for StrongHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StrongHash({:x})", base16ct::HexDisplay(&self.0))
    }
}

impl fmt::Display for StrongHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", base16ct::HexDisplay(&self.0))
    }
}

/// What the client tells us about one content-defined chunk.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Signature {
    /// The rolling hash at the chunk boundary.
    pub fingerprint: u64,
    pub strong: StrongHash,
    pub length: u32,
}

impl Signature {
    pub fn of(fingerprint: u64, data: &[u8]) -> Self {
        Self {
            fingerprint,
            strong: StrongHash::of(data),
            length: data.len() as u32,
        }
    }

    /// Empty blocks are everywhere and are never looked up or stored.
    pub fn is_empty_block(&self) -> bool {
        self.length == 0 || self.strong == StrongHash::empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    /// Signature received, not yet classified.
    Incoming,
    /// New content: a location was allocated and the data requested.
    NotGot,
    /// Already stored: the location points at existing data.
    Got,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub index: u64,
    pub sig: Signature,
    pub state: BlockState,
    /// `None` while incoming, and for empty blocks which need no storage.
    pub location: Option<Location>,
    pub requested: bool,
    pub written: bool,
}

impl Block {
    pub fn new(index: u64, sig: Signature) -> Self {
        Self {
            index,
            sig,
            state: BlockState::Incoming,
            location: None,
            requested: false,
            written: false,
        }
    }

    /// Whether the manifest entry for this block can be written.
    pub fn is_complete(&self) -> bool {
        match self.state {
            BlockState::Incoming => false,
            BlockState::Got => true,
            BlockState::NotGot => self.written,
        }
    }
}
