//! Readiness token layout and operation tracking.
//!
//! Every registration with the shared poller carries a `mio::Token`. Two
//! values are reserved (listener and waker); every other token names a
//! connection slot plus the generation of the connection occupying it, so a
//! readiness event that outlives its connection can never be delivered to a
//! newer connection reusing the same slot.

use mio::Token;

/// Token of the listening socket.
pub const LISTENER: Token = Token(0);

/// Token of the waker used to interrupt the poller.
pub const WAKER: Token = Token(1);

/// Low bits of a connection token hold the slot index.
const INDEX_BITS: u32 = 24;
const INDEX_MASK: usize = (1 << INDEX_BITS) - 1;

/// Largest slot index a token can carry.
pub const MAX_INDEX: usize = INDEX_MASK;

/// Generations cycle through `1..=MAX_GENERATION`; zero is never issued so a
/// connection token can never collide with the reserved tokens.
const MAX_GENERATION: usize = usize::MAX >> INDEX_BITS;

/// Kind of operation outstanding against a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    /// Waiting for the socket to become readable.
    Read,
    /// Waiting for the socket to accept more response bytes.
    Write,
}

/// Connection slot index tagged with its generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnToken {
    index: usize,
    generation: usize,
}

impl ConnToken {
    pub fn new(index: usize, generation: usize) -> Self {
        debug_assert!(index <= MAX_INDEX, "slot index out of token range");
        debug_assert!(
            (1..=MAX_GENERATION).contains(&generation),
            "generation out of token range"
        );
        Self { index, generation }
    }

    /// Slot index in the connection table.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> usize {
        self.generation
    }

    /// Encode as a poller token.
    pub fn to_token(self) -> Token {
        Token((self.generation << INDEX_BITS) | self.index)
    }

    /// Decode a poller token. Returns `None` for the reserved tokens.
    pub fn from_token(token: Token) -> Option<Self> {
        let generation = token.0 >> INDEX_BITS;
        if generation == 0 {
            return None;
        }
        Some(Self {
            index: token.0 & INDEX_MASK,
            generation,
        })
    }
}

/// The generation following `generation`, wrapping back to 1.
pub fn next_generation(generation: usize) -> usize {
    if generation >= MAX_GENERATION {
        1
    } else {
        generation + 1
    }
}

impl std::fmt::Display for ConnToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.index, self.generation)
    }
}
