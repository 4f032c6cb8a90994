//! Wire grammar for both planes. Control messages are whitespace-tokenized
//! ASCII; data-plane frames mix an ASCII header with a raw binary payload and
//! are parsed first-four-tokens-then-rest, never re-tokenizing the payload.

pub mod control;
pub mod peer;

pub use control::{DiskAddr, DssView};
pub use peer::{PeerRequest, BLOCK_NOT_FOUND, FAIL_COMPLETE, MAX_DATAGRAM};
