//! Pairchat core logic.
//!
//! Everything in this crate is independent of the transport and of the
//! concrete document store. I/O happens behind two traits:
//!
//! - [`Store`]: get/set/query/delete over the Users, Rooms and Turns
//!   collections
//! - [`TextTransform`]: the external text-processing step applied to every
//!   message before it is persisted
//!
//! Time and randomness come from [`Environment`] so that pairing, reshuffles
//! and relay timestamps are reproducible under simulation.
//!
//! ## Architecture
//!
//! ```text
//! pairchat-core
//!   ├─ Environment       (clock, sleep, RNG)
//!   ├─ Store             (MemoryStore, ChaoticStore)
//!   ├─ PairingEngine     (try_pair_one, full_reshuffle, pairing lease)
//!   ├─ schedule          (reset cadence and boundary computation)
//!   └─ MessageRelay      (transform with fallback, persist, ordered replay)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod env;
pub mod model;
pub mod pairing;
pub mod relay;
pub mod schedule;
pub mod store;

pub use env::Environment;
pub use model::{Room, RoomId, Turn, TurnId, User, UserId};
pub use pairing::{PairOutcome, PairingEngine, PairingError, ReshuffleReport};
pub use relay::{MessageRelay, Passthrough, RelayError, TextTransform, TransformError, sort_turns};
pub use schedule::{ParseCadenceError, ResetCadence, next_boundary};
pub use store::{ChaoticStore, MemoryStore, Store, StoreError, StoreOp, TurnFilter, UserFilter};
