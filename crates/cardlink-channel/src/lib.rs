//! Channel abstractions for CARDLINK.
//!
//! Transports and consumers only depend on the contracts defined in this
//! crate: the card channel itself, the consumer lifecycle callbacks, and the
//! fragment-level primitives the external framing algorithm drives.

pub mod contract;
pub mod loopback;

pub use contract::{CardChannel, CardListener, FragmentIo, Framer, SingleFragmentFramer};
pub use loopback::LoopbackChannel;
