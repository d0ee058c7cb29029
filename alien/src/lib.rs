//! alien: calls native functions described by [`ctype`] signatures and
//! exposes managed functions to native code through trampolines.
//!
//! A forward call classifies its signature for the target ABI once, builds
//! a frame image in a pool's stack arena, switches to it through a forward
//! primitive and decodes the result registers. The reverse path runs a
//! thunk, reads the arguments back with the same placement table and
//! relays to the bound function, on the owning thread when needed.

pub mod abi;
pub mod arena;
pub mod broker;
pub mod codec;
pub mod config;
pub mod decode;
pub mod dispatch;
mod error;
pub mod frame;
mod instance;
pub mod pool;
pub mod relay;
mod session;
mod system;
pub mod threading;
pub mod thunks;
pub mod trampoline;
mod value;

pub use config::{AlienCreateInfo, AlienSettings, MAX_TRAMPOLINES};
pub use ctype;
pub use error::{AlienError, AlienResult, ArgPosition, Resource};
pub use instance::{AsyncCall, EngineStats, Instance};
pub use session::CallSession;
pub use value::*;
