//! Type model for the alien FFI engine: C type descriptors with resolved
//! layout, function signatures, and the per-parameter placement tables the
//! ABI classifiers fill in.

mod descriptor;
mod kind;
mod layout;
mod registry;
mod signature;
mod target;

pub use descriptor::*;
pub use kind::*;
pub use layout::*;
pub use registry::TypeRegistry;
pub use signature::*;
pub use target::*;
