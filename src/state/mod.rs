//! Typed workflow state
//!
//! A [`StateFactory`] is compiled once per workflow from its field schema and
//! produces validated [`RuntimeState`] values. States are immutable; node
//! results are applied copy-on-write.

mod error;
mod factory;
mod runtime;

pub use error::{StateBuilderError, StateError};
pub use factory::StateFactory;
pub use runtime::RuntimeState;
