//! Binary entry point and process-wide external-interface surface (spec
//! §6): thin async functions over the `duallink-*` crates' process-wide
//! singletons (spec §9's "global current signaling session" design note),
//! the shell a UI or FFI binding calls into.

pub mod api;
pub mod errors;
pub mod state;

pub use errors::AppError;
