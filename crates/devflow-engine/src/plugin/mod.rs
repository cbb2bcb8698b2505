//! Filter plugins loaded from shared libraries

pub mod abi;
mod loader;
mod module;

pub use loader::PluginLoader;
pub use module::{PluginFilter, PluginModule};
