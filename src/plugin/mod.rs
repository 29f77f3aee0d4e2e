//! Compiles native source files into dynamic libraries and hot-reloads
//! them, reacting to [`crate::watcher`] notifications.
//!
//! Grounded on `original_source/Libraries/Plugin/Plugin.h`. Four pieces,
//! leaves-first: [`scanner`] parses plugin definitions out of source
//! files, [`compiler`] and [`sysroot`] drive the native toolchain,
//! [`library`] wraps one loaded dynamic library, and [`registry`] owns the
//! whole set and exposes the load/reload/unload workflow.

pub mod compiler;
pub mod library;
pub mod registry;
pub mod scanner;
pub mod sysroot;

pub use compiler::{CompilerKind, PluginCompiler, PluginCompilerEnvironment};
pub use library::{PluginDynamicLibrary, PluginInterface};
pub use registry::{LoadMode, PluginRegistry};
pub use scanner::{PluginDefinition, PluginFile, PluginScanner};
pub use sysroot::PluginSysroot;
