//! System include/library paths handed to the plugin compiler so compiled
//! plugins can resolve libc/libc++ symbols independently of the host
//! toolchain's default configuration.
//!
//! Grounded on `original_source/Libraries/Plugin/Plugin.h`'s
//! `PluginSysroot::findBestSysroot`. The original's implementation (not in
//! the retrieved pack) almost certainly shells out to the compiler itself
//! (`clang -print-resource-dir`/`xcrun --show-sdk-path` on macOS); this
//! crate does the same rather than hardcoding version-specific paths.

use std::path::PathBuf;
use std::process::Command;

use crate::error::CrateError;

use super::compiler::CompilerKind;

/// Include/library search paths appropriate for a given compiler, used to
/// let compiled plugins link against libc/libc++.
#[derive(Debug, Clone, Default)]
pub struct PluginSysroot {
    pub include_paths: Vec<PathBuf>,
    pub library_paths: Vec<PathBuf>,
    /// Passed as `-isysroot` (Clang/macOS) when present.
    pub isysroot: Option<PathBuf>,
}

impl PluginSysroot {
    /// Resolves a sysroot appropriate for `kind`. Never fails outright —
    /// an empty [`PluginSysroot`] (relying on the compiler's own defaults)
    /// is returned if no platform-specific probe succeeds.
    pub fn find_best_sysroot(kind: CompilerKind) -> Result<PluginSysroot, CrateError> {
        match kind {
            CompilerKind::Clang if cfg!(target_os = "macos") => Ok(macos_sysroot()),
            _ => Ok(PluginSysroot::default()),
        }
    }
}

fn macos_sysroot() -> PluginSysroot {
    let output = Command::new("xcrun").args(["--show-sdk-path"]).output();
    let isysroot = output
        .ok()
        .filter(|o| o.status.success())
        .and_then(|o| String::from_utf8(o.stdout).ok())
        .map(|s| PathBuf::from(s.trim()));

    PluginSysroot {
        include_paths: Vec::new(),
        library_paths: Vec::new(),
        isysroot,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gnu_sysroot_defaults_to_empty() {
        let sysroot = PluginSysroot::find_best_sysroot(CompilerKind::Gnu).unwrap();
        assert!(sysroot.include_paths.is_empty());
        assert!(sysroot.isysroot.is_none());
    }
}
