//! A loaded plugin: the parsed definition, the `libloading::Library`
//! handle, and the three resolved ABI symbols (`init`, `close`,
//! `queryInterface`).
//!
//! Grounded on `original_source/Libraries/Plugin/Plugin.h`'s
//! `PluginDynamicLibrary`, using `libloading` the way
//! `examples/other_examples/manifests/Alb-O-xeno` and
//! `.../denoland-deno` load native extensions.

use std::ffi::c_void;
use std::time::SystemTime;

use libloading::{Library, Symbol};

use crate::error::CrateError;

use super::compiler::{PluginCompiler, PluginCompilerEnvironment};
use super::scanner::PluginDefinition;
use super::sysroot::PluginSysroot;

type InitFn = unsafe extern "C" fn(*mut *mut c_void) -> bool;
type CloseFn = unsafe extern "C" fn(*mut c_void) -> bool;
type QueryInterfaceFn = unsafe extern "C" fn(*mut c_void, u32, *mut *mut c_void) -> bool;

/// Implemented by interface types a plugin can export, carrying the
/// compile-time hash `queryInterface` uses to identify them (§6). Mirrors
/// the original's `T::InterfaceHash` associated constant.
pub trait PluginInterface {
    const INTERFACE_HASH: u32;
}

struct LoadedLibrary {
    library: Library,
    instance: *mut c_void,
    close: CloseFn,
    query_interface: QueryInterfaceFn,
}

/// A plugin's compiled dynamic library, loaded or not.
pub struct PluginDynamicLibrary {
    pub definition: PluginDefinition,
    pub last_load_time: SystemTime,
    pub num_reloads: u32,
    pub last_error_log: String,
    loaded: Option<LoadedLibrary>,
}

impl PluginDynamicLibrary {
    pub(crate) fn new(definition: PluginDefinition) -> PluginDynamicLibrary {
        PluginDynamicLibrary {
            definition,
            last_load_time: SystemTime::UNIX_EPOCH,
            num_reloads: 0,
            last_error_log: String::new(),
            loaded: None,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// Compiles, links, opens, and `init`s this plugin's dynamic library.
    /// On failure, any previously loaded instance is left untouched (the
    /// atomic-reload invariant from §3).
    pub(crate) fn load(
        &mut self,
        compiler: &PluginCompiler,
        sysroot: &PluginSysroot,
        executable_path: &std::path::Path,
        intermediates_dir: &std::path::Path,
    ) -> Result<(), CrateError> {
        let environment = PluginCompilerEnvironment::from_env();
        let mut log = String::new();

        let objects = match compiler.compile(&self.definition, sysroot, &environment, intermediates_dir, &mut log) {
            Ok(objects) => objects,
            Err(err) => {
                self.last_error_log = log;
                return Err(err);
            }
        };

        let output_library = self.definition.dynamic_library_path(intermediates_dir);
        if let Err(err) = compiler.link(&objects, sysroot, &environment, executable_path, &output_library, &mut log) {
            self.last_error_log = log;
            return Err(err);
        }
        self.last_error_log = log;

        // SAFETY: `output_library` was just produced by `compiler.link`.
        let library = unsafe { Library::new(&output_library) }.map_err(|e| {
            self.last_error_log.push_str(&e.to_string());
            CrateError::InvalidState("failed to open compiled plugin library")
        })?;

        // SAFETY: the three symbols are required exports of the plugin ABI (§6).
        let (init, close, query_interface) = unsafe {
            let init: Symbol<InitFn> = library
                .get(b"init\0")
                .map_err(|_| CrateError::InvalidState("plugin is missing the required `init` symbol"))?;
            let close: Symbol<CloseFn> = library
                .get(b"close\0")
                .map_err(|_| CrateError::InvalidState("plugin is missing the required `close` symbol"))?;
            let query_interface: Symbol<QueryInterfaceFn> = library
                .get(b"queryInterface\0")
                .map_err(|_| CrateError::InvalidState("plugin is missing the required `queryInterface` symbol"))?;
            (*init, *close, *query_interface)
        };

        let mut instance: *mut c_void = std::ptr::null_mut();
        // SAFETY: `init` is the plugin-provided constructor per the ABI contract.
        let ok = unsafe { init(&mut instance) };
        if !ok {
            return Err(CrateError::InvalidState("plugin `init` returned false"));
        }

        self.loaded = Some(LoadedLibrary { library, instance, close, query_interface });
        self.last_load_time = SystemTime::now();
        self.num_reloads += 1;
        Ok(())
    }

    /// Calls the plugin's `close` and releases the library handle.
    pub(crate) fn unload(&mut self) -> Result<(), CrateError> {
        let Some(loaded) = self.loaded.take() else { return Ok(()) };
        // SAFETY: `close` is the plugin-provided destructor per the ABI contract.
        let ok = unsafe { (loaded.close)(loaded.instance) };
        if !ok {
            return Err(CrateError::InvalidState("plugin `close` returned false"));
        }
        Ok(())
    }

    /// Asks the plugin for its implementation of `T`, identified by
    /// `T::INTERFACE_HASH`. Returns `None` if the plugin isn't loaded or
    /// doesn't implement the interface.
    ///
    /// # Safety
    /// The returned pointer is only valid for as long as this library stays
    /// loaded, and only meaningfully `T` if the plugin's `queryInterface`
    /// implementation honours the hash contract.
    pub unsafe fn query_interface<T: PluginInterface>(&self) -> Option<*mut T> {
        let loaded = self.loaded.as_ref()?;
        let mut out: *mut c_void = std::ptr::null_mut();
        let ok = unsafe { (loaded.query_interface)(loaded.instance, T::INTERFACE_HASH, &mut out) };
        if ok && !out.is_null() {
            Some(out.cast())
        } else {
            None
        }
    }
}

impl Drop for PluginDynamicLibrary {
    fn drop(&mut self) {
        let _ = self.unload();
    }
}
