//! Compiles and links a [`PluginDefinition`](super::scanner::PluginDefinition)
//! into a native dynamic library.
//!
//! Grounded on `original_source/Libraries/Plugin/Plugin.h`
//! (`PluginCompiler::findBestCompiler`/`compile`/`link`), driven with
//! `which` to probe `PATH` the same way
//! `examples/other_examples/manifests/Alb-O-xeno` and
//! `.../denoland-deno` locate native toolchain binaries before shelling
//! out to them.

use std::path::PathBuf;
use std::process::Command;

use crate::error::CrateError;

use super::scanner::PluginDefinition;
use super::sysroot::PluginSysroot;

/// Which compiler family [`PluginCompiler::find_best_compiler`] resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerKind {
    Clang,
    Gnu,
    Microsoft,
}

/// `CFLAGS`/`LDFLAGS` read from the environment, combined with sysroot
/// options when compiling/linking (§6).
#[derive(Debug, Clone, Default)]
pub struct PluginCompilerEnvironment {
    pub c_flags: String,
    pub ld_flags: String,
}

impl PluginCompilerEnvironment {
    pub fn from_env() -> PluginCompilerEnvironment {
        PluginCompilerEnvironment {
            c_flags: std::env::var("CFLAGS").unwrap_or_default(),
            ld_flags: std::env::var("LDFLAGS").unwrap_or_default(),
        }
    }
}

/// Resolved compiler + linker driver, plus the include/library paths the
/// caller wants every plugin compiled with.
#[derive(Debug, Clone)]
pub struct PluginCompiler {
    pub kind: CompilerKind,
    pub compiler_path: PathBuf,
    pub linker_path: PathBuf,
    pub include_paths: Vec<PathBuf>,
}

impl PluginCompiler {
    /// Probes `CXX`/`CC` first (§6's documented override), then `PATH` for
    /// `clang`, `gcc`, `cl` in priority order.
    pub fn find_best_compiler() -> Result<PluginCompiler, CrateError> {
        if let Ok(cxx) = std::env::var("CXX") {
            let path = PathBuf::from(&cxx);
            return Ok(PluginCompiler {
                kind: kind_from_name(&cxx),
                compiler_path: path.clone(),
                linker_path: path,
                include_paths: Vec::new(),
            });
        }

        for (name, kind) in [("clang++", CompilerKind::Clang), ("g++", CompilerKind::Gnu), ("cl", CompilerKind::Microsoft)] {
            if let Ok(path) = which::which(name) {
                return Ok(PluginCompiler {
                    kind,
                    compiler_path: path.clone(),
                    linker_path: path,
                    include_paths: Vec::new(),
                });
            }
        }

        Err(CrateError::InvalidState("no supported compiler (clang++/g++/cl) found on PATH"))
    }

    /// Compiles every source file of `definition` into an object file
    /// inside `intermediates_dir`, returning the produced object paths.
    /// Compiler output (combined stdout+stderr) is appended to
    /// `compiler_log` regardless of success, matching the "lastErrorLog
    /// always captures the log" failure semantics.
    pub fn compile(
        &self,
        definition: &PluginDefinition,
        sysroot: &PluginSysroot,
        environment: &PluginCompilerEnvironment,
        intermediates_dir: &std::path::Path,
        compiler_log: &mut String,
    ) -> Result<Vec<PathBuf>, CrateError> {
        std::fs::create_dir_all(intermediates_dir)?;
        let mut objects = Vec::new();
        for file in &definition.files {
            let object_path = intermediates_dir.join(object_file_name(&file.absolute_path));
            self.compile_file(definition, sysroot, environment, &file.absolute_path, &object_path, compiler_log)?;
            objects.push(object_path);
        }
        Ok(objects)
    }

    fn compile_file(
        &self,
        definition: &PluginDefinition,
        sysroot: &PluginSysroot,
        environment: &PluginCompilerEnvironment,
        source_file: &std::path::Path,
        object_file: &std::path::Path,
        compiler_log: &mut String,
    ) -> Result<(), CrateError> {
        let mut cmd = Command::new(&self.compiler_path);
        cmd.arg("-c").arg(source_file).arg("-o").arg(object_file).arg("-fPIC");

        let include_paths = std::iter::once(definition.directory.as_path())
            .chain(self.include_paths.iter().map(PathBuf::as_path));
        for path in include_paths {
            cmd.arg("-I").arg(path);
        }
        for path in &sysroot.include_paths {
            cmd.arg("-I").arg(path);
        }
        if let Some(isysroot) = &sysroot.isysroot {
            cmd.arg("-isysroot").arg(isysroot);
        }
        if !environment.c_flags.is_empty() {
            cmd.args(environment.c_flags.split_whitespace());
        }

        run_capturing(&mut cmd, compiler_log)
    }

    /// Links every object file compiled by [`PluginCompiler::compile`] into
    /// a dynamic library at `output_library`, exposing `executable_path`'s
    /// symbols to the plugin so it can call back into the host process.
    pub fn link(
        &self,
        objects: &[PathBuf],
        sysroot: &PluginSysroot,
        environment: &PluginCompilerEnvironment,
        executable_path: &std::path::Path,
        output_library: &std::path::Path,
        linker_log: &mut String,
    ) -> Result<(), CrateError> {
        let mut cmd = Command::new(&self.linker_path);
        cmd.arg("-shared").args(objects).arg("-o").arg(output_library);

        if cfg!(target_os = "macos") {
            cmd.arg("-undefined").arg("dynamic_lookup");
        } else if !cfg!(target_os = "windows") {
            cmd.arg("-Wl,--unresolved-symbols=ignore-all");
            let _ = executable_path;
        }

        for path in &sysroot.library_paths {
            cmd.arg("-L").arg(path);
        }
        if let Some(isysroot) = &sysroot.isysroot {
            cmd.arg("-isysroot").arg(isysroot);
        }
        if !environment.ld_flags.is_empty() {
            cmd.args(environment.ld_flags.split_whitespace());
        }

        run_capturing(&mut cmd, linker_log)
    }
}

fn run_capturing(cmd: &mut Command, log: &mut String) -> Result<(), CrateError> {
    let output = cmd.output()?;
    log.push_str(&String::from_utf8_lossy(&output.stdout));
    log.push_str(&String::from_utf8_lossy(&output.stderr));
    if output.status.success() {
        Ok(())
    } else {
        Err(CrateError::InvalidState("compiler or linker invocation failed"))
    }
}

fn object_file_name(source: &std::path::Path) -> String {
    let stem = source.file_stem().and_then(|s| s.to_str()).unwrap_or("plugin");
    let ext = if cfg!(target_os = "windows") { "obj" } else { "o" };
    format!("{stem}.{ext}")
}

fn kind_from_name(name: &str) -> CompilerKind {
    if name.contains("clang") {
        CompilerKind::Clang
    } else if name.contains("cl") && !name.contains("clang") {
        CompilerKind::Microsoft
    } else {
        CompilerKind::Gnu
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_name_recognises_compilers() {
        assert_eq!(kind_from_name("clang++"), CompilerKind::Clang);
        assert_eq!(kind_from_name("g++"), CompilerKind::Gnu);
        assert_eq!(kind_from_name("cl"), CompilerKind::Microsoft);
    }

    #[test]
    fn object_file_name_uses_platform_extension() {
        let name = object_file_name(std::path::Path::new("/plugins/foo/main.cpp"));
        assert!(name.starts_with("main."));
    }
}
