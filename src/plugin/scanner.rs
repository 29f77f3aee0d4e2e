//! Parses the `SC_BEGIN_PLUGIN` / `SC_END_PLUGIN` comment block out of a
//! plugin's main source file, and walks a directory tree collecting every
//! such block it finds.
//!
//! Grounded on `original_source/Libraries/Plugin/Plugin.h`
//! (`PluginDefinition::find`/`parse`, `PluginScanner::scanDirectory`) and on
//! its test fixture in `Tests/PluginTest.cpp`, which is the only place the
//! pack shows the wire format actually in use (each key line prefixed with
//! `//` and leading whitespace).

use std::path::{Path, PathBuf};

use crate::error::CrateError;

const BEGIN_MARKER: &str = "SC_BEGIN_PLUGIN";
const END_MARKER: &str = "SC_END_PLUGIN";

/// One source file belonging to a plugin.
#[derive(Debug, Clone)]
pub struct PluginFile {
    pub absolute_path: PathBuf,
}

/// A parsed plugin definition: identity, metadata, and the files that
/// compose it.
#[derive(Debug, Clone)]
pub struct PluginDefinition {
    /// Unique identifier for this plugin — the name of the directory
    /// holding its main source file (Open Question: the original leaves
    /// identifier derivation unspecified; see `DESIGN.md`).
    pub identifier: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub category: String,
    pub directory: PathBuf,
    pub dependencies: Vec<String>,
    pub build: Vec<String>,
    pub files: Vec<PluginFile>,
    pub(crate) main_file_index: usize,
}

impl PluginDefinition {
    /// The file holding the `SC_BEGIN_PLUGIN` comment block.
    pub fn main_file(&self) -> &Path {
        &self.files[self.main_file_index].absolute_path
    }

    /// Path the compiled dynamic library for this plugin will live at,
    /// given `intermediates_dir` — deterministic and reproducible per §6.
    pub fn dynamic_library_path(&self, intermediates_dir: &Path) -> PathBuf {
        intermediates_dir.join(dynamic_library_file_name(&self.identifier))
    }

    /// Locates the `SC_BEGIN_PLUGIN` ... `SC_END_PLUGIN` block inside
    /// `text`, stripping the per-line comment prefix.
    fn find_block(text: &str) -> Option<Vec<&str>> {
        let mut lines = text.lines();
        loop {
            let line = lines.next()?;
            if strip_comment_prefix(line) == BEGIN_MARKER {
                break;
            }
        }
        let mut block = Vec::new();
        for line in lines {
            if strip_comment_prefix(line) == END_MARKER {
                return Some(block);
            }
            block.push(line);
        }
        None
    }

    /// Parses the `Key: value` lines of an extracted block. `Name` and
    /// `Version` are required; every other key defaults to empty, matching
    /// §6 ("missing keys other than Name and Version are tolerated").
    fn parse_block(block: &[&str]) -> Option<ParsedHeader> {
        let mut header = ParsedHeader::default();
        let mut has_name = false;
        let mut has_version = false;

        for line in block {
            let Some((key, value)) = parse_line(line) else { continue };
            match key {
                "Name" => {
                    header.name = value.to_string();
                    has_name = true;
                }
                "Version" => {
                    header.version = value.to_string();
                    has_version = true;
                }
                "Description" => header.description = value.to_string(),
                "Category" => header.category = value.to_string(),
                "Dependencies" => header.dependencies = split_csv(value),
                "Build" => header.build = split_csv(value),
                // Forward-compatible: unknown keys are silently ignored.
                _ => {}
            }
        }

        if has_name && has_version {
            Some(header)
        } else {
            None
        }
    }
}

#[derive(Default)]
struct ParsedHeader {
    name: String,
    version: String,
    description: String,
    category: String,
    dependencies: Vec<String>,
    build: Vec<String>,
}

fn strip_comment_prefix(line: &str) -> &str {
    let trimmed = line.trim();
    trimmed.strip_prefix("//").map(str::trim).unwrap_or(trimmed)
}

fn parse_line(line: &str) -> Option<(&str, &str)> {
    let content = strip_comment_prefix(line);
    let (key, value) = content.split_once(':')?;
    Some((key.trim(), value.trim()))
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn dynamic_library_file_name(identifier: &str) -> String {
    if cfg!(target_os = "windows") {
        format!("{identifier}.dll")
    } else if cfg!(target_os = "macos") {
        format!("lib{identifier}.dylib")
    } else {
        format!("lib{identifier}.so")
    }
}

fn is_source_file(path: &Path) -> bool {
    matches!(path.extension().and_then(|e| e.to_str()), Some("cpp") | Some("c"))
}

/// Recursively scans `directory` for plugin definitions.
pub struct PluginScanner;

impl PluginScanner {
    /// Walks `directory`'s tree looking for `.cpp`/`.c` files carrying a
    /// plugin definition comment block. Each match's containing directory
    /// becomes one [`PluginDefinition`]; sibling source files in that same
    /// directory are added as its other files.
    pub fn scan_directory(directory: &Path) -> Result<Vec<PluginDefinition>, CrateError> {
        let mut found = Vec::new();
        let mut stack = vec![directory.to_path_buf()];
        let mut visited_dirs = std::collections::HashSet::new();

        while let Some(dir) = stack.pop() {
            let entries = std::fs::read_dir(&dir)?;
            for entry in entries {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                if !is_source_file(&path) || !visited_dirs.insert(path.parent().map(Path::to_path_buf)) {
                    continue;
                }

                let Ok(text) = std::fs::read_to_string(&path) else { continue };
                let Some(block) = PluginDefinition::find_block(&text) else { continue };
                let Some(header) = PluginDefinition::parse_block(&block) else { continue };

                let plugin_dir = path.parent().unwrap_or(&dir).to_path_buf();
                let identifier = plugin_dir
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| header.name.clone());

                let mut files = vec![PluginFile { absolute_path: path.clone() }];
                if let Ok(siblings) = std::fs::read_dir(&plugin_dir) {
                    for sibling in siblings.flatten() {
                        let sibling_path = sibling.path();
                        if sibling_path != path && is_source_file(&sibling_path) {
                            files.push(PluginFile { absolute_path: sibling_path });
                        }
                    }
                }

                found.push(PluginDefinition {
                    identifier,
                    name: header.name,
                    version: header.version,
                    description: header.description,
                    category: header.category,
                    directory: plugin_dir,
                    dependencies: header.dependencies,
                    build: header.build,
                    files,
                    main_file_index: 0,
                });
            }
        }

        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
// SC_BEGIN_PLUGIN
// Name:          Test Plugin
// Version:       1
// Description:   A Simple text plugin
// Category:      Generic
// Dependencies:  TestPluginChild,TestPlugin02
// Build:         libc,libc++
// SC_END_PLUGIN
"#;

    #[test]
    fn parses_sample_header() {
        let block = PluginDefinition::find_block(SAMPLE).expect("block found");
        let header = PluginDefinition::parse_block(&block).expect("header parsed");
        assert_eq!(header.name, "Test Plugin");
        assert_eq!(header.version, "1");
        assert_eq!(header.description, "A Simple text plugin");
        assert_eq!(header.category, "Generic");
        assert_eq!(header.dependencies, vec!["TestPluginChild", "TestPlugin02"]);
        assert_eq!(header.build, vec!["libc", "libc++"]);
    }

    #[test]
    fn missing_name_or_version_rejects_block() {
        let block = PluginDefinition::find_block(
            "// SC_BEGIN_PLUGIN\n// Description: x\n// SC_END_PLUGIN\n",
        )
        .unwrap();
        assert!(PluginDefinition::parse_block(&block).is_none());
    }

    #[test]
    fn scans_nested_plugin_directory() {
        let dir = tempfile::tempdir().unwrap();
        let plugin_dir = dir.path().join("TestPlugin");
        std::fs::create_dir(&plugin_dir).unwrap();
        std::fs::write(plugin_dir.join("main.cpp"), SAMPLE).unwrap();
        std::fs::write(plugin_dir.join("helper.cpp"), "// not a plugin").unwrap();

        let defs = PluginScanner::scan_directory(dir.path()).unwrap();
        assert_eq!(defs.len(), 1);
        assert_eq!(defs[0].identifier, "TestPlugin");
        assert_eq!(defs[0].files.len(), 2);
    }
}
