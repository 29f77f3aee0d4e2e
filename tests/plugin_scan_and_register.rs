//! Scanning a directory of plugin sources and feeding the result into a
//! `PluginRegistry` discovers both an independent plugin and one with a
//! declared dependency, and a rescan after editing a header in place keeps
//! the previously-loaded slot (since neither plugin below is ever actually
//! compiled, "loaded" state here is simply "still registered").

use nexus_io::{PluginRegistry, PluginScanner};

const PARENT_PLUGIN: &str = r#"
// SC_BEGIN_PLUGIN
// Name:          Parent Plugin
// Version:       1
// Category:      Generic
// SC_END_PLUGIN
"#;

const CHILD_PLUGIN: &str = r#"
// SC_BEGIN_PLUGIN
// Name:          Child Plugin
// Version:       1
// Dependencies:  ParentPlugin
// SC_END_PLUGIN
"#;

#[test]
fn scan_discovers_plugins_with_a_dependency_edge() {
    let dir = tempfile::tempdir().unwrap();
    let parent_dir = dir.path().join("ParentPlugin");
    let child_dir = dir.path().join("ChildPlugin");
    std::fs::create_dir(&parent_dir).unwrap();
    std::fs::create_dir(&child_dir).unwrap();
    std::fs::write(parent_dir.join("main.cpp"), PARENT_PLUGIN).unwrap();
    std::fs::write(child_dir.join("main.cpp"), CHILD_PLUGIN).unwrap();

    let definitions = PluginScanner::scan_directory(dir.path()).unwrap();
    assert_eq!(definitions.len(), 2);

    let child = definitions.iter().find(|d| d.identifier == "ChildPlugin").unwrap();
    assert_eq!(child.dependencies, vec!["ParentPlugin"]);

    let mut registry = PluginRegistry::new(dir.path().join("intermediates"));
    registry.replace_definitions(definitions).unwrap();
    assert_eq!(registry.number_of_entries(), 2);
    assert!(registry.find_plugin("ParentPlugin").is_some());
    assert!(registry.find_plugin("ChildPlugin").is_some());

    // A rescan that finds the same two identifiers keeps the same slots
    // rather than discarding and recreating them.
    let rescanned = PluginScanner::scan_directory(dir.path()).unwrap();
    registry.replace_definitions(rescanned).unwrap();
    assert_eq!(registry.number_of_entries(), 2);
}
