use std::collections::HashSet;
use std::fs;

// The embedded command tables are parsed at run time; catch duplicate ids and
// malformed TOML at compile time instead.
const TABLES: &[&str] = &[
    "src/tables/coherent_sdg.toml",
    "src/tables/dg645.toml",
    "src/tables/tpg261.toml",
];

fn main() {
    for path in TABLES {
        println!("cargo:rerun-if-changed={path}");
        let src = fs::read_to_string(path).unwrap_or_else(|e| panic!("read {path}: {e}"));
        let doc: toml::Table = toml::from_str(&src)
            .unwrap_or_else(|e| panic!("{path}: invalid TOML: {e}"));

        let mut ids = HashSet::new();
        let commands = doc
            .get("command")
            .and_then(toml::Value::as_array)
            .map_or(&[][..], Vec::as_slice);
        for cmd in commands {
            let id = cmd
                .get("id")
                .and_then(toml::Value::as_integer)
                .unwrap_or_else(|| panic!("{path}: command without integer id"));
            assert!(ids.insert(id), "{path}: duplicate command id {id}");
        }
    }
}
