use regex::Regex;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::sync::OnceLock;

/// One row of an `ls` listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
    /// Size as printed by the tool; `-` for directories.
    pub size: String,
    /// `"<date> <time>"` as printed by the tool.
    pub modified: String,
    pub path: String,
}

// The UI reads both `is_dir` and `isDir`, so the flag goes out twice.
impl Serialize for DirEntry {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("DirEntry", 6)?;
        state.serialize_field("name", &self.name)?;
        state.serialize_field("is_dir", &self.is_dir)?;
        state.serialize_field("isDir", &self.is_dir)?;
        state.serialize_field("size_str", &self.size)?;
        state.serialize_field("modified_time", &self.modified)?;
        state.serialize_field("path", &self.path)?;
        state.end()
    }
}

fn index_prefix() -> &'static Regex {
    static INDEX: OnceLock<Regex> = OnceLock::new();
    INDEX.get_or_init(|| Regex::new(r"^\s*\d+\s+").expect("valid regex"))
}

fn is_chrome(line: &str) -> bool {
    line.is_empty()
        || line.starts_with("当前目录")
        || line.starts_with("----")
        || line.contains("文件大小")
        || line.contains("总:")
}

/// Parses the table printed by `ls <parent>`. Lines that are not data rows
/// are skipped, so unexpected output yields fewer entries rather than an
/// error.
pub fn parse_listing(text: &str, parent: &str) -> Vec<DirEntry> {
    text.lines()
        .map(str::trim)
        .filter(|line| !is_chrome(line))
        .filter_map(|line| parse_row(line, parent))
        .collect()
}

fn parse_row(line: &str, parent: &str) -> Option<DirEntry> {
    let matched = index_prefix().find(line)?;
    let fields: Vec<&str> = line[matched.end()..].split_whitespace().collect();
    if fields.len() < 4 {
        return None;
    }

    let raw_name = fields[3..].join(" ");
    let (name, is_dir) = match raw_name.strip_suffix('/') {
        Some(stripped) => (stripped.to_string(), true),
        None => (raw_name, false),
    };
    Some(DirEntry {
        path: join_remote(parent, &name),
        size: fields[0].to_string(),
        modified: format!("{} {}", fields[1], fields[2]),
        name,
        is_dir,
    })
}

/// Joins a remote parent directory and a child name without doubling the
/// separator.
pub fn join_remote(parent: &str, name: &str) -> String {
    let parent = parent.trim_end_matches('/');
    format!("{parent}/{name}")
}
