//! Debug dumps of the whole node graph.

use std::path::PathBuf;

use indexmap::IndexSet;

use crate::storage::NodeMap;

/// Output format of [`Resources::audit`](crate::Resources::audit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuditMode {
    /// One row per node: `resource,version,deps`, newest first.
    #[default]
    Csv,
    /// A Graphviz digraph of the dependency edges between paths.
    Dot,
}

impl AuditMode {
    /// File extension used when the dump is written out.
    pub fn extension(self) -> &'static str {
        match self {
            AuditMode::Csv => "csv",
            AuditMode::Dot => "dot",
        }
    }
}

/// Options for [`Resources::audit`](crate::Resources::audit).
#[derive(Debug, Clone, Default)]
pub struct AuditOptions {
    /// Output format.
    pub mode: AuditMode,
    /// Directory to write `audit.<ext>` into. Ignored in a server context.
    pub download: Option<PathBuf>,
}

impl AuditOptions {
    /// Options for the given mode without writing a file.
    pub fn new(mode: AuditMode) -> Self {
        Self {
            mode,
            download: None,
        }
    }

    /// Also write the dump into `dir`.
    pub fn download(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download = Some(dir.into());
        self
    }
}

pub(crate) fn render(nodes: &NodeMap, mode: AuditMode) -> String {
    match mode {
        AuditMode::Csv => csv(nodes),
        AuditMode::Dot => dot(nodes),
    }
}

fn csv(nodes: &NodeMap) -> String {
    let mut rows: Vec<(&str, u64, Vec<&str>)> = nodes
        .iter()
        .map(|(_, node)| {
            let deps = node
                .deps()
                .filter_map(|dep| nodes.node(dep))
                .map(|dep| dep.debug_name())
                .collect();
            (node.debug_name(), node.version(), deps)
        })
        .collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));

    let mut out = String::from("resource,version,deps");
    for (name, version, deps) in rows {
        out.push('\n');
        out.push_str(&csv_field(name));
        out.push(',');
        out.push_str(&version.to_string());
        out.push(',');
        out.push_str(&csv_field(&deps.join("; ")));
    }
    out
}

fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_owned()
    }
}

fn dot(nodes: &NodeMap) -> String {
    let mut vertices = IndexSet::<String>::new();
    let mut edges = IndexSet::<String>::new();
    let mut vertex = |path: &str| {
        let id = path.replace('/', "_");
        let label = serde_json::to_string(path).unwrap_or_else(|_| format!("{path:?}"));
        vertices.insert(format!("{id} [label={label}]"));
        id
    };
    for (_, node) in nodes.iter() {
        for dep in node.deps().filter_map(|dep| nodes.node(dep)) {
            let from = vertex(node.key().path());
            let to = vertex(dep.key().path());
            edges.insert(format!("{from} -> {to}"));
        }
    }

    let vertices: Vec<_> = vertices.into_iter().collect();
    let edges: Vec<_> = edges.into_iter().collect();
    format!("digraph G {{\n{}\n{}\n}}", vertices.join("\n"), edges.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field(r#"["/a",1]"#), r#""[""/a"",1]""#);
        assert_eq!(csv_field(""), "");
    }

    #[test]
    fn test_empty_graph() {
        let nodes = NodeMap::new();
        assert_eq!(render(&nodes, AuditMode::Csv), "resource,version,deps");
        assert_eq!(render(&nodes, AuditMode::Dot), "digraph G {\n\n\n}");
    }

    #[test]
    fn test_extensions() {
        assert_eq!(AuditMode::default().extension(), "csv");
        assert_eq!(AuditMode::Dot.extension(), "dot");
    }
}
