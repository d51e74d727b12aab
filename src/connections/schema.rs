//! Schema snapshot rendering.
//!
//! Introspected tables are rendered as markdown the model reads inside the
//! system prompt: one `## Connection:` header per connection, then one
//! `### table` section per table with its column types and a few sample rows.
//! Output is bounded by table count and total bytes.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Sample cells longer than this many characters are clipped.
const MAX_CELL_CHARS: usize = 200;

/// Omitted table names listed in the truncation note.
const MAX_NOTED_TABLES: usize = 20;

const CONNECTION_PREFIX: &str = "## Connection: ";

/// Bounds applied while rendering a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaLimits {
    pub sample_rows: usize,
    pub max_tables: usize,
    pub max_bytes: usize,
}

impl Default for SchemaLimits {
    fn default() -> Self {
        Self {
            sample_rows: 3,
            max_tables: 50,
            max_bytes: 24_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
}

/// One introspected table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    /// Sample rows rendered as display strings (`NULL` → empty).
    pub sample_rows: Vec<Vec<String>>,
}

/// Tables read from one database. `unscanned` names tables past the
/// `max_tables` cutoff, which were listed but never sampled.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaScan {
    pub tables: Vec<TableSchema>,
    pub unscanned: Vec<String>,
}

impl SchemaScan {
    /// Split `names` at `max_tables`; only the head is worth sampling.
    pub fn cutoff(mut names: Vec<String>, max_tables: usize) -> (Vec<String>, Vec<String>) {
        let unscanned = names.split_off(max_tables.min(names.len()));
        (names, unscanned)
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.unscanned.is_empty()
    }
}

/// Header line opening one connection's section of a snapshot.
pub fn connection_header(name: &str, db_type: impl Display, connection_id: i64) -> String {
    format!("{CONNECTION_PREFIX}{name} ({db_type}, connection_id={connection_id})\n\n")
}

/// Table names per connection, read back from a rendered snapshot.
///
/// Names are lowercased. Tables that only appear in a truncation note are
/// not included.
pub fn connection_tables(snapshot: &str) -> Vec<(i64, Vec<String>)> {
    let mut sections: Vec<(i64, Vec<String>)> = Vec::new();
    for line in snapshot.lines() {
        if let Some(header) = line.strip_prefix(CONNECTION_PREFIX) {
            let id = header
                .rsplit_once("connection_id=")
                .and_then(|(_, rest)| rest.trim_end_matches(')').trim().parse::<i64>().ok());
            if let Some(id) = id {
                sections.push((id, Vec::new()));
            }
        } else if let Some(table) = line.strip_prefix("### ") {
            if let Some((_, tables)) = sections.last_mut() {
                tables.push(table.trim().to_lowercase());
            }
        }
    }
    sections
}

fn escape_cell(value: &str) -> String {
    let clipped = match value.char_indices().nth(MAX_CELL_CHARS) {
        Some((end, _)) => format!("{}…", &value[..end]),
        None => value.to_string(),
    };
    clipped.replace('|', "\\|").replace(['\n', '\r'], " ")
}

fn columns_line(table: &TableSchema) -> String {
    let typed: Vec<String> = table
        .columns
        .iter()
        .map(|c| {
            if c.data_type.is_empty() {
                c.name.clone()
            } else {
                format!("{} ({})", c.name, c.data_type)
            }
        })
        .collect();
    format!("Columns: {}\n\n", typed.join(", "))
}

/// Render a table section without sample rows.
pub fn render_columns_only(table: &TableSchema) -> String {
    let mut out = format!("### {}\n\n", table.name);
    if table.columns.is_empty() {
        out.push_str("_No columns found._\n\n");
        return out;
    }
    out.push_str(&columns_line(table));
    out.push_str("_Sample rows omitted._\n\n");
    out
}

/// Render one table section.
pub fn render_table(table: &TableSchema) -> String {
    let mut out = format!("### {}\n\n", table.name);

    if table.columns.is_empty() {
        out.push_str("_No columns found._\n\n");
        return out;
    }

    out.push_str(&columns_line(table));

    let names: Vec<String> = table.columns.iter().map(|c| escape_cell(&c.name)).collect();
    out.push_str(&format!("| {} |\n", names.join(" | ")));
    out.push_str(&format!("| {} |\n", vec!["---"; names.len()].join(" | ")));

    if table.sample_rows.is_empty() {
        out.push_str("\n_No rows._\n\n");
        return out;
    }
    for row in &table.sample_rows {
        let cells: Vec<String> = row.iter().map(|v| escape_cell(v)).collect();
        out.push_str(&format!("| {} |\n", cells.join(" | ")));
    }
    out.push('\n');
    out
}

/// Render a bounded markdown snapshot of one scan.
///
/// A table whose full section would push the output past `max_bytes` is
/// rendered without sample rows; if even that does not fit it is left out.
/// Left-out and unscanned tables are named in a closing note.
pub fn render_markdown(scan: &SchemaScan, limits: &SchemaLimits) -> String {
    let mut out = String::new();
    let mut omitted: Vec<&str> = Vec::new();

    for (i, table) in scan.tables.iter().enumerate() {
        if i >= limits.max_tables {
            omitted.push(&table.name);
            continue;
        }
        let full = render_table(table);
        if out.len() + full.len() <= limits.max_bytes {
            out.push_str(&full);
            continue;
        }
        let columns = render_columns_only(table);
        if out.len() + columns.len() <= limits.max_bytes {
            out.push_str(&columns);
        } else {
            omitted.push(&table.name);
        }
    }
    omitted.extend(scan.unscanned.iter().map(String::as_str));

    if !omitted.is_empty() {
        let listed = omitted[..omitted.len().min(MAX_NOTED_TABLES)].join(", ");
        let rest = omitted.len().saturating_sub(MAX_NOTED_TABLES);
        let tail = if rest > 0 {
            format!(" and {rest} more")
        } else {
            String::new()
        };
        out.push_str(&format!(
            "_Schema truncated: {} more table(s) not shown: {listed}{tail}._\n",
            omitted.len()
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(name: &str, rows: usize) -> TableSchema {
        TableSchema {
            name: name.to_string(),
            columns: vec![
                ColumnInfo {
                    name: "id".into(),
                    data_type: "INTEGER".into(),
                },
                ColumnInfo {
                    name: "note".into(),
                    data_type: "TEXT".into(),
                },
            ],
            sample_rows: (0..rows)
                .map(|i| vec![i.to_string(), format!("a|b {i}")])
                .collect(),
        }
    }

    #[test]
    fn test_render_table_markdown() {
        let md = render_table(&table("leads", 2));
        assert!(md.starts_with("### leads\n"));
        assert!(md.contains("Columns: id (INTEGER), note (TEXT)"));
        assert!(md.contains("| id | note |\n| --- | --- |\n"));
        assert!(md.contains("| 0 | a\\|b 0 |"));
        assert!(md.contains("| 1 | a\\|b 1 |"));
    }

    #[test]
    fn test_render_empty_table() {
        let md = render_table(&table("empty", 0));
        assert!(md.contains("_No rows._"));
    }

    #[test]
    fn test_render_respects_max_tables() {
        let tables: Vec<TableSchema> = (0..5).map(|i| table(&format!("t{i}"), 1)).collect();
        let md = render_markdown(
            &SchemaScan {
                tables,
                unscanned: Vec::new(),
            },
            &SchemaLimits {
                sample_rows: 3,
                max_tables: 2,
                max_bytes: 100_000,
            },
        );
        assert!(md.contains("### t1"));
        assert!(!md.contains("### t2"));
        assert!(md.contains("3 more table(s) not shown: t2, t3, t4"));
    }

    #[test]
    fn test_render_respects_max_bytes() {
        let tables: Vec<TableSchema> = (0..20).map(|i| table(&format!("t{i}"), 3)).collect();
        let limits = SchemaLimits {
            sample_rows: 3,
            max_tables: 50,
            max_bytes: 400,
        };
        let md = render_markdown(
            &SchemaScan {
                tables,
                unscanned: Vec::new(),
            },
            &limits,
        );
        let body_end = md.find("_Schema truncated").unwrap();
        assert!(body_end <= limits.max_bytes);
        assert!(md.contains("### t0"));
    }

    #[test]
    fn test_long_cells_are_clipped() {
        let mut t = table("tickets", 0);
        t.sample_rows = vec![vec!["1".into(), "é".repeat(30_000)]];
        let md = render_table(&t);
        assert!(md.len() < 1_000);
        assert!(md.contains(&format!("| 1 | {}… |", "é".repeat(MAX_CELL_CHARS))));
    }

    #[test]
    fn test_oversized_table_keeps_its_columns() {
        let mut t = table("tickets", 0);
        t.sample_rows = vec![vec!["1".into(), "x".repeat(150)]; 3];
        let limits = SchemaLimits {
            sample_rows: 3,
            max_tables: 50,
            max_bytes: 120,
        };
        let md = render_markdown(
            &SchemaScan {
                tables: vec![t],
                unscanned: Vec::new(),
            },
            &limits,
        );
        assert!(md.starts_with("### tickets\n"));
        assert!(md.contains("Columns: id (INTEGER), note (TEXT)"));
        assert!(md.contains("_Sample rows omitted._"));
        assert!(!md.contains("_Schema truncated"));
    }

    #[test]
    fn test_truncation_note_is_bounded() {
        let scan = SchemaScan {
            tables: vec![table("shown", 1)],
            unscanned: (0..100).map(|i| format!("extra{i}")).collect(),
        };
        let md = render_markdown(&scan, &SchemaLimits::default());
        assert!(md.contains("### shown"));
        assert!(md.contains("100 more table(s) not shown: extra0, extra1"));
        assert!(md.contains("extra19 and 80 more._"));
        assert!(!md.contains("extra20"));
    }

    #[test]
    fn test_cutoff_splits_names() {
        let names: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let (scanned, unscanned) = SchemaScan::cutoff(names.clone(), 2);
        assert_eq!(scanned, vec!["a", "b"]);
        assert_eq!(unscanned, vec!["c"]);
        assert_eq!(SchemaScan::cutoff(names, 10).1.len(), 0);
    }

    #[test]
    fn test_connection_tables_reads_headers() {
        let snapshot = format!(
            "{}### leads\n\nColumns: id\n\n{}### Orders\n\n### public_notes\n\n\
             _Schema truncated: 1 more table(s) not shown: archive._\n",
            connection_header("crm", "sqlite", 3),
            connection_header("shop (eu)", "postgres", 7),
        );
        assert!(snapshot.starts_with("## Connection: crm (sqlite, connection_id=3)\n"));
        assert_eq!(
            connection_tables(&snapshot),
            vec![
                (3, vec!["leads".to_string()]),
                (7, vec!["orders".to_string(), "public_notes".to_string()]),
            ]
        );
    }
}
