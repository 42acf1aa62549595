//! Output rendering for the CLI: tables for humans, JSON for tooling.
//!
//! JSON listings honor the "always produce a file" contract: when a
//! listing fails and `--output-file` was given, an empty array is written
//! so downstream tooling always finds the file.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL_CONDENSED, ContentArrangement, Table};
use serde::Serialize;

use coldctr::{Container, Content, Drift, Image, SnapshotKeyInfo, Task};

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// One JSON document for the whole result.
    Json,
    /// One JSON document per line, one record each.
    #[value(name = "json_line")]
    JsonLine,
}

/// Create a styled table with consistent formatting.
pub fn create_styled_table(header: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header.to_vec());
    table
}

/// Format an optional timestamp for table cells.
pub fn format_time(t: Option<DateTime<Utc>>) -> String {
    t.map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_default()
}

/// Emit a serializable slice in the requested format, writing to
/// `output_file` instead of stdout when given.
pub fn output_records<T: Serialize>(
    records: &[T],
    format: OutputFormat,
    output_file: Option<&Path>,
    render_table: impl FnOnce(&[T]) -> Table,
) -> Result<()> {
    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string(records).context("serializing records")?;
            match output_file {
                Some(path) => write_output_file(path, &json)?,
                None => println!("{json}"),
            }
        }
        OutputFormat::JsonLine => {
            let mut lines = String::new();
            for record in records {
                lines.push_str(&serde_json::to_string(record).context("serializing record")?);
                lines.push('\n');
            }
            match output_file {
                Some(path) => write_output_file(path, &lines)?,
                None => print!("{lines}"),
            }
        }
        OutputFormat::Table => {
            println!("{}", render_table(records));
        }
    }
    Ok(())
}

/// Emit an empty JSON array so downstream tooling always finds well-formed
/// output, even when the listing failed.
pub fn write_empty_json(output_file: Option<&Path>) {
    match output_file {
        Some(path) => {
            if let Err(e) = write_output_file(path, "[]") {
                tracing::error!(path = %path.display(), error = %e, "writing empty output file");
            }
        }
        None => println!("[]"),
    }
}

fn write_output_file(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content)
        .with_context(|| format!("writing output file {}", path.display()))
}

pub fn namespaces_table(namespaces: &[String]) -> Table {
    let mut table = create_styled_table(&["NAMESPACE"]);
    for ns in namespaces {
        table.add_row(vec![ns.clone()]);
    }
    table
}

pub fn containers_table(containers: &[Container]) -> Table {
    let mut table = create_styled_table(&[
        "NAMESPACE",
        "CONTAINER ID",
        "HOSTNAME",
        "IMAGE",
        "CREATED",
        "PID",
        "STATUS",
        "TYPE",
    ]);
    for c in containers {
        table.add_row(vec![
            c.namespace.clone(),
            c.id.clone(),
            c.hostname.clone(),
            c.image.clone(),
            format_time(c.created_at),
            c.process_id.map(|p| p.to_string()).unwrap_or_default(),
            c.status.to_string(),
            c.container_type.to_string(),
        ]);
    }
    table
}

pub fn images_table(images: &[Image]) -> Table {
    let mut table = create_styled_table(&["NAMESPACE", "NAME", "DIGEST", "CREATED", "SUPPORT"]);
    for i in images {
        table.add_row(vec![
            i.namespace.clone(),
            i.name.clone(),
            i.digest.clone(),
            format_time(i.created_at),
            i.support_container_image.to_string(),
        ]);
    }
    table
}

pub fn content_table(content: &[Content]) -> Table {
    let mut table = create_styled_table(&["NAMESPACE", "DIGEST", "SIZE", "CREATED"]);
    for c in content {
        table.add_row(vec![
            c.namespace.clone(),
            c.digest.clone(),
            c.size.to_string(),
            format_time(c.created_at),
        ]);
    }
    table
}

pub fn snapshots_table(snapshots: &[SnapshotKeyInfo]) -> Table {
    let mut table = create_styled_table(&[
        "NAMESPACE",
        "SNAPSHOTTER",
        "KEY",
        "ID",
        "KIND",
        "PARENT",
        "OVERLAY PATH",
    ]);
    for s in snapshots {
        table.add_row(vec![
            s.namespace.clone(),
            s.snapshotter.clone(),
            s.key.clone(),
            s.id.to_string(),
            s.kind.to_string(),
            s.parent.clone(),
            s.overlay_path.clone(),
        ]);
    }
    table
}

pub fn tasks_table(tasks: &[Task]) -> Table {
    let mut table = create_styled_table(&["NAMESPACE", "NAME", "PID", "TYPE", "STATUS"]);
    for t in tasks {
        table.add_row(vec![
            t.namespace.clone(),
            t.name.clone(),
            t.pid.map(|p| p.to_string()).unwrap_or_default(),
            t.container_type.to_string(),
            t.status.to_string(),
        ]);
    }
    table
}

pub fn drift_table(drifts: &[Drift]) -> Table {
    let mut table = create_styled_table(&["CONTAINER ID", "ADDED/MODIFIED", "DELETED"]);
    for d in drifts {
        let added: Vec<&str> = d
            .added_or_modified
            .iter()
            .map(|f| f.full_path.as_str())
            .collect();
        let deleted: Vec<&str> = d
            .inaccessible_files
            .iter()
            .map(|f| f.full_path.as_str())
            .collect();
        table.add_row(vec![
            d.container_id.clone(),
            added.join(", "),
            deleted.join(", "),
        ]);
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_formatting() {
        assert_eq!(format_time(None), "");
        let t = DateTime::parse_from_rfc3339("2023-05-01T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(format_time(Some(t)), "2023-05-01T10:00:00Z");
    }

    #[test]
    fn namespace_table_renders() {
        let table = namespaces_table(&["default".to_string(), "k8s.io".to_string()]);
        let rendered = table.to_string();
        assert!(rendered.contains("default"));
        assert!(rendered.contains("k8s.io"));
    }
}
