//! Human and machine renderings of snapshots, reports and checkpoints

use anyhow::Result;
use clap::ValueEnum;
use sluice::prelude::{Checkpoint, RunReport, SchemaSnapshot, TableStatus};

/// Output format for `discover`
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SnapshotFormat {
    /// Indented table and column listing
    Table,
    /// Snapshot as JSON
    Json,
    /// Snapshot as YAML
    Yaml,
    /// One row per column
    Csv,
}

/// Output format for run reports and checkpoint listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    /// Aligned columns
    Table,
    /// JSON
    Json,
}

const CSV_HEADER: &[&str] = &[
    "qualified_name",
    "column",
    "native_type",
    "logical_type",
    "position",
    "default",
    "pk_position",
    "incremental_key",
    "nullable",
    "length",
    "precision",
    "scale",
];

pub fn snapshot(snapshot: &SchemaSnapshot, format: SnapshotFormat) -> Result<String> {
    Ok(match format {
        SnapshotFormat::Json => serde_json::to_string_pretty(snapshot)? + "\n",
        SnapshotFormat::Yaml => serde_yaml::to_string(snapshot)?,
        SnapshotFormat::Csv => snapshot_csv(snapshot),
        SnapshotFormat::Table => snapshot_table(snapshot),
    })
}

fn snapshot_table(snapshot: &SchemaSnapshot) -> String {
    let mut out = format!("Found {} tables:\n\n", snapshot.tables().len());
    for table in snapshot.tables() {
        let estimate = table
            .estimated_rows
            .map(|r| format!("~{} rows", r))
            .unwrap_or_else(|| "unknown size".to_string());
        let key = table.incremental_key.as_deref().unwrap_or("-");
        out.push_str(&format!(
            "  {} ({}, incremental key: {})\n",
            table.id.qualified_name(),
            estimate,
            key
        ));
        for col in &table.columns {
            let mut flags = Vec::new();
            if col.primary_key_ordinal.is_some() {
                flags.push("pk");
            }
            if !col.nullable {
                flags.push("not null");
            }
            if col.auto_increment {
                flags.push("auto");
            }
            let flags = if flags.is_empty() {
                String::new()
            } else {
                format!(" [{}]", flags.join(", "))
            };
            out.push_str(&format!(
                "    - {} {} ({}){}\n",
                col.name, col.native_type, col.logical_type, flags
            ));
        }
        out.push('\n');
    }
    out
}

fn snapshot_csv(snapshot: &SchemaSnapshot) -> String {
    let mut out = csv_line(CSV_HEADER.iter().map(|h| h.to_string()));
    for table in snapshot.tables() {
        for col in &table.columns {
            let is_key = table.incremental_key.as_deref() == Some(col.name.as_str());
            out.push_str(&csv_line([
                table.id.qualified_name(),
                col.name.clone(),
                col.native_type.clone(),
                col.logical_type.to_string(),
                col.ordinal.to_string(),
                col.default_value.clone().unwrap_or_default(),
                opt(col.primary_key_ordinal),
                is_key.to_string(),
                col.nullable.to_string(),
                opt(col.max_length),
                opt(col.precision),
                opt(col.scale),
            ]));
        }
    }
    out
}

fn opt(value: Option<u32>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn csv_line(fields: impl IntoIterator<Item = String>) -> String {
    let mut line = fields
        .into_iter()
        .map(|f| csv_field(&f))
        .collect::<Vec<_>>()
        .join(",");
    line.push('\n');
    line
}

fn csv_field(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

pub fn run_report(report: &RunReport, format: ReportFormat) -> Result<String> {
    if format == ReportFormat::Json {
        return Ok(serde_json::to_string_pretty(report)? + "\n");
    }

    let rows: Vec<[String; 6]> = report
        .tables
        .iter()
        .map(|t| {
            [
                t.table.qualified_name(),
                t.mode.to_string(),
                t.status.to_string(),
                t.rows.to_string(),
                t.batches.to_string(),
                t.final_watermark
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();
    let mut out = aligned(
        ["TABLE", "MODE", "STATUS", "ROWS", "BATCHES", "WATERMARK"],
        &rows,
    );

    for t in &report.tables {
        if let TableStatus::Failed { message, .. } = &t.status {
            out.push_str(&format!("\n{}: {}", t.table, message));
        }
    }
    out.push_str(&format!(
        "\nrun {}: {} tables, {} rows, {} failed, {} invalidated, {} orphaned\n",
        report.run_id,
        report.tables.len(),
        report.total_rows(),
        report.failed().count(),
        report.invalidated.len(),
        report.orphaned.len()
    ));
    Ok(out)
}

pub fn checkpoints(list: &[Checkpoint], format: ReportFormat) -> Result<String> {
    if format == ReportFormat::Json {
        return Ok(serde_json::to_string_pretty(list)? + "\n");
    }
    if list.is_empty() {
        return Ok("No checkpoints stored\n".to_string());
    }
    let rows: Vec<[String; 6]> = list
        .iter()
        .map(|cp| {
            [
                cp.table.qualified_name(),
                cp.watermark_column.clone(),
                cp.watermark.to_string(),
                cp.status.to_string(),
                cp.sequence.to_string(),
                cp.last_updated_at.to_rfc3339(),
            ]
        })
        .collect();
    Ok(aligned(
        ["TABLE", "COLUMN", "WATERMARK", "STATUS", "SEQ", "UPDATED"],
        &rows,
    ))
}

fn aligned<const N: usize>(header: [&str; N], rows: &[[String; N]]) -> String {
    let mut widths = header.map(str::len);
    for row in rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.len());
        }
    }
    let line = |cells: Vec<&str>| {
        let mut s = cells
            .iter()
            .zip(widths)
            .map(|(c, w)| format!("{:<w$}", c, w = w))
            .collect::<Vec<_>>()
            .join("  ");
        s.truncate(s.trim_end().len());
        s.push('\n');
        s
    };

    let mut out = line(header.to_vec());
    for row in rows {
        out.push_str(&line(row.iter().map(String::as_str).collect()));
    }
    out
}
