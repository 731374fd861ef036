//! Rendering of `recover` results: metrics records and the exec list, as
//! aligned text or pretty JSON on stdout.

use recovery_core::exec::ExecRegistry;
use recovery_core::metrics::Action;
use serde::Serialize;
use std::fmt;
use std::io::Write;

/// Widest failure reason shown in the records table.
const REASON_WIDTH: usize = 72;

pub fn emit_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    let mut out = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut out, value)?;
    writeln!(out)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

/// Left-aligned columns two spaces apart, with a dashed rule under the
/// header. Padding after the last cell is dropped.
pub struct Table {
    headers: &'static [&'static str],
    rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(headers: &'static [&'static str]) -> Self {
        Self {
            headers,
            rows: Vec::new(),
        }
    }

    /// Cells beyond the header count are ignored; missing cells are blank.
    pub fn push(&mut self, mut cells: Vec<String>) {
        cells.resize(self.headers.len(), String::new());
        self.rows.push(cells);
    }

    fn widths(&self) -> Vec<usize> {
        let mut widths: Vec<usize> = self.headers.iter().map(|h| h.chars().count()).collect();
        for row in &self.rows {
            for (width, cell) in widths.iter_mut().zip(row) {
                *width = (*width).max(cell.chars().count());
            }
        }
        widths
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let widths = self.widths();
        let rule: Vec<String> = widths.iter().map(|w| "-".repeat(*w)).collect();
        write_line(f, &widths, self.headers.iter().copied())?;
        write_line(f, &widths, rule.iter().map(String::as_str))?;
        for row in &self.rows {
            write_line(f, &widths, row.iter().map(String::as_str))?;
        }
        Ok(())
    }
}

fn write_line<'a>(
    f: &mut fmt::Formatter<'_>,
    widths: &[usize],
    cells: impl Iterator<Item = &'a str>,
) -> fmt::Result {
    let mut line = String::new();
    for (i, (cell, width)) in cells.zip(widths).enumerate() {
        if i > 0 {
            line.push_str("  ");
        }
        line.push_str(cell);
        let pad = width.saturating_sub(cell.chars().count());
        line.extend(std::iter::repeat(' ').take(pad));
    }
    writeln!(f, "{}", line.trim_end())
}

// ---------------------------------------------------------------------------
// Metrics records
// ---------------------------------------------------------------------------

pub fn records_table(records: &[Action]) -> Table {
    let mut table = Table::new(&["KIND", "STATUS", "TOOK", "REASON"]);
    for record in records {
        table.push(vec![
            record.kind.clone(),
            record.status.as_str().to_string(),
            took(record),
            short_reason(&record.fail_reason),
        ]);
    }
    table
}

/// Wall time of a closed record, `-` while it is still open.
fn took(record: &Action) -> String {
    match (record.start_time, record.stop_time) {
        (Some(start), Some(stop)) => {
            let ms = (stop - start).num_milliseconds().max(0);
            format!("{}.{}s", ms / 1000, (ms % 1000) / 100)
        }
        _ => "-".to_string(),
    }
}

/// First line of a failure reason, cut to fit the column.
fn short_reason(reason: &str) -> String {
    let first = reason.lines().next().unwrap_or_default();
    if first.chars().count() <= REASON_WIDTH {
        return first.to_string();
    }
    let cut: String = first.chars().take(REASON_WIDTH - 3).collect();
    format!("{cut}...")
}

// ---------------------------------------------------------------------------
// Execs
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
pub struct ExecEntry<'a> {
    pub name: &'a str,
    pub description: &'a str,
}

pub fn exec_entries(registry: &ExecRegistry) -> Vec<ExecEntry<'_>> {
    registry
        .iter()
        .map(|e| ExecEntry {
            name: e.name(),
            description: e.description(),
        })
        .collect()
}

pub fn execs_table(entries: &[ExecEntry<'_>]) -> Table {
    let mut table = Table::new(&["NAME", "DESCRIPTION"]);
    for entry in entries {
        table.push(vec![entry.name.to_string(), entry.description.to_string()]);
    }
    table
}
