//! Presentation of `Hap` records as human-readable text or JSON.
//!
//! Deliberately minimal: terminal rendering (colors, tables, panels) is a
//! pluggable concern this crate does not own, so this is padded-column text
//! and a small key/value panel, not a TUI. No color/table crate is introduced.

use std::collections::HashMap;

use serde::Serialize;
use serde_json::Value;

use crate::hap::Hap;

/// One row's worth of presentable fields, captured once per hap so JSON and
/// plain-text rendering agree on exactly what was read.
#[derive(Serialize)]
pub struct HapView {
    pub hid: String,
    pub name: String,
    pub restarts: u32,
    pub pid: Option<u32>,
    pub status: String,
    pub rc: Option<i32>,
    pub runtime_secs: Option<i64>,
    pub cmd: Option<String>,
    pub workdir: Option<String>,
    pub owner: String,
    pub accessible: bool,
    pub stdout_path: String,
    pub stderr_path: String,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    #[serde(skip)]
    pub start_time_human: Option<String>,
    #[serde(skip)]
    pub end_time_human: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
}

const HUMAN_DATETIME_FORMAT: &str = "%H:%M:%S %Y/%m/%d";

impl HapView {
    pub fn capture(hap: &Hap, verbose: bool) -> Self {
        let start = hap.start_time();
        let end = hap.end_time();
        HapView {
            hid: hap.hid().to_string(),
            name: hap.name(),
            restarts: hap.restarts(),
            pid: hap.pid(),
            status: hap.status().as_str().to_string(),
            rc: hap.rc(),
            runtime_secs: hap.runtime_secs(),
            cmd: hap.cmd(),
            workdir: hap.workdir().map(|p| p.display().to_string()),
            owner: hap.owner(),
            accessible: hap.accessible(),
            stdout_path: hap.stdout_path().display().to_string(),
            stderr_path: hap.stderr_path().display().to_string(),
            start_time: start.map(|t| t.to_rfc3339()),
            end_time: end.map(|t| t.to_rfc3339()),
            start_time_human: start.map(|t| t.format(HUMAN_DATETIME_FORMAT).to_string()),
            end_time_human: end.map(|t| t.format(HUMAN_DATETIME_FORMAT).to_string()),
            env: if verbose { hap.env() } else { None },
        }
    }

    fn raw_name(&self) -> String {
        if self.restarts > 0 {
            format!("{}@{}", self.name, self.restarts)
        } else {
            self.name.clone()
        }
    }
}

/// Print `No haps are currently running` (S1) or a padded-column listing.
pub fn print_list(views: &[HapView], verbose: bool) {
    if views.is_empty() {
        println!("No haps are currently running");
        return;
    }

    let mut header = vec!["#", "NAME", "PID"];
    if verbose {
        header.push("COMMAND");
        header.push("OWNER");
    }
    header.push("STATUS");
    header.push("RC");
    header.push("RUNTIME");

    let mut rows: Vec<Vec<String>> = Vec::with_capacity(views.len());
    for v in views {
        let mut row = vec![
            v.hid.clone(),
            v.raw_name(),
            v.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
        ];
        if verbose {
            row.push(truncate(v.cmd.as_deref().unwrap_or(""), 36));
            row.push(v.owner.clone());
        }
        row.push(v.status.clone());
        row.push(v.rc.map(|rc| rc.to_string()).unwrap_or_default());
        row.push(format_runtime(v.runtime_secs));
        rows.push(row);
    }

    print_table(&header, &rows);
}

/// Print a single hap's detail panel (`show`/`status <hap>`).
pub fn print_one(view: &HapView, verbose: bool) {
    println!("Hap #{} ({})", view.hid, view.raw_name());
    println!("  Status:      {}", view.status);
    println!("  PID:         {}", view.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()));
    if let Some(rc) = view.rc {
        println!("  Return code: {rc}");
    }
    if let Some(cmd) = &view.cmd {
        println!("  Command:     {cmd}");
    }
    println!("  Runtime:     {}", format_runtime(view.runtime_secs));

    if verbose {
        if let Some(workdir) = &view.workdir {
            println!("  Working dir: {workdir}");
        }
        println!("  Owner:       {}", view.owner);
        println!("  Stdout file: {}", view.stdout_path);
        println!("  Stderr file: {}", view.stderr_path);
        if let Some(start) = &view.start_time_human {
            println!("  Start time:  {start}");
        }
        if let Some(end) = &view.end_time_human {
            println!("  End time:    {end}");
        }
        if let Some(env) = &view.env {
            println!("  Environment ({} items):", env.len());
            let mut keys: Vec<&String> = env.keys().collect();
            keys.sort();
            for key in keys {
                println!("    {key}={}", env[key]);
            }
        }
    }
}

/// JSON for the list view: an array of objects, fields emitted directly,
/// no wrapping envelope.
pub fn print_list_json(views: &[HapView]) {
    let value: Value = serde_json::to_value(views).unwrap_or(Value::Array(vec![]));
    println!("{value}");
}

/// JSON for the single-hap view: one object.
pub fn print_one_json(view: &HapView) {
    let value = serde_json::to_value(view).unwrap_or(Value::Null);
    println!("{value}");
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let truncated: String = s.chars().take(max.saturating_sub(1)).collect();
    format!("{truncated}\u{2026}")
}

/// Duration formatting is a small local helper, not a humanizer dependency.
fn format_runtime(secs: Option<i64>) -> String {
    let Some(secs) = secs else {
        return "a moment".to_string();
    };
    let secs = secs.max(0);
    if secs < 60 {
        return format!("{secs}s");
    }
    let minutes = secs / 60;
    if minutes < 60 {
        return format!("{minutes}m {}s", secs % 60);
    }
    let hours = minutes / 60;
    if hours < 24 {
        return format!("{hours}h {}m", minutes % 60);
    }
    let days = hours / 24;
    format!("{days}d {}h", hours % 24)
}

fn print_table(header: &[&str], rows: &[Vec<String>]) {
    let cols = header.len();
    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in rows {
        for (i, cell) in row.iter().enumerate().take(cols) {
            widths[i] = widths[i].max(cell.chars().count());
        }
    }

    let header_line: Vec<String> = header
        .iter()
        .enumerate()
        .map(|(i, h)| format!("{:width$}", h, width = widths[i]))
        .collect();
    println!("{}", header_line.join("  "));

    for row in rows {
        let line: Vec<String> = row
            .iter()
            .enumerate()
            .map(|(i, cell)| format!("{:width$}", cell, width = widths[i]))
            .collect();
        println!("{}", line.join("  "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_leaves_short_strings_alone() {
        assert_eq!(truncate("short", 36), "short");
    }

    #[test]
    fn truncate_ellipsizes_long_strings() {
        let long = "x".repeat(50);
        let truncated = truncate(&long, 36);
        assert_eq!(truncated.chars().count(), 36);
        assert!(truncated.ends_with('\u{2026}'));
    }

    #[test]
    fn format_runtime_buckets() {
        assert_eq!(format_runtime(None), "a moment");
        assert_eq!(format_runtime(Some(5)), "5s");
        assert_eq!(format_runtime(Some(65)), "1m 5s");
        assert_eq!(format_runtime(Some(3700)), "1h 1m");
    }
}
