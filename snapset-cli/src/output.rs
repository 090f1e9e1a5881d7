//! Rendering of command results as tables or JSON on stdout.

use std::io::{self, Write};

use serde::Serialize;
use snapset_core::inspect::CacheReport;
use snapset_core::{ManifestEntry, Presence, SetReport, StepRecord, Verdict};

use crate::cli::OutputFormat;

/// Lower-case wire name of a serializable enum.
fn label<T: Serialize>(value: &T) -> String {
    match serde_json::to_value(value) {
        Ok(serde_json::Value::String(s)) => s,
        _ => "-".to_string(),
    }
}

fn json<W: Write, T: Serialize + ?Sized>(out: &mut W, value: &T) -> io::Result<()> {
    serde_json::to_writer_pretty(&mut *out, value)?;
    writeln!(out)
}

/// Column-aligned rows; the last column is never padded.
struct Table {
    header: Vec<&'static str>,
    rows: Vec<Vec<String>>,
}

impl Table {
    fn new(header: &[&'static str]) -> Self {
        Self {
            header: header.to_vec(),
            rows: Vec::new(),
        }
    }

    fn row(&mut self, cells: Vec<String>) {
        self.rows.push(cells);
    }

    fn write<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let mut widths: Vec<usize> = self.header.iter().map(|h| h.len()).collect();
        for row in &self.rows {
            for (i, cell) in row.iter().enumerate() {
                widths[i] = widths[i].max(cell.len());
            }
        }

        let header: Vec<String> = self.header.iter().map(|h| h.to_string()).collect();
        for cells in std::iter::once(&header).chain(&self.rows) {
            let last = cells.len().saturating_sub(1);
            let mut line = String::new();
            for (i, cell) in cells.iter().enumerate() {
                if i == last {
                    line.push_str(cell);
                } else {
                    line.push_str(&format!("{:<width$}  ", cell, width = widths[i]));
                }
            }
            writeln!(out, "{}", line.trim_end())?;
        }
        Ok(())
    }
}

pub fn manifest<W: Write>(out: &mut W, format: OutputFormat, entries: &[ManifestEntry]) -> io::Result<()> {
    if format == OutputFormat::Json {
        return json(out, entries);
    }
    let mut table = Table::new(&["TIER", "RESOURCE", "SNAPSHOT", "LOCATION"]);
    for e in entries {
        table.row(vec![
            e.tier.to_string(),
            e.resource.clone(),
            e.snap_name.clone(),
            e.location.clone(),
        ]);
    }
    table.write(out)?;
    writeln!(out, "{} snapshot(s) in set", entries.len())
}

pub fn steps<W: Write>(out: &mut W, format: OutputFormat, steps: &[StepRecord]) -> io::Result<()> {
    if format == OutputFormat::Json {
        return json(out, steps);
    }
    let mut table = Table::new(&["STEP", "ACTION", "TIER", "RESOURCE", "OUTCOME", "ATTEMPTS", "ELAPSED"]);
    for s in steps {
        let outcome = match (&s.outcome, &s.error) {
            (Some(outcome), _) => label(outcome),
            (None, Some(_)) => "failed".to_string(),
            (None, None) => "-".to_string(),
        };
        table.row(vec![
            s.id.to_string(),
            s.action.to_string(),
            s.tier.to_string(),
            s.resource.clone(),
            outcome,
            s.attempts.to_string(),
            format!("{}ms", s.elapsed_ms),
        ]);
    }
    table.write(out)
}

/// Steps of a restore that stopped, and the filesystems it left offline.
pub fn restore_failure<W: Write>(
    out: &mut W,
    format: OutputFormat,
    records: &[StepRecord],
    offline: &[String],
) -> io::Result<()> {
    if format == OutputFormat::Json {
        return json(
            out,
            &serde_json::json!({
                "steps": records,
                "offline_filesystems": offline,
            }),
        );
    }
    steps(out, format, records)?;
    if offline.is_empty() {
        return Ok(());
    }
    writeln!(out)?;
    writeln!(
        out,
        "Filesystems left offline, bring them online and re-apply their exports:"
    )?;
    for fs in offline {
        writeln!(out, "  {}", fs)?;
    }
    Ok(())
}

#[derive(Debug, Default, PartialEq, Eq)]
struct Counts {
    present: usize,
    missing: usize,
    orphans: usize,
    invalid: usize,
}

fn counts(report: &SetReport) -> Counts {
    let mut counts = Counts::default();
    for e in &report.entries {
        match e.presence {
            Presence::Present => counts.present += 1,
            Presence::Absent => counts.missing += 1,
            Presence::Orphan => counts.orphans += 1,
        }
        if e.presence != Presence::Absent && !e.valid {
            counts.invalid += 1;
        }
    }
    counts
}

fn cache_usage(cache: &CacheReport) -> String {
    match cache.used_percent {
        Some(pct) => format!("{:.1}%", pct),
        None => "absent".to_string(),
    }
}

/// Expected against actual: one row per set, or with `detailed` one row per
/// snapshot followed by the set's rollback caches.
pub fn reports<W: Write>(
    out: &mut W,
    format: OutputFormat,
    reports: &[SetReport],
    detailed: bool,
) -> io::Result<()> {
    if format == OutputFormat::Json {
        return json(out, reports);
    }
    if reports.is_empty() {
        return writeln!(out, "No snapshot sets found");
    }

    if !detailed {
        let mut table = Table::new(&[
            "SET", "STATE", "CREATED", "AUTHORITATIVE", "PRESENT", "MISSING", "ORPHAN", "INVALID",
        ]);
        for report in reports {
            let c = counts(report);
            table.row(vec![
                report.set.to_string(),
                report.state.as_ref().map(label).unwrap_or_else(|| "unrecorded".to_string()),
                report
                    .created_at
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_else(|| "-".to_string()),
                report.authoritative.to_string(),
                c.present.to_string(),
                c.missing.to_string(),
                c.orphans.to_string(),
                c.invalid.to_string(),
            ]);
        }
        return table.write(out);
    }

    for (i, report) in reports.iter().enumerate() {
        if i > 0 {
            writeln!(out)?;
        }
        writeln!(
            out,
            "Set {} ({}, authoritative {})",
            report.set,
            report.state.as_ref().map(label).unwrap_or_else(|| "unrecorded".to_string()),
            report.authoritative
        )?;
        let mut table = Table::new(&["TIER", "RESOURCE", "SNAPSHOT", "LOCATION", "STATUS"]);
        for e in &report.entries {
            let mut status = label(&e.presence);
            if e.presence != Presence::Absent && !e.valid {
                status.push_str(" (invalid)");
            }
            table.row(vec![
                e.tier.to_string(),
                e.resource.clone(),
                e.snap_name.clone(),
                e.location.clone(),
                status,
            ]);
        }
        table.write(out)?;

        if !report.caches.is_empty() {
            let mut caches = Table::new(&["POOL", "CACHE", "USED"]);
            for cache in &report.caches {
                caches.row(vec![cache.pool.clone(), cache.name.clone(), cache_usage(cache)]);
            }
            caches.write(out)?;
        }
    }
    Ok(())
}

pub fn verdict<W: Write>(out: &mut W, format: OutputFormat, verdict: &Verdict) -> io::Result<()> {
    if format == OutputFormat::Json {
        return json(out, verdict);
    }
    if verdict.passed {
        return writeln!(out, "Validation passed");
    }
    writeln!(out, "Validation failed, {} offender(s)", verdict.offenders.len())?;
    let mut table = Table::new(&["KIND", "RESOURCE", "MESSAGE"]);
    for o in &verdict.offenders {
        table.row(vec![o.kind.to_string(), o.resource.clone(), o.message.clone()]);
    }
    table.write(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use snapset_core::inspect::{Entry, Offense};
    use snapset_core::model::DatabaseKind;
    use snapset_core::plan::Tier;
    use snapset_core::{ErrorKind, SetName, SetState};

    fn render<F: FnOnce(&mut Vec<u8>) -> io::Result<()>>(f: F) -> String {
        let mut buf = Vec::new();
        f(&mut buf).unwrap();
        String::from_utf8(buf).unwrap()
    }

    fn entry(tier: Tier, resource: &str, presence: Presence, valid: bool) -> Entry {
        Entry {
            tier,
            resource: resource.to_string(),
            snap_name: format!("s1_{}", resource),
            location: "array1".to_string(),
            presence,
            valid,
        }
    }

    fn report() -> SetReport {
        SetReport {
            set: SetName::new("s1").unwrap(),
            created_at: Some(chrono::Utc.with_ymd_and_hms(2026, 3, 1, 2, 30, 0).unwrap()),
            state: Some(SetState::Complete),
            authoritative: DatabaseKind::Graph,
            entries: vec![
                entry(Tier::San, "42", Presence::Present, true),
                entry(Tier::San, "43", Presence::Absent, true),
                entry(Tier::Volume, "db1:vg_root/lv_var", Presence::Present, false),
            ],
            caches: vec![CacheReport {
                pool: "pool1".to_string(),
                name: "pool1-cache".to_string(),
                used_percent: Some(12.5),
            }],
        }
    }

    #[test]
    fn test_table_alignment() {
        let mut table = Table::new(&["A", "BB"]);
        table.row(vec!["long".to_string(), "x".to_string()]);
        let text = render(|out| table.write(out));
        assert_eq!(text, "A     BB\nlong  x\n");
    }

    #[test]
    fn test_summary_counts() {
        let text = render(|out| reports(out, OutputFormat::Table, &[report()], false));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].starts_with("s1"));
        assert!(lines[1].contains("complete"));
        assert!(lines[1].contains("2026-03-01 02:30:00"));
        assert_eq!(
            counts(&report()),
            Counts {
                present: 2,
                missing: 1,
                orphans: 0,
                invalid: 1,
            }
        );
    }

    #[test]
    fn test_detailed_lists_every_snapshot() {
        let text = render(|out| reports(out, OutputFormat::Table, &[report()], true));
        assert!(text.starts_with("Set s1 (complete, authoritative"));
        assert!(text.contains("s1_43"));
        assert!(text.contains("absent"));
        assert!(text.contains("present (invalid)"));
        assert!(text.contains("pool1-cache"));
        assert!(text.contains("12.5%"));
    }

    #[test]
    fn test_no_sets() {
        let text = render(|out| reports(out, OutputFormat::Table, &[], false));
        assert_eq!(text, "No snapshot sets found\n");
    }

    #[test]
    fn test_json_reports() {
        let text = render(|out| reports(out, OutputFormat::Json, &[report()], false));
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value[0]["set"], "s1");
        assert_eq!(value[0]["entries"][1]["presence"], "absent");
    }

    #[test]
    fn test_failed_verdict() {
        let verdict_value = Verdict {
            passed: false,
            offenders: vec![Offense {
                kind: ErrorKind::MissingExpected,
                resource: "43".to_string(),
                message: "s1_43 not found".to_string(),
            }],
        };
        let text = render(|out| verdict(out, OutputFormat::Table, &verdict_value));
        assert!(text.starts_with("Validation failed, 1 offender(s)"));
        assert!(text.contains("s1_43 not found"));
    }

    #[test]
    fn test_manifest_table() {
        let entries = vec![ManifestEntry {
            tier: Tier::Nas,
            resource: "pool1-data".to_string(),
            snap_name: "s1-pool1-data".to_string(),
            location: "nas1".to_string(),
        }];
        let text = render(|out| manifest(out, OutputFormat::Table, &entries));
        assert!(text.contains("s1-pool1-data"));
        assert!(text.ends_with("1 snapshot(s) in set\n"));
    }

    fn failed_restore_step() -> StepRecord {
        StepRecord {
            id: 6,
            action: "fs-restore",
            resource: "pool2-fs1".to_string(),
            tier: Tier::Nas,
            outcome: None,
            attempts: 1,
            elapsed_ms: 40,
            error: Some("Vendor error on pool2-fs1: rollback failed".to_string()),
        }
    }

    #[test]
    fn test_restore_failure_lists_offline_filesystems() {
        let offline = vec!["pool2-fs1".to_string(), "pool2-fs2".to_string()];
        let text = render(|out| {
            restore_failure(out, OutputFormat::Table, &[failed_restore_step()], &offline)
        });
        assert!(text.contains("fs-restore"));
        assert!(text.contains("failed"));
        assert!(text.contains("Filesystems left offline"));
        assert!(text.ends_with("  pool2-fs1\n  pool2-fs2\n"));
    }

    #[test]
    fn test_restore_failure_json() {
        let offline = vec!["pool2-fs1".to_string()];
        let text = render(|out| {
            restore_failure(out, OutputFormat::Json, &[failed_restore_step()], &offline)
        });
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["offline_filesystems"][0], "pool2-fs1");
        assert_eq!(value["steps"][0]["action"], "fs-restore");
    }
}
