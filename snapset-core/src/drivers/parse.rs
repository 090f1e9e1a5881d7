//! Parsers for vendor CLI output.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

pub type Record = BTreeMap<String, String>;

static NVP_INDEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*\d+:\s+(.*)$").expect("static regex"));

static SIZE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([0-9]+(?:\.[0-9]+)?)\s*([KMGTP])?B?$").expect("static regex"));

/// Blank-line separated blocks of `Key:  value` lines.
///
/// A line without a colon is keyed on everything up to its last word, so
/// `LOGICAL UNIT NUMBER 12` becomes `LOGICAL UNIT NUMBER = 12`.
pub fn colon_blocks(text: &str) -> Vec<Record> {
    let mut blocks = Vec::new();
    let mut current = Record::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            if !current.is_empty() {
                blocks.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some((key, value)) = line.split_once(':') {
            current.insert(key.trim().to_string(), value.trim().to_string());
        } else if let Some((key, value)) = line.rsplit_once(char::is_whitespace) {
            current.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    if !current.is_empty() {
        blocks.push(current);
    }
    blocks
}

/// `-output nvp` records: each record opens with `N:` and lists `Key = value`.
pub fn nvp_records(text: &str) -> Vec<Record> {
    let mut records = Vec::new();
    let mut current: Option<Record> = None;
    for line in text.lines() {
        let body = match NVP_INDEX.captures(line) {
            Some(caps) => {
                if let Some(done) = current.take() {
                    records.push(done);
                }
                current = Some(Record::new());
                caps.get(1).map_or("", |m| m.as_str())
            }
            None => line,
        };
        if let (Some(record), Some((key, value))) = (current.as_mut(), body.split_once(" = ")) {
            record.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    records.extend(current);
    records
}

/// Column table whose header names start at fixed offsets.
///
/// Header columns are separated by two or more spaces, so `NFS SHARED` is a
/// single column. Ruler lines made of `=` or `-` are skipped. Each value is
/// the text between its column's offset and the next one.
pub fn column_table(text: &str) -> Vec<Record> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header = match lines.next() {
        Some(h) => h,
        None => return Vec::new(),
    };
    let columns = header_columns(header);
    if columns.is_empty() {
        return Vec::new();
    }

    lines
        .filter(|l| !l.trim().chars().all(|c| c == '=' || c == '-' || c == ' '))
        .map(|line| {
            let mut record = Record::new();
            for (i, (start, name)) in columns.iter().enumerate() {
                let end = columns.get(i + 1).map(|(s, _)| *s).unwrap_or(usize::MAX);
                record.insert(name.clone(), slice_column(line, *start, end));
            }
            record
        })
        .collect()
}

fn header_columns(header: &str) -> Vec<(usize, String)> {
    let mut columns = Vec::new();
    let mut start: Option<usize> = None;
    let mut gap = 0;
    for (i, c) in header.char_indices() {
        if c == ' ' {
            gap += 1;
            continue;
        }
        match start {
            None => start = Some(i),
            Some(s) if gap >= 2 => {
                columns.push((s, header[s..i].trim().to_string()));
                start = Some(i);
            }
            Some(_) => {}
        }
        gap = 0;
    }
    if let Some(s) = start {
        columns.push((s, header[s..].trim().to_string()));
    }
    columns
}

fn slice_column(line: &str, start: usize, end: usize) -> String {
    if start >= line.len() {
        return String::new();
    }
    let end = end.min(line.len());
    line.get(start..end).unwrap_or("").trim().to_string()
}

/// A size such as `10.00G`, `512M` or `1.5T` in MiB, rounded up.
pub fn size_to_mb(size: &str) -> Option<u64> {
    let caps = SIZE.captures(size.trim())?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let mb = match caps.get(2).map(|m| m.as_str()) {
        Some("K") => value / 1024.0,
        Some("M") | None => value,
        Some("G") => value * 1024.0,
        Some("T") => value * 1024.0 * 1024.0,
        Some("P") => value * 1024.0 * 1024.0 * 1024.0,
        Some(_) => return None,
    };
    Some(mb.ceil() as u64)
}

/// A percentage such as `40%`, `40.000` or `(40)`.
pub fn percent(value: &str) -> Option<f64> {
    value
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .trim_end_matches('%')
        .trim()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_colon_blocks() {
        let text = "\
LOGICAL UNIT NUMBER 12
Name:  neo4jlun
User Capacity (GBs):  100.000

LOGICAL UNIT NUMBER 13
Name:  mysql
Creation time:  01/02/2024 10:00:00
";
        let blocks = colon_blocks(text);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0]["LOGICAL UNIT NUMBER"], "12");
        assert_eq!(blocks[0]["Name"], "neo4jlun");
        assert_eq!(blocks[1]["Creation time"], "01/02/2024 10:00:00");
    }

    #[test]
    fn test_nvp_records() {
        let text = "\
1:    ID   = sv_1
      Name = neo4jlun
      Size = 107374182400 (100.0G)

2:    ID   = sv_2
      Name = mysql
";
        let records = nvp_records(text);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["ID"], "sv_1");
        assert_eq!(records[0]["Size"], "107374182400 (100.0G)");
        assert_eq!(records[1]["Name"], "mysql");
    }

    #[test]
    fn test_column_table() {
        let text = "\
FS              STATUS    SIZE     NFS SHARED  POOL LIST
==============  ======    ====     ==========  =========
enm1-data       online    10.00G   yes         enm1
enm1-home       offline   100M     no          enm1
";
        let rows = column_table(text);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["FS"], "enm1-data");
        assert_eq!(rows[0]["NFS SHARED"], "yes");
        assert_eq!(rows[1]["STATUS"], "offline");
        assert_eq!(rows[1]["POOL LIST"], "enm1");
    }

    #[test]
    fn test_sizes_and_percent() {
        assert_eq!(size_to_mb("10.00G"), Some(10240));
        assert_eq!(size_to_mb("512M"), Some(512));
        assert_eq!(size_to_mb("1.5T"), Some(1_572_864));
        assert_eq!(size_to_mb("12.5M"), Some(13));
        assert_eq!(size_to_mb("big"), None);
        assert_eq!(percent("40%"), Some(40.0));
        assert_eq!(percent("(12)"), Some(12.0));
        assert_eq!(percent("40.000"), Some(40.0));
    }
}
