//! Shared helpers for the line-oriented, rewrite-temp-rename text stores.
//!
//! Every store in this module follows the same durability contract: reads
//! tolerate a truncated trailing record (a crash mid-append leaves a partial
//! last line; the reader just drops it), and rewrites go through a sibling
//! `.tmp` file followed by an atomic rename so a crash never leaves a half
//! written primary file.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;

/// Reads every complete `\n`-terminated line of `path` into `field_count`-way
/// `|`-split records, silently dropping any line that doesn't split into
/// exactly `field_count` fields (a torn trailing write, or simply an absent
/// file). Returns `Ok(vec![])` if the file does not exist.
pub fn read_records(path: &Path, field_count: usize) -> io::Result<Vec<Vec<String>>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let reader = BufReader::new(file);
    let mut out = Vec::new();
    for line in reader.lines() {
        let line = match line {
            Ok(l) => l,
            // A non-UTF8 or otherwise unreadable trailing line is treated the
            // same as a torn write: skip it, keep going.
            Err(_) => continue,
        };
        if line.is_empty() {
            continue;
        }
        let fields: Vec<String> = line.split('|').map(|s| s.to_owned()).collect();
        if fields.len() == field_count {
            out.push(fields);
        }
    }
    Ok(out)
}

/// Appends one `|`-joined record terminated by `\n`, creating the file and
/// its parent directory if necessary.
pub fn append_record(path: &Path, fields: &[&str]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{}", fields.join("|"))
}

/// Replaces the whole contents of `path` with `lines` (each already
/// `|`-joined) via a sibling `.tmp` file and an atomic rename.
pub fn rewrite_records(path: &Path, lines: &[String]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = tmp_path_for(path);
    {
        let mut tmp = File::create(&tmp_path)?;
        for line in lines {
            writeln!(tmp, "{}", line)?;
        }
        tmp.sync_all()?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn tmp_path_for(path: &Path) -> std::path::PathBuf {
    let mut s = path.as_os_str().to_owned();
    s.push(".tmp");
    std::path::PathBuf::from(s)
}

/// Reads a decimal counter from `path`, defaulting to `default` if the file
/// is absent or unparsable (fresh data directory, or a torn write on the
/// counter file itself — losing at most the last allocation is preferable to
/// refusing to start).
pub fn read_counter(path: &Path, default: u64) -> u64 {
    match fs::read_to_string(path) {
        Ok(s) => s.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

/// Persists a decimal counter value via tmp+rename.
pub fn write_counter(path: &Path, value: u64) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp_path = tmp_path_for(path);
    fs::write(&tmp_path, value.to_string())?;
    fs::rename(&tmp_path, path)
}
