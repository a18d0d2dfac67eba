// DOS-side path handling for the GEMDOS drive: resolution of upper-case
// back-slash paths against the host filesystem, 8.3 name rules, the DOS
// glob dialect, directory scan bookkeeping and time stamp conversion.

use std::collections::HashMap;
use std::fs::{self, ReadDir};
use std::path::{Path, PathBuf};

use bitflags::bitflags;
use chrono::{Datelike, FixedOffset, NaiveDate, TimeZone, Timelike};

bitflags! {
    /// GEMDOS file attribute flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FileAttr: u16 {
        const READONLY = 0x01;
        const HIDDEN = 0x02;
        const SYSTEM = 0x04;
        const VOLUME = 0x08;
        const DIR = 0x10;
        const ARCHIVE = 0x20;
    }
}

/// Outcome of resolving a DOS path against the host filesystem.
#[derive(Debug)]
pub enum PathClass {
    /// The path names a drive we do not manage.
    NotManaged,
    /// A non-final component does not exist or is not a directory.
    Invalid,
    /// The path is an existing directory.
    Dir(PathBuf),
    /// The path is an existing regular file.
    File(PathBuf),
    /// Every component but the last exists; the last does not. The returned
    /// path carries the lower-cased name a new file would get.
    Missing(PathBuf),
}

/// Look for `fname` in `dir`: exact match first, then a case-insensitive
/// directory scan.
fn filename_lookup(dir: &Path, fname: &str) -> Option<String> {
    if dir.join(fname).symlink_metadata().is_ok() {
        return Some(fname.to_string());
    }
    let entries = fs::read_dir(dir).ok()?;
    for entry in entries.flatten() {
        if let Some(name) = entry.file_name().to_str() {
            if name.eq_ignore_ascii_case(fname) {
                return Some(name.to_string());
            }
        }
    }
    None
}

/// Resolve a DOS path (`\SOME\DIR` absolute, `SOME\SUBDIR` relative, with an
/// optional `C:` drive prefix) to a host path, component by component.
pub fn resolve_path(
    root: &Path,
    current_path: &Path,
    current_drv: u32,
    gemdos_drv: u32,
    path: &str,
) -> PathClass {
    let bytes = path.as_bytes();
    let mut rest = path;
    if bytes.len() >= 2 && bytes[1] == b':' {
        if (bytes[0].to_ascii_uppercase().wrapping_sub(b'A')) as u32 == gemdos_drv {
            rest = &path[2..];
        } else {
            return PathClass::NotManaged;
        }
    } else if current_drv != gemdos_drv {
        return PathClass::NotManaged;
    }

    let mut search_path = if rest.starts_with('\\') {
        rest = &rest[1..];
        root.to_path_buf()
    } else {
        current_path.to_path_buf()
    };

    let mut segments = rest.split('\\').filter(|s| !s.is_empty()).peekable();
    while let Some(segment) = segments.next() {
        let has_next = segments.peek().is_some();
        match filename_lookup(&search_path, segment) {
            Some(real) => {
                search_path.push(real);
                if has_next && !search_path.is_dir() {
                    return PathClass::Invalid;
                }
            }
            None if has_next => return PathClass::Invalid,
            None => {
                // not found: synthesize a new file name
                search_path.push(segment.to_lowercase());
            }
        }
    }

    match fs::metadata(&search_path) {
        Err(_) => PathClass::Missing(search_path),
        Ok(md) if md.is_dir() => PathClass::Dir(search_path),
        Ok(_) => PathClass::File(search_path),
    }
}

/// DOS glob match: `*` stops at a dot, `?` matches one character, a trailing
/// `.*` also matches extension-less names; comparison is case-insensitive.
pub fn match_dos_pattern(pattern: &str, name: &str) -> bool {
    fn matches(p: &[u8], s: &[u8]) -> bool {
        let mut pi = 0;
        let mut si = 0;
        while pi < p.len() {
            if p[pi] == b'*' {
                while pi < p.len() && p[pi] == b'*' {
                    pi += 1;
                }
                while si < s.len() && s[si] != b'.' {
                    if matches(&p[pi..], &s[si..]) {
                        return true;
                    }
                    si += 1;
                }
            } else if p[pi] == b'?' {
                if si >= s.len() {
                    return false;
                }
                pi += 1;
                si += 1;
            } else {
                if p[pi] == b'.' && &p[pi..] == b".*" {
                    return true;
                }
                if si >= s.len() || !p[pi].eq_ignore_ascii_case(&s[si]) {
                    return false;
                }
                pi += 1;
                si += 1;
            }
        }
        si == s.len()
    }
    matches(pattern.as_bytes(), name.as_bytes())
}

/// Check a host file name against the 8.3 rules: at most one dot, base name
/// up to 8 characters, extension up to 3. `..` passes.
pub fn valid_83(name: &str) -> bool {
    let len = name.len();
    match name.find('.') {
        Some(dot) if name != ".." => {
            name[dot + 1..].find('.').is_none() && dot <= 8 && len - dot <= 4
        }
        _ => len <= 8,
    }
}

/// One active Fsfirst/Fsnext directory scan.
pub struct FileScan {
    pub path: PathBuf,
    pub pattern: String,
    pub attr: FileAttr,
    pub first: bool,
    pub iter: ReadDir,
}

/// Host-side table of directory scans, keyed by the opaque id stored in the
/// guest's DTA. A monotonic counter avoids reuse hazards after a scan is
/// released and another one opened.
pub struct ScanTable {
    scans: HashMap<u32, FileScan>,
    next_key: u32,
}

impl ScanTable {
    pub fn new() -> ScanTable {
        ScanTable { scans: HashMap::new(), next_key: 1 }
    }

    pub fn insert(&mut self, scan: FileScan) -> u32 {
        let key = self.next_key;
        self.next_key = self.next_key.wrapping_add(1).max(1);
        self.scans.insert(key, scan);
        key
    }

    pub fn get_mut(&mut self, key: u32) -> Option<&mut FileScan> {
        self.scans.get_mut(&key)
    }

    pub fn remove(&mut self, key: u32) -> Option<FileScan> {
        self.scans.remove(&key)
    }
}

/// Convert a UNIX timestamp to packed DOS time and date through the
/// configured UTC offset.
pub fn unix_to_dos(secs: i64, tz_hours: i32) -> (u16, u16) {
    let offset = match FixedOffset::east_opt(tz_hours * 3600) {
        Some(o) => o,
        None => FixedOffset::east_opt(0).unwrap(),
    };
    let dt = match offset.timestamp_opt(secs, 0).single() {
        Some(dt) => dt,
        None => return (0, 0),
    };
    let time = (dt.hour() << 11 | dt.minute() << 5 | dt.second() >> 1) as u16;
    let year = (dt.year() - 1980).max(0) as u32;
    let date = (year << 9 | dt.month() << 5 | dt.day()) as u16;
    (time, date)
}

/// Convert packed DOS time and date back to a UNIX timestamp.
pub fn dos_to_unix(time: u16, date: u16, tz_hours: i32) -> i64 {
    let offset = match FixedOffset::east_opt(tz_hours * 3600) {
        Some(o) => o,
        None => FixedOffset::east_opt(0).unwrap(),
    };
    let naive = NaiveDate::from_ymd_opt(
        1980 + (date >> 9 & 0x7f) as i32,
        (date >> 5 & 0xf) as u32,
        (date & 0x1f) as u32,
    )
    .and_then(|d| {
        d.and_hms_opt((time >> 11 & 0x1f) as u32, (time >> 5 & 0x3f) as u32, ((time & 0x1f) << 1) as u32)
    });
    match naive.and_then(|n| offset.from_local_datetime(&n).single()) {
        Some(dt) => dt.timestamp(),
        None => 0,
    }
}
