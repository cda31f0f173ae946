//! Attendance ledger: append-only CSV with a `Name,Time` header.
//!
//! Rows are encoded and parsed with the `csv` crate. Each append holds an
//! exclusive `flock` on the file and lands with a single `write_all`, so rows from concurrent sessions never interleave and
//! the header is written exactly once, by whoever finds the file empty.

use crate::types::AttendanceRecord;
use chrono::{Duration, NaiveDateTime};
use nix::fcntl::{Flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const HEADER: [&str; 2] = ["Name", "Time"];

/// Timestamp layout of the `Time` column.
pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("failed to write attendance ledger {path}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("failed to read attendance ledger {path}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("attendance ledger {path} is corrupt at line {line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Appended,
    /// Same name already recorded within the dedup window.
    Suppressed { previous: NaiveDateTime },
}

#[derive(Debug, Clone)]
pub struct AttendanceLedger {
    path: PathBuf,
    dedup_window: Option<Duration>,
}

impl AttendanceLedger {
    /// Ledger at `path`; the file is created on first write.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            dedup_window: None,
        }
    }

    /// Skip a record when the same name was recorded less than `window`
    /// before it. Off unless set.
    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = Some(window);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `(name, at)`. Seconds precision; sub-second parts are dropped.
    pub fn record(&self, name: &str, at: NaiveDateTime) -> Result<RecordOutcome, LedgerError> {
        let write_err = |source| LedgerError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(write_err)?;
        let mut file = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| write_err(io::Error::from(errno)))?;

        let existing = file.metadata().map_err(write_err)?.len();

        if let Some(window) = self.dedup_window {
            if existing > 0 {
                let content = read_locked(&mut file, &self.path)?;
                let previous = parse_records(&self.path, &content)?
                    .into_iter()
                    .rev()
                    .find(|r| r.name == name)
                    .map(|r| r.time);
                if let Some(previous) = previous {
                    let elapsed = at - previous;
                    if elapsed >= Duration::zero() && elapsed < window {
                        tracing::info!(name, %previous, %at, "attendance already recorded within dedup window");
                        return Ok(RecordOutcome::Suppressed { previous });
                    }
                }
            }
        }

        let time = at.format(TIME_FORMAT).to_string();
        let mut rows = Vec::with_capacity(2);
        if existing == 0 {
            rows.push(HEADER);
        }
        rows.push([name, time.as_str()]);
        let bytes = encode_rows(&rows).map_err(write_err)?;

        file.write_all(&bytes).map_err(write_err)?;
        file.sync_data().map_err(write_err)?;

        tracing::info!(name, %at, path = %self.path.display(), "attendance recorded");
        Ok(RecordOutcome::Appended)
    }

    /// Every record in append order. A ledger that does not exist yet is empty.
    pub fn read_all(&self) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(LedgerError::Read {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        let mut file = Flock::lock(file, FlockArg::LockShared).map_err(|(_, errno)| {
            LedgerError::Read {
                path: self.path.clone(),
                source: io::Error::from(errno),
            }
        })?;

        let content = read_locked(&mut file, &self.path)?;
        parse_records(&self.path, &content)
    }
}

fn read_locked(file: &mut File, path: &Path) -> Result<Vec<u8>, LedgerError> {
    let mut bytes = Vec::new();
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_end(&mut bytes))
        .map_err(|source| LedgerError::Read {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(bytes)
}

fn line_of(record: &csv::StringRecord) -> usize {
    record.position().map_or(0, |p| p.line() as usize)
}

fn parse_records(path: &Path, content: &[u8]) -> Result<Vec<AttendanceRecord>, LedgerError> {
    let corrupt = |line: usize, reason: String| LedgerError::Corrupt {
        path: path.to_path_buf(),
        line,
        reason,
    };

    // Row length is checked per record so the error names the line.
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(content);
    let mut rows = reader.records().map(|row| {
        row.map_err(|e| {
            let line = e.position().map_or(1, |p| p.line() as usize);
            corrupt(line, e.to_string())
        })
    });

    match rows.next().transpose()? {
        None => return Ok(Vec::new()),
        Some(header) if header.iter().eq(HEADER) => {}
        Some(header) => {
            let found: Vec<&str> = header.iter().collect();
            return Err(corrupt(
                line_of(&header),
                format!("expected header Name,Time, found {found:?}"),
            ));
        }
    }

    rows.map(|row| {
        let row = row?;
        let line = line_of(&row);
        if row.len() != 2 {
            return Err(corrupt(line, format!("expected 2 fields, found {}", row.len())));
        }
        let time = NaiveDateTime::parse_from_str(&row[1], TIME_FORMAT)
            .map_err(|e| corrupt(line, format!("bad timestamp {:?}: {e}", &row[1])))?;
        Ok(AttendanceRecord {
            name: row[0].to_string(),
            time,
        })
    })
    .collect()
}

/// CSV rows, each ending in `\n`. Fields holding separators, quotes or line
/// breaks are quoted.
fn encode_rows(rows: &[[&str; 2]]) -> io::Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    for row in rows {
        writer.write_record(row)?;
    }
    writer.into_inner().map_err(|e| e.into_error())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn t(h: u32, m: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 1)
            .unwrap()
            .and_hms_opt(h, m, s)
            .unwrap()
    }

    fn ledger() -> (tempfile::TempDir, AttendanceLedger) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = AttendanceLedger::new(dir.path().join("attendance.csv"));
        (dir, ledger)
    }

    #[test]
    fn test_first_write_creates_header_once() {
        let (_dir, ledger) = ledger();
        ledger.record("Dana", t(9, 0, 0)).unwrap();
        ledger.record("Eve", t(9, 0, 5)).unwrap();

        let content = fs::read_to_string(ledger.path()).unwrap();
        assert_eq!(
            content,
            "Name,Time\nDana,2024-03-01 09:00:00\nEve,2024-03-01 09:00:05\n"
        );
    }

    #[test]
    fn test_no_dedup_by_default() {
        let (_dir, ledger) = ledger();
        assert_eq!(ledger.record("Dana", t(9, 0, 0)).unwrap(), RecordOutcome::Appended);
        assert_eq!(ledger.record("Dana", t(9, 0, 1)).unwrap(), RecordOutcome::Appended);

        let records = ledger.read_all().unwrap();
        assert_eq!(
            records,
            vec![
                AttendanceRecord { name: "Dana".into(), time: t(9, 0, 0) },
                AttendanceRecord { name: "Dana".into(), time: t(9, 0, 1) },
            ]
        );
    }

    #[test]
    fn test_read_all_preserves_append_order() {
        let (_dir, ledger) = ledger();
        // Deliberately non-chronological: order is append order, not time.
        let entries = [("A", t(10, 0, 0)), ("B", t(8, 0, 0)), ("C", t(9, 30, 0))];
        for (name, at) in entries {
            ledger.record(name, at).unwrap();
        }

        let records = ledger.read_all().unwrap();
        let got: Vec<_> = records.iter().map(|r| (r.name.as_str(), r.time)).collect();
        assert_eq!(got, entries);
    }

    #[test]
    fn test_concurrent_appends_do_not_interleave() {
        let (_dir, ledger) = ledger();
        let path = ledger.path().to_path_buf();
        const SESSIONS: usize = 8;
        const PER_SESSION: u32 = 25;

        let handles: Vec<_> = (0..SESSIONS)
            .map(|session| {
                let session_ledger = AttendanceLedger::new(path.clone());
                std::thread::spawn(move || {
                    for i in 0..PER_SESSION {
                        session_ledger
                            .record(&format!("session-{session}"), t(9, 0, i))
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let records = ledger.read_all().unwrap();
        assert_eq!(records.len(), SESSIONS * PER_SESSION as usize);

        for session in 0..SESSIONS {
            let name = format!("session-{session}");
            let times: Vec<_> = records.iter().filter(|r| r.name == name).map(|r| r.time).collect();
            let expected: Vec<_> = (0..PER_SESSION).map(|i| t(9, 0, i)).collect();
            assert_eq!(times, expected, "{name} rows lost or reordered");
        }

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.matches("Name,Time").count(), 1);
    }

    #[test]
    fn test_missing_ledger_reads_empty() {
        let (_dir, ledger) = ledger();
        assert!(ledger.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = AttendanceLedger::new(dir.path().join("nested/deeper/attendance.csv"));
        ledger.record("Dana", t(9, 0, 0)).unwrap();
        assert_eq!(ledger.read_all().unwrap().len(), 1);
    }

    #[test]
    fn test_names_with_separators_round_trip() {
        let (_dir, ledger) = ledger();
        let name = "Smith, \"Jo\"";
        ledger.record(name, t(9, 0, 0)).unwrap();

        let content = fs::read_to_string(ledger.path()).unwrap();
        assert!(content.contains("\"Smith, \"\"Jo\"\"\",2024-03-01 09:00:00"));
        assert_eq!(ledger.read_all().unwrap()[0].name, name);
    }

    #[test]
    fn test_opt_in_dedup_window() {
        let (_dir, ledger) = ledger();
        let ledger = ledger.with_dedup_window(Duration::seconds(60));

        assert_eq!(ledger.record("Dana", t(9, 0, 0)).unwrap(), RecordOutcome::Appended);
        assert_eq!(
            ledger.record("Dana", t(9, 0, 30)).unwrap(),
            RecordOutcome::Suppressed { previous: t(9, 0, 0) }
        );
        assert_eq!(ledger.record("Eve", t(9, 0, 30)).unwrap(), RecordOutcome::Appended);
        assert_eq!(ledger.record("Dana", t(9, 1, 0)).unwrap(), RecordOutcome::Appended);

        assert_eq!(ledger.read_all().unwrap().len(), 3);
    }

    #[test]
    fn test_write_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the ledger file should be.
        let ledger = AttendanceLedger::new(dir.path());
        let result = ledger.record("Dana", t(9, 0, 0));
        assert!(matches!(result, Err(LedgerError::Write { .. })));
    }

    #[test]
    fn test_wrong_header_is_corrupt() {
        let (_dir, ledger) = ledger();
        fs::write(ledger.path(), "who,when\nDana,2024-03-01 09:00:00\n").unwrap();
        assert!(matches!(
            ledger.read_all(),
            Err(LedgerError::Corrupt { line: 1, .. })
        ));
    }

    #[test]
    fn test_bad_row_is_corrupt() {
        let (_dir, ledger) = ledger();
        fs::write(
            ledger.path(),
            "Name,Time\nDana,2024-03-01 09:00:00\nEve,yesterday\n",
        )
        .unwrap();
        assert!(matches!(
            ledger.read_all(),
            Err(LedgerError::Corrupt { line: 3, .. })
        ));

        fs::write(ledger.path(), "Name,Time\nDana\n").unwrap();
        assert!(matches!(
            ledger.read_all(),
            Err(LedgerError::Corrupt { line: 2, .. })
        ));
    }

    #[test]
    fn test_unterminated_quote_is_corrupt() {
        let (_dir, ledger) = ledger();
        fs::write(ledger.path(), "Name,Time\n\"Dana,2024-03-01 09:00:00\n").unwrap();
        // The open quote swallows the rest of the file into one field.
        assert!(matches!(
            ledger.read_all(),
            Err(LedgerError::Corrupt { line: 2, .. })
        ));
    }

    #[test]
    fn test_invalid_utf8_is_corrupt() {
        let (_dir, ledger) = ledger();
        fs::write(ledger.path(), b"Name,Time\n\xff\xfe,2024-03-01 09:00:00\n").unwrap();
        assert!(matches!(ledger.read_all(), Err(LedgerError::Corrupt { .. })));
    }

    #[test]
    fn test_multiline_name_round_trips() {
        let (_dir, ledger) = ledger();
        ledger.record("Ann\nLee", t(9, 0, 0)).unwrap();
        ledger.record("Bo", t(9, 0, 1)).unwrap();

        let content = fs::read_to_string(ledger.path()).unwrap();
        assert!(content.contains("\"Ann\nLee\",2024-03-01 09:00:00\n"));
        let names: Vec<_> = ledger.read_all().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, ["Ann\nLee", "Bo"]);
    }

    #[test]
    fn test_reads_crlf_and_blank_lines() {
        let (_dir, ledger) = ledger();
        fs::write(
            ledger.path(),
            "Name,Time\r\nDana,2024-03-01 09:00:00\r\n\r\nEve,2024-03-01 09:00:05",
        )
        .unwrap();
        let names: Vec<_> = ledger.read_all().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, ["Dana", "Eve"]);
    }

    #[test]
    fn test_empty_file_gets_header_on_write() {
        let (_dir, ledger) = ledger();
        fs::write(ledger.path(), "").unwrap();
        assert!(ledger.read_all().unwrap().is_empty());

        ledger.record("Dana", t(9, 0, 0)).unwrap();
        assert!(fs::read_to_string(ledger.path()).unwrap().starts_with("Name,Time\n"));
    }
}
