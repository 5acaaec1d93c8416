//! Row sinks: the daily CSV file and stdout.
//!
//! The CSV contract is fixed downstream: `;` separators, `\n` terminators,
//! six-decimal fixed floats, a header on fresh files and a restart marker
//! when appending to an existing one.

use std::env;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDate};
use tracing::info;

use crate::probe::Row;

/// Header of a fresh daily file. The `DirkRC` spelling is part of the
/// contract; downstream parsers match it verbatim.
pub const CSV_HEADER: &str =
    "TIME;NAME;CPU;CPUC;NetUP;NetUpC;NetDown;NetDownC;DiskR;DiskW;DirkRC;DiskWC;RAM;SumC";

/// Line written when the probe reopens a file that already has data.
pub const RESTART_MARKER: &str = "----RESTARTLINE----";

/// Where rows go. Two implementations: the daily CSV file and stdout.
pub trait RowSink {
    fn write_row(&mut self, row: &Row) -> io::Result<()>;

    /// Reopens day-dependent resources. No-op for stdout.
    fn rotate(&mut self) -> io::Result<()>;

    fn flush(&mut self);
}

/// Serializes one row into the CSV line format.
pub fn format_row(row: &Row) -> String {
    format!(
        "{};{};{:.6};{:.6};{:.6};{:.6};{:.6};{:.6};{:.6};{:.6};{:.6};{:.6};{};{:.6}",
        row.timestamp,
        row.name,
        row.cpu_percent,
        row.cpu_wh,
        row.net_up_mbps,
        row.net_up_wh,
        row.net_down_mbps,
        row.net_down_wh,
        row.disk_read_mbps,
        row.disk_write_mbps,
        row.disk_read_wh,
        row.disk_write_wh,
        row.ram_bytes,
        row.total_wh,
    )
}

/// The account name baked into the daily file name.
pub fn current_username() -> String {
    env::var("USERNAME")
        .or_else(|_| env::var("USER"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// `log-DD_MM_YYYY-USERNAME.csv`
pub fn daily_file_name(username: &str, date: NaiveDate) -> String {
    format!("log-{}-{}.csv", date.format("%d_%m_%Y"), username)
}

/// Rows to stdout, for piping into other tooling.
pub struct StdoutSink;

impl RowSink for StdoutSink {
    fn write_row(&mut self, row: &Row) -> io::Result<()> {
        let stdout = io::stdout();
        writeln!(stdout.lock(), "{}", format_row(row))
    }

    fn rotate(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn flush(&mut self) {
        let _ = io::stdout().flush();
    }
}

/// Append-only daily CSV file.
pub struct CsvFileSink {
    dir: PathBuf,
    username: String,
    writer: BufWriter<File>,
}

impl CsvFileSink {
    /// Opens (or appends to) today's file in `dir`.
    pub fn open(dir: impl Into<PathBuf>, username: impl Into<String>) -> io::Result<Self> {
        let dir = dir.into();
        let username = username.into();
        let writer = Self::open_for_date(&dir, &username, Local::now().date_naive())?;
        Ok(Self {
            dir,
            username,
            writer,
        })
    }

    fn open_for_date(dir: &Path, username: &str, date: NaiveDate) -> io::Result<BufWriter<File>> {
        let path = dir.join(daily_file_name(username, date));
        let existed = path.exists();

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut writer = BufWriter::new(file);
        if existed {
            writeln!(writer, "{}", RESTART_MARKER)?;
        } else {
            writeln!(writer, "{}", CSV_HEADER)?;
        }
        writer.flush()?;
        info!("writing rows to {}", path.display());
        Ok(writer)
    }
}

impl RowSink for CsvFileSink {
    fn write_row(&mut self, row: &Row) -> io::Result<()> {
        writeln!(self.writer, "{}", format_row(row))
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.flush();
        self.writer = Self::open_for_date(&self.dir, &self.username, Local::now().date_naive())?;
        Ok(())
    }

    fn flush(&mut self) {
        let _ = self.writer.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_row() -> Row {
        Row {
            timestamp: 1_700_000_000,
            name: "browser.exe".to_string(),
            cpu_percent: 25.0,
            cpu_wh: 0.5,
            net_up_mbps: 1.0,
            net_up_wh: 0.068,
            net_down_mbps: 0.0,
            net_down_wh: 0.0,
            disk_read_mbps: 0.25,
            disk_write_mbps: 0.5,
            disk_read_wh: 0.000054,
            disk_write_wh: 0.000136,
            ram_bytes: 1_048_576,
            total_wh: 0.56819,
        }
    }

    #[test]
    fn test_row_format_is_semicolon_separated_fixed_notation() {
        let line = format_row(&sample_row());
        assert_eq!(
            line,
            "1700000000;browser.exe;25.000000;0.500000;1.000000;0.068000;\
             0.000000;0.000000;0.250000;0.500000;0.000054;0.000136;1048576;0.568190"
        );
        assert_eq!(line.split(';').count(), 14);
    }

    #[test]
    fn test_daily_file_name_layout() {
        let date = NaiveDate::from_ymd_opt(2009, 6, 15).unwrap();
        assert_eq!(daily_file_name("alice", date), "log-15_06_2009-alice.csv");
    }

    #[test]
    fn test_fresh_file_starts_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let mut writer = CsvFileSink::open_for_date(dir.path(), "tester", date).unwrap();
        writeln!(writer, "{}", format_row(&sample_row())).unwrap();
        writer.flush().unwrap();

        let content =
            std::fs::read_to_string(dir.path().join("log-02_01_2024-tester.csv")).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some(CSV_HEADER));
        assert!(lines.next().unwrap().starts_with("1700000000;browser.exe;"));
    }

    #[test]
    fn test_reopened_file_gets_restart_marker() {
        let dir = tempfile::tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();

        let writer = CsvFileSink::open_for_date(dir.path(), "tester", date).unwrap();
        drop(writer);
        let writer = CsvFileSink::open_for_date(dir.path(), "tester", date).unwrap();
        drop(writer);

        let content =
            std::fs::read_to_string(dir.path().join("log-02_01_2024-tester.csv")).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines, vec![CSV_HEADER, RESTART_MARKER]);
    }

    #[test]
    fn test_new_date_opens_fresh_file_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let day1 = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2024, 1, 3).unwrap();

        drop(CsvFileSink::open_for_date(dir.path(), "tester", day1).unwrap());
        drop(CsvFileSink::open_for_date(dir.path(), "tester", day2).unwrap());

        let content =
            std::fs::read_to_string(dir.path().join("log-03_01_2024-tester.csv")).unwrap();
        assert_eq!(content.lines().next(), Some(CSV_HEADER));
        assert!(!content.contains(RESTART_MARKER));
    }

    #[test]
    fn test_sink_appends_rows() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = CsvFileSink::open(dir.path(), "tester").unwrap();
        sink.write_row(&sample_row()).unwrap();
        sink.write_row(&sample_row()).unwrap();
        sink.flush();

        let name = daily_file_name("tester", Local::now().date_naive());
        let content = std::fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(content.lines().count(), 3); // header + 2 rows
    }
}
