//! Plain-text operation log written next to the backup data.

use crate::utils::fs::atomic_write;
use chrono::Utc;
use std::fmt::Display;
use std::path::Path;

pub const BACKUP_LOG: &str = "backup-log.txt";
pub const RESTORE_LOG: &str = "restore-log.txt";

#[derive(Debug, Clone, Default)]
pub struct AuditLog {
    lines: Vec<String>,
}

impl AuditLog {
    pub fn new(title: &str) -> Self {
        let mut log = Self::default();
        log.line(format!("=== {} ===", title));
        log.line(format!("Started: {}", Utc::now().format("%Y-%m-%d %H:%M:%S UTC")));
        log
    }

    pub fn line(&mut self, text: impl Into<String>) {
        self.lines.push(text.into());
    }

    /// Blank line followed by a `=== heading ===` banner.
    pub fn section(&mut self, heading: &str) {
        self.lines.push(String::new());
        self.line(format!("=== {} ===", heading));
    }

    pub fn entry(&mut self, key: &str, value: impl Display) {
        self.line(format!("{}: {}", key, value));
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    /// Write the log, stamped with a completion time.
    pub fn write_to(&mut self, path: &Path) -> std::io::Result<()> {
        self.entry("Completed", Utc::now().format("%Y-%m-%d %H:%M:%S UTC"));
        let mut body = self.lines.join("\n");
        body.push('\n');
        atomic_write(path, body.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_log_is_written_with_sections() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(BACKUP_LOG);

        let mut log = AuditLog::new("Backup backup_20240102_030405");
        log.line("  Account: 2 records");
        log.section("Summary");
        log.entry("Total Records", 2);
        log.write_to(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "=== Backup backup_20240102_030405 ===");
        assert!(lines.contains(&"  Account: 2 records"));
        assert!(lines.contains(&""));
        assert!(lines.contains(&"=== Summary ==="));
        assert!(lines.contains(&"Total Records: 2"));
        assert!(lines.last().unwrap().starts_with("Completed: "));
    }
}
