//! CSV dump of step records

use super::StepRecord;
use std::io::{self, Write};

pub const CSV_HEADER: &str = "StepName,Status,Timestamp,ExitCode,ErrorMessage,Version";

/// Quote a field when it contains a delimiter, quote or line break
pub fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Write `records` with a header row, CRLF line endings
pub fn write_csv<W: Write>(records: &[StepRecord], mut writer: W) -> io::Result<()> {
    write!(writer, "{}\r\n", CSV_HEADER)?;
    for record in records {
        let exit_code = record.exit_code.map(|c| c.to_string()).unwrap_or_default();
        let fields = [
            csv_escape(&record.step_name),
            record.status.to_string(),
            csv_escape(&record.timestamp),
            exit_code,
            csv_escape(record.error_message.as_deref().unwrap_or("")),
            csv_escape(record.version.as_deref().unwrap_or("")),
        ];
        write!(writer, "{}\r\n", fields.join(","))?;
    }
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StepStatus;

    #[test]
    fn test_escape() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(csv_escape("two\nlines"), "\"two\nlines\"");
    }

    #[test]
    fn test_rows_leave_missing_fields_empty() {
        let records = vec![StepRecord {
            step_name: "InstallApps".to_string(),
            status: StepStatus::Skipped,
            timestamp: "2026-01-02 03:04:05".to_string(),
            exit_code: None,
            error_message: Some("Skipped: dependency 'InstallTool' Failed".to_string()),
            version: None,
        }];
        let mut out = Vec::new();
        write_csv(&records, &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "StepName,Status,Timestamp,ExitCode,ErrorMessage,Version\r\n\
             InstallApps,Skipped,2026-01-02 03:04:05,,Skipped: dependency 'InstallTool' Failed,\r\n"
        );
    }
}
