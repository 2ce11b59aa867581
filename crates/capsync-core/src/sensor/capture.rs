// ── Capture files ──
//
// One append-only text file per sensor per recording:
// `<label>_data_<YYYYmmdd_HHMMSS>.txt`, one `<RFC3339> | <hex>` line per
// notification frame.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use capsync_link::{Notification, decode_le_f32};
use chrono::{DateTime, Local, SecondsFormat};
use tracing::debug;

/// An open capture file.
#[derive(Debug)]
pub struct CaptureLog {
    path: PathBuf,
    writer: BufWriter<File>,
    frames: u64,
}

impl CaptureLog {
    /// Create the capture file for `label` in `dir` (created if missing).
    pub fn create(dir: &Path, label: &str, started: DateTime<Local>) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(file_name(label, started));
        let file = File::options().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
            frames: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn append(&mut self, n: &Notification) -> io::Result<()> {
        writeln!(
            self.writer,
            "{} | {}",
            n.received_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            n.hex()
        )?;
        self.frames += 1;
        if let Some(values) = decode_le_f32(&n.payload) {
            debug!(file = %self.path.display(), frame = self.frames, ?values, "frame");
        }
        Ok(())
    }

    /// Flush and close. Returns the number of frames written.
    pub fn finish(mut self) -> io::Result<u64> {
        self.writer.flush()?;
        Ok(self.frames)
    }
}

/// `<label>_data_<YYYYmmdd_HHMMSS>.txt`, with anything outside
/// `[A-Za-z0-9-]` in the label replaced by `_`.
pub fn file_name(label: &str, started: DateTime<Local>) -> String {
    let safe: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("{safe}_data_{}.txt", started.format("%Y%m%d_%H%M%S"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn at() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap()
    }

    #[test]
    fn file_name_is_sanitized() {
        assert_eq!(
            file_name("Movella DOT D4:22:CD", at()),
            "Movella_DOT_D4_22_CD_data_20240309_140507.txt"
        );
    }

    #[test]
    fn frames_are_appended_as_hex_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = CaptureLog::create(dir.path(), "dot", at()).unwrap();
        log.append(&Notification::new(Uuid::nil(), vec![0x01u8, 0xff])).unwrap();
        log.append(&Notification::new(Uuid::nil(), vec![0x00u8])).unwrap();
        let path = log.path().to_owned();
        assert_eq!(log.finish().unwrap(), 2);

        let text = fs::read_to_string(path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" | 01 ff"));
        assert!(lines[1].ends_with(" | 00"));
        let stamp = lines[0].split(" | ").next().unwrap();
        assert!(DateTime::parse_from_rfc3339(stamp).is_ok());
    }
}
