use crate::error::AppError;
use chrono::{DateTime, Utc};
use std::fs::{File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};

pub const HEADER: &str = "capture_ts,landmark_ts,overlay_ts,e2e_ms,fps,use_cloud,cloud_latency_ms,cloud_confidence,cloud_ok,breaker_open";

/// One processing cycle, as written to the latency log.
#[derive(Debug, Clone, PartialEq)]
pub struct LatencyRecord {
    pub capture_ts: DateTime<Utc>,
    pub landmark_ts: DateTime<Utc>,
    pub overlay_ts: DateTime<Utc>,
    pub e2e_ms: f64,
    pub fps: f64,
    pub use_cloud: bool,
    pub cloud_latency_ms: Option<f64>,
    pub cloud_confidence: Option<f64>,
    pub cloud_ok: Option<bool>,
    pub breaker_open: bool,
}

fn seconds(ts: &DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1_000_000.0
}

fn flag(value: bool) -> u8 {
    u8::from(value)
}

impl LatencyRecord {
    pub fn to_csv(&self) -> String {
        let cloud_latency = self
            .cloud_latency_ms
            .map(|ms| format!("{:.2}", ms))
            .unwrap_or_default();
        let cloud_confidence = self
            .cloud_confidence
            .map(|c| format!("{:.3}", c))
            .unwrap_or_default();
        let cloud_ok = self.cloud_ok.map(|ok| flag(ok).to_string()).unwrap_or_default();
        format!(
            "{:.6},{:.6},{:.6},{:.2},{:.1},{},{},{},{},{}",
            seconds(&self.capture_ts),
            seconds(&self.landmark_ts),
            seconds(&self.overlay_ts),
            self.e2e_ms,
            self.fps,
            flag(self.use_cloud),
            cloud_latency,
            cloud_confidence,
            cloud_ok,
            flag(self.breaker_open)
        )
    }
}

/// Append-only CSV latency log. The header is written once, when the file is new or empty.
pub struct LatencyLog {
    path: PathBuf,
    writer: LineWriter<File>,
}

impl LatencyLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let is_empty = file.metadata()?.len() == 0;
        let mut writer = LineWriter::new(file);
        if is_empty {
            writeln!(writer, "{}", HEADER)?;
        }
        tracing::info!("Latency log at {}", path.display());
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&mut self, record: &LatencyRecord) -> Result<(), AppError> {
        writeln!(self.writer, "{}", record.to_csv())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn temp_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("mirror-latency-{}", Uuid::new_v4()))
            .join("latency.csv")
    }

    fn record() -> LatencyRecord {
        let capture = Utc.timestamp_micros(1_700_000_000_250_000).unwrap();
        LatencyRecord {
            capture_ts: capture,
            landmark_ts: capture + chrono::Duration::milliseconds(20),
            overlay_ts: capture + chrono::Duration::milliseconds(35),
            e2e_ms: 35.0,
            fps: 23.96,
            use_cloud: true,
            cloud_latency_ms: Some(412.5),
            cloud_confidence: Some(0.8),
            cloud_ok: Some(true),
            breaker_open: false,
        }
    }

    #[test]
    fn row_formats_columns() {
        assert_eq!(
            record().to_csv(),
            "1700000000.250000,1700000000.270000,1700000000.285000,35.00,24.0,1,412.50,0.800,1,0"
        );
        let local_only = LatencyRecord {
            use_cloud: false,
            cloud_latency_ms: None,
            cloud_confidence: None,
            cloud_ok: None,
            ..record()
        };
        assert!(local_only.to_csv().ends_with(",0,,,,0"));
    }

    #[test]
    fn header_is_written_once() {
        let path = temp_path();
        {
            let mut log = LatencyLog::open(&path).expect("open");
            log.append(&record()).expect("append");
        }
        {
            let mut log = LatencyLog::open(&path).expect("reopen");
            log.append(&record()).expect("append");
        }
        let contents = std::fs::read_to_string(&path).expect("read");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], HEADER);
        assert_eq!(lines.iter().filter(|line| **line == HEADER).count(), 1);
        if let Some(dir) = path.parent() {
            let _ = std::fs::remove_dir_all(dir);
        }
    }
}
