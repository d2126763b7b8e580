use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Receives scalar series. Failures are the sink's problem, never the loop's.
pub trait MetricsSink: Send {
    fn line_plot(&mut self, step: u64, value: f64, series: &str, split: &str);

    fn flush(&mut self) {}
}

/// Writes every scalar to the debug log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl MetricsSink for LogSink {
    fn line_plot(&mut self, step: u64, value: f64, series: &str, split: &str) {
        debug!("[{}/{}] step {}: {}", split, series, step, value);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarRecord {
    pub step: u64,
    pub value: f64,
    pub series: String,
    pub split: String,
}

/// One JSON object per line.
#[derive(Debug)]
pub struct JsonlSink {
    out: BufWriter<File>,
}

impl JsonlSink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            out: BufWriter::new(File::create(path)?),
        })
    }
}

impl MetricsSink for JsonlSink {
    fn line_plot(&mut self, step: u64, value: f64, series: &str, split: &str) {
        let record = ScalarRecord {
            step,
            value,
            series: series.to_string(),
            split: split.to_string(),
        };
        let written = serde_json::to_writer(&mut self.out, &record)
            .map_err(std::io::Error::from)
            .and_then(|_| self.out.write_all(b"\n"));
        if let Err(e) = written {
            warn!("dropping scalar {}/{}: {}", split, series, e);
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.out.flush() {
            warn!("failed to flush metrics: {}", e);
        }
    }
}
