//! Scalar metric sinks and the append-only best-epoch log.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;

pub const TRAIN_TOTAL_LOSS: &str = "train_total_loss";
pub const TRAIN_TRIPLET_LOSS: &str = "train_triplet_loss";
pub const TRAIN_GN_LOSS: &str = "train_gn_loss";
pub const VAL_TOTAL_LOSS: &str = "val_total_loss";
pub const VAL_TRIPLET_LOSS: &str = "val_triplet_loss";
pub const VAL_GN_LOSS: &str = "val_gn_loss";

/// Receives `(tag, value, epoch)` triples.
pub trait ScalarSink {
    fn add_scalar(&mut self, tag: &str, value: f64, epoch: i64) -> Result<()>;
}

/// One line of `scalars.jsonl`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScalarRecord {
    pub tag: String,
    pub epoch: i64,
    pub value: f64,
}

/// Appends one JSON object per scalar to a file.
pub struct JsonlScalarSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlScalarSink {
    /// Open `path` for appending. With `purge_from`, records at or after that
    /// epoch are removed first so a resumed run does not duplicate them.
    pub fn open(path: impl Into<PathBuf>, purge_from: Option<i64>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        if let Some(epoch) = purge_from {
            if path.exists() {
                let kept: Vec<ScalarRecord> = read_scalars(&path)?
                    .into_iter()
                    .filter(|r| r.epoch < epoch)
                    .collect();
                let mut out = BufWriter::new(File::create(&path)?);
                for record in &kept {
                    serde_json::to_writer(&mut out, record)?;
                    out.write_all(b"\n")?;
                }
                out.flush()?;
                tracing::info!(purge_from = epoch, kept = kept.len(), "Purged scalar history");
            }
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ScalarSink for JsonlScalarSink {
    fn add_scalar(&mut self, tag: &str, value: f64, epoch: i64) -> Result<()> {
        let record = ScalarRecord {
            tag: tag.to_string(),
            epoch,
            value,
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Read every record of a `scalars.jsonl` file. Blank lines are skipped.
pub fn read_scalars(path: &Path) -> Result<Vec<ScalarRecord>> {
    let reader = BufReader::new(File::open(path)?);
    let mut records = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

/// Keeps scalars in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub records: Vec<ScalarRecord>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(epoch, value)` pairs for one tag, in insertion order.
    pub fn series(&self, tag: &str) -> Vec<(i64, f64)> {
        self.records
            .iter()
            .filter(|r| r.tag == tag)
            .map(|r| (r.epoch, r.value))
            .collect()
    }
}

impl ScalarSink for MemorySink {
    fn add_scalar(&mut self, tag: &str, value: f64, epoch: i64) -> Result<()> {
        self.records.push(ScalarRecord {
            tag: tag.to_string(),
            epoch,
            value,
        });
        Ok(())
    }
}

/// `best.txt`: one epoch index per line, appended each time validation sets a
/// new best.
#[derive(Debug, Clone)]
pub struct BestEpochLog {
    path: PathBuf,
}

impl BestEpochLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, epoch: usize) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{epoch}")?;
        Ok(())
    }

    /// Logged epochs; empty when the file does not exist yet.
    pub fn read(&self) -> Result<Vec<usize>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut epochs = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let epoch = line.parse::<usize>().map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("bad epoch `{line}` in {}: {e}", self.path.display()),
                )
            })?;
            epochs.push(epoch);
        }
        Ok(epochs)
    }
}
