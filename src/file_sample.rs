//! Posterior sample that spills to a CSV file.
//!
//! Records are appended to the file once more than `max_resident` of them
//! are waiting in memory. The file is only ever opened in append mode: the
//! header is written when the file is created, and every spill adds rows
//! after the existing ones. Rows that were already in the file when it was
//! opened belong to earlier runs and are never read back. Only the most
//! recent `window` records and the running [`SampleSummary`] stay in memory.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use itertools::Itertools;
use tracing::debug;

use crate::sample::{SampleRecord, SampleSummary};

const FIXED_COLUMNS: [&str; 3] = ["ln_pdf", "scale", "scale_uncertainty"];

/// Configuration of a [`FileSample`].
#[derive(Debug, Clone)]
pub struct FileSampleSettings {
    /// CSV file the records are appended to
    pub path: PathBuf,
    /// Number of unwritten records that triggers a spill to disk
    pub max_resident: usize,
    /// Number of recent records kept in memory after a spill
    pub window: usize,
}

impl FileSampleSettings {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_resident: 100_000,
            window: 1000,
        }
    }

    pub fn with_max_resident(mut self, max_resident: usize) -> Self {
        self.max_resident = max_resident;
        self
    }

    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }
}

#[derive(Debug)]
pub struct FileSample {
    settings: FileSampleSettings,
    writer: BufWriter<File>,
    pending: Vec<SampleRecord>,
    window: VecDeque<SampleRecord>,
    summary: SampleSummary,
    columns: Option<usize>,
    header_written: bool,
    /// Data rows written before this instance opened the file
    earlier: usize,
    spilled: u64,
}

impl FileSample {
    /// Open or create the file. Existing rows are kept and new rows are
    /// appended after them, but only the new rows make up this sample.
    pub fn open(settings: FileSampleSettings) -> Result<Self> {
        if let Some(parent) = settings.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create output directory: {:?}", parent)
                })?;
            }
        }

        let (existing_header, earlier) = read_existing(&settings.path)?;
        let columns = match existing_header.as_deref() {
            Some(header) => {
                let names: Vec<&str> = header.split(',').collect();
                if names.len() <= FIXED_COLUMNS.len() || names[..3] != FIXED_COLUMNS {
                    bail!("Unexpected header in sample file {:?}", settings.path);
                }
                Some(names.len() - FIXED_COLUMNS.len())
            }
            None => None,
        };

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&settings.path)
            .with_context(|| format!("Failed to open sample file: {:?}", settings.path))?;

        Ok(Self {
            settings,
            writer: BufWriter::new(file),
            pending: Vec::new(),
            window: VecDeque::new(),
            summary: SampleSummary::default(),
            columns,
            header_written: existing_header.is_some(),
            earlier,
            spilled: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.settings.path
    }

    pub fn summary(&self) -> &SampleSummary {
        &self.summary
    }

    pub(crate) fn summary_mut(&mut self) -> &mut SampleSummary {
        &mut self.summary
    }

    /// Number of records written to disk by this instance.
    pub fn spilled(&self) -> u64 {
        self.spilled
    }

    /// Number of rows from earlier runs that this instance skips.
    pub fn earlier_rows(&self) -> usize {
        self.earlier
    }

    /// Recent records still held in memory.
    pub fn resident(&self) -> impl Iterator<Item = &SampleRecord> {
        self.window.iter()
    }

    pub fn append(&mut self, records: Vec<SampleRecord>) -> Result<()> {
        for record in records {
            let width = *self.columns.get_or_insert(record.candidate.len());
            if record.candidate.len() != width {
                bail!(
                    "Sample file {:?} stores {} values per candidate, got {}",
                    self.settings.path,
                    width,
                    record.candidate.len()
                );
            }
            self.summary.observe(record.ln_pdf);
            self.window.push_back(record.clone());
            if self.window.len() > self.settings.window {
                self.window.pop_front();
            }
            self.pending.push(record);
        }
        if self.pending.len() >= self.settings.max_resident {
            self.spill()?;
        }
        Ok(())
    }

    /// Write all pending records to disk.
    pub fn flush(&mut self) -> Result<()> {
        self.spill()
    }

    fn spill(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        if !self.header_written {
            self.write_header()?;
        }
        for record in self.pending.iter() {
            let row = [record.ln_pdf, record.scale, record.scale_uncertainty]
                .into_iter()
                .chain(record.candidate.iter().copied())
                .map(format_value)
                .join(",");
            writeln!(self.writer, "{}", row)?;
        }
        self.writer
            .flush()
            .with_context(|| format!("Failed to write sample file {:?}", self.settings.path))?;
        let written = self.pending.len();
        self.spilled += written as u64;
        self.pending.clear();
        debug!(
            path = ?self.settings.path,
            written,
            total = self.spilled,
            "spilled samples to disk"
        );
        Ok(())
    }

    fn write_header(&mut self) -> Result<()> {
        let width = self.columns.unwrap_or(0);
        let headers = FIXED_COLUMNS
            .iter()
            .map(|name| name.to_string())
            .chain((0..width).map(|i| format!("m{}", i)))
            .join(",");
        writeln!(self.writer, "{}", headers)?;
        self.header_written = true;
        Ok(())
    }

    /// Read every record of this instance from disk, after writing pending
    /// ones.
    pub fn read_all(&mut self) -> Result<Vec<SampleRecord>> {
        self.flush()?;
        self.read_written()
    }

    /// Read the records this instance has already written to disk.
    pub fn read_written(&self) -> Result<Vec<SampleRecord>> {
        if !self.header_written {
            return Ok(Vec::new());
        }
        let file = File::open(&self.settings.path)
            .with_context(|| format!("Failed to open sample file: {:?}", self.settings.path))?;
        let mut records = Vec::new();
        let mut skip = self.earlier;
        for (number, line) in BufReader::new(file).lines().enumerate().skip(1) {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            if skip > 0 {
                skip -= 1;
                continue;
            }
            let values = line
                .split(',')
                .map(parse_value)
                .collect::<Result<Vec<f64>>>()
                .with_context(|| {
                    format!("Invalid row {} in {:?}", number + 1, self.settings.path)
                })?;
            if values.len() <= FIXED_COLUMNS.len() {
                bail!("Row {} in {:?} is too short", number + 1, self.settings.path);
            }
            records.push(SampleRecord {
                ln_pdf: values[0],
                scale: values[1],
                scale_uncertainty: values[2],
                candidate: values[3..].to_vec(),
            });
        }
        Ok(records)
    }
}

/// The header of an existing file and the number of data rows after it.
fn read_existing(path: &Path) -> Result<(Option<String>, usize)> {
    if !path.exists() {
        return Ok((None, 0));
    }
    let file = File::open(path).with_context(|| format!("Failed to open sample file: {:?}", path))?;
    let mut lines = BufReader::new(file).lines();
    let header = match lines.next() {
        Some(line) => line?.trim_end().to_string(),
        None => return Ok((None, 0)),
    };
    if header.is_empty() {
        return Ok((None, 0));
    }
    let mut rows = 0;
    for line in lines {
        if !line?.is_empty() {
            rows += 1;
        }
    }
    Ok((Some(header), rows))
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NA".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "Inf" } else { "-Inf" }.to_string()
    } else {
        value.to_string()
    }
}

fn parse_value(value: &str) -> Result<f64> {
    Ok(match value {
        "NA" => f64::NAN,
        "Inf" => f64::INFINITY,
        "-Inf" => f64::NEG_INFINITY,
        other => other
            .parse()
            .with_context(|| format!("Not a number: {:?}", other))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(i: usize) -> SampleRecord {
        let ln_pdf = if i % 5 == 0 { f64::NEG_INFINITY } else { -(i as f64) / 7. };
        SampleRecord::new((0..6).map(|k| (i * 6 + k) as f64 / 3.).collect(), ln_pdf)
    }

    #[test]
    fn spills_and_keeps_window() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let settings = FileSampleSettings::new(dir.path().join("run/samples.csv"))
            .with_max_resident(4)
            .with_window(3);
        let mut sample = FileSample::open(settings)?;

        sample.append((0..3).map(record).collect())?;
        assert_eq!(sample.spilled(), 0);
        sample.append((3..10).map(record).collect())?;
        assert_eq!(sample.spilled(), 10);
        assert_eq!(
            sample.resident().cloned().collect::<Vec<_>>(),
            (7..10).map(record).collect::<Vec<_>>()
        );
        assert_eq!(sample.summary().records, 10);

        sample.append(vec![record(10)])?;
        let all = sample.read_all()?;
        assert_eq!(all, (0..11).map(record).collect::<Vec<_>>());

        let content = std::fs::read_to_string(dir.path().join("run/samples.csv"))?;
        let header = content.lines().next().unwrap_or_default();
        assert_eq!(header, "ln_pdf,scale,scale_uncertainty,m0,m1,m2,m3,m4,m5");
        assert!(content.contains("-Inf"));
        Ok(())
    }

    #[test]
    fn reopening_appends() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("samples.csv");

        let mut first = FileSample::open(FileSampleSettings::new(&path))?;
        first.append((0..4).map(record).collect())?;
        first.flush()?;
        drop(first);

        let mut second = FileSample::open(FileSampleSettings::new(&path))?;
        assert_eq!(second.earlier_rows(), 4);
        assert!(second.read_all()?.is_empty());
        second.append((4..6).map(record).collect())?;
        assert_eq!(second.read_all()?, (4..6).map(record).collect::<Vec<_>>());
        assert_eq!(second.summary().records, 2);

        let content = std::fs::read_to_string(&path)?;
        assert_eq!(content.lines().filter(|l| l.starts_with("ln_pdf")).count(), 1);
        assert_eq!(content.lines().count(), 7);
        Ok(())
    }

    #[test]
    fn rejects_mixed_widths() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sample = FileSample::open(FileSampleSettings::new(dir.path().join("s.csv")))?;
        sample.append(vec![record(1)])?;
        assert!(sample
            .append(vec![SampleRecord::new(vec![0.; 12], 0.)])
            .is_err());
        Ok(())
    }
}
