use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use serde::Serialize;

use crate::tilebuf::dma::DmaStats;
use crate::tilebuf::stats::TileBufferStats;
use crate::timeq::Cycle;
use crate::traffic::checker::CheckerStats;
use crate::traffic::driver::TrafficStats;

#[derive(Debug, Clone, Serialize)]
pub struct PhaseRecord {
    pub name: String,
    pub start: Cycle,
    pub end: Cycle,
}

#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub cycles: Cycle,
    pub phases: Vec<PhaseRecord>,
    pub tilebuf: TileBufferStats,
    pub dma: DmaStats,
    pub traffic: TrafficStats,
    pub checker: CheckerStats,
    pub ext_reads: u64,
    pub ext_writes: u64,
    pub verified_words: u64,
    pub mismatches: u64,
}

/// Write `summary` as pretty-printed JSON, creating parent directories as needed.
pub fn write_summary(path: &Path, summary: &RunSummary) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("cannot create {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("cannot create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, summary)
        .with_context(|| format!("cannot serialize run summary to {}", path.display()))?;
    writeln!(writer)?;
    writer.flush()?;
    Ok(())
}
