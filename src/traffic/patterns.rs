use std::collections::HashMap;

use anyhow::{anyhow, bail};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::tilebuf::subsystem::TileBuffer;
use crate::tilebuf::types::{Addr, RequesterId, TileId};
use crate::traffic::config::{TrafficConfig, TrafficPatternSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatternOp {
    Read,
    Write,
}

impl PatternOp {
    fn short(self) -> &'static str {
        match self {
            Self::Read => "r",
            Self::Write => "w",
        }
    }
}

/// Where the tiles sit in the resident region, as seen by the workload.
#[derive(Debug, Clone, Default)]
pub struct TileLayout {
    pub region_base: Addr,
    pub num_banks: usize,
    /// inclusive `(first, last)` per tile
    pub tiles: Vec<Option<(Addr, Addr)>>,
}

impl TileLayout {
    pub fn of(tilebuf: &TileBuffer) -> Self {
        let num_tiles = tilebuf.config().num_tiles;
        Self {
            region_base: tilebuf.region().base,
            num_banks: tilebuf.config().num_banks,
            tiles: (0..num_tiles).map(|t| tilebuf.tile_range(t)).collect(),
        }
    }

    pub fn range(&self, tile: TileId) -> Option<(Addr, Addr)> {
        self.tiles.get(tile).copied().flatten()
    }
}

#[derive(Debug, Clone)]
enum PatternKind {
    Strided {
        req_stride: u64,
        requester_stride: u64,
    },
    SameBank {
        bank: u64,
    },
    Random {
        min: u64,
        max: u64,
        seed: u64,
    },
}

#[derive(Debug, Clone)]
pub struct CompiledPattern {
    pub name: String,
    pub op: PatternOp,
    pub tile: TileId,
    first: Addr,
    words: u64,
    kind: PatternKind,
}

impl CompiledPattern {
    fn offset(&self, req_idx: u32, requester: RequesterId, num_requesters: usize, layout: &TileLayout) -> u64 {
        let req = req_idx as u64;
        let r = requester as u64;
        match self.kind {
            PatternKind::Strided {
                req_stride,
                requester_stride,
            } => (req * req_stride * num_requesters.max(1) as u64 + r * requester_stride) % self.words,
            PatternKind::SameBank { bank } => {
                let num_banks = layout.num_banks.max(1) as u64;
                let skew = (self.first - layout.region_base) % num_banks;
                let start = (bank + num_banks - skew) % num_banks;
                let slots = self.words.saturating_sub(start).div_ceil(num_banks).max(1);
                start + ((req * num_requesters as u64 + r) % slots) * num_banks
            }
            // served from the precomputed tables
            PatternKind::Random { min, .. } => min % self.words,
        }
    }
}

/// Turns the configured patterns into per-requester word address streams.
#[derive(Debug, Clone, Default)]
pub struct PatternEngine {
    patterns: Vec<CompiledPattern>,
    layout: TileLayout,
    num_requesters: usize,
    reqs_per_pattern: usize,
    random_tables: Vec<Option<Vec<u64>>>, // flattened [requester * reqs_per_pattern + t]
}

impl PatternEngine {
    pub fn new(
        config: &TrafficConfig,
        layout: TileLayout,
        num_requesters: usize,
    ) -> anyhow::Result<Self> {
        let reqs_per_pattern = config.reqs_per_pattern.max(1) as usize;
        let patterns = config
            .patterns
            .iter()
            .enumerate()
            .map(|(idx, spec)| compile_pattern(spec, idx, &layout))
            .collect::<anyhow::Result<Vec<_>>>()?;
        let random_tables = precompute_random_tables(&patterns, num_requesters, reqs_per_pattern);
        Ok(Self {
            patterns,
            layout,
            num_requesters,
            reqs_per_pattern,
            random_tables,
        })
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn reqs_per_pattern(&self) -> usize {
        self.reqs_per_pattern
    }

    pub fn pattern_name(&self, idx: usize) -> Option<&str> {
        self.patterns.get(idx).map(|p| p.name.as_str())
    }

    pub fn pattern(&self, idx: usize) -> Option<&CompiledPattern> {
        self.patterns.get(idx)
    }

    pub fn addr(&self, pattern_idx: usize, req_idx: u32, requester: RequesterId) -> Option<Addr> {
        let pattern = self.patterns.get(pattern_idx)?;
        let offset = self
            .random_offset(pattern_idx, req_idx, requester)
            .unwrap_or_else(|| pattern.offset(req_idx, requester, self.num_requesters, &self.layout));
        Some(pattern.first + offset % pattern.words)
    }

    fn random_offset(&self, pattern_idx: usize, req_idx: u32, requester: RequesterId) -> Option<u64> {
        let table = self.random_tables.get(pattern_idx)?.as_ref()?;
        if requester >= self.num_requesters {
            return None;
        }
        let idx = requester
            .checked_mul(self.reqs_per_pattern)?
            .checked_add(req_idx as usize)?;
        table.get(idx).copied()
    }
}

fn precompute_random_tables(
    patterns: &[CompiledPattern],
    num_requesters: usize,
    reqs_per_pattern: usize,
) -> Vec<Option<Vec<u64>>> {
    let mut tables: Vec<Option<Vec<u64>>> = vec![None; patterns.len()];
    if patterns.is_empty() || num_requesters == 0 {
        return tables;
    }

    // requester-major, then pattern-major; patterns with the same seed and bounds share a stream
    let mut streams: HashMap<(u64, u64, u64), StdRng> = HashMap::new();
    for requester in 0..num_requesters {
        for (pattern_idx, pattern) in patterns.iter().enumerate() {
            let PatternKind::Random { min, max, seed } = pattern.kind else {
                continue;
            };
            let stream = streams
                .entry((seed, min, max))
                .or_insert_with(|| StdRng::seed_from_u64(seed));
            let slot = tables[pattern_idx]
                .get_or_insert_with(|| vec![0; num_requesters * reqs_per_pattern]);
            let row_base = requester * reqs_per_pattern;
            for t in 0..reqs_per_pattern {
                slot[row_base + t] = if max <= min {
                    min
                } else {
                    stream.gen_range(min..max)
                };
            }
        }
    }
    tables
}

fn compile_pattern(
    spec: &TrafficPatternSpec,
    index: usize,
    layout: &TileLayout,
) -> anyhow::Result<CompiledPattern> {
    let (first, last) = layout
        .range(spec.tile)
        .ok_or_else(|| anyhow!("traffic pattern {} targets tile {} outside the region", index, spec.tile))?;
    let words = last - first + 1;
    let op = parse_op(&spec.op)?;

    let kind = match spec.kind.trim().to_ascii_lowercase().as_str() {
        "strided" => PatternKind::Strided {
            req_stride: spec.req_stride.max(1) as u64,
            requester_stride: spec.requester_stride as u64,
        },
        "same_bank" => {
            if spec.bank >= layout.num_banks {
                bail!("traffic pattern {} targets bank {} of {}", index, spec.bank, layout.num_banks);
            }
            PatternKind::SameBank {
                bank: spec.bank as u64,
            }
        }
        "random" => {
            let min = spec.random_min as u64;
            let max = if spec.random_max == 0 {
                words
            } else {
                spec.random_max as u64
            };
            PatternKind::Random {
                min,
                max: max.max(min + 1),
                seed: spec.seed,
            }
        }
        other => bail!(
            "unsupported traffic pattern kind '{}' at index {} (expected strided|same_bank|random)",
            other,
            index
        ),
    };

    let name = if spec.name.is_empty() {
        default_pattern_name(&kind, spec.tile, op)
    } else {
        spec.name.clone()
    };

    Ok(CompiledPattern {
        name,
        op,
        tile: spec.tile,
        first,
        words,
        kind,
    })
}

fn parse_op(op: &str) -> anyhow::Result<PatternOp> {
    match op.trim().to_ascii_lowercase().as_str() {
        "read" | "r" => Ok(PatternOp::Read),
        "write" | "w" => Ok(PatternOp::Write),
        other => bail!("unsupported traffic op '{}'; expected read/write", other),
    }
}

fn default_pattern_name(kind: &PatternKind, tile: TileId, op: PatternOp) -> String {
    let base = match kind {
        PatternKind::Strided {
            req_stride,
            requester_stride,
        } => format!("strided({}, {})", req_stride, requester_stride),
        PatternKind::SameBank { bank } => format!("same_bank({})", bank),
        PatternKind::Random { seed, .. } => format!("random({})", seed),
    };
    format!("{}@t{}_{}", base, tile, op.short())
}
