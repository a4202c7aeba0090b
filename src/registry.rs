//! Static station registry: which stations are polled on which line.
//!
//! The registry is built once at startup (either the reference TTC layout or
//! a JSON file) and never mutated afterwards.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

/// Station identifier as understood by the NTAS endpoint.
pub type StationId = u32;

/// Line codes reported in `subwayLine`, indexed by `line number - 1`.
///
/// Lines are numbered 1, 2 and 4, so slot 2 is an empty placeholder.
pub const LINE_CODES: [&str; 4] = ["YUS", "BD", "", "SHEP"];

/// Interchange stations in the reference deployment.
pub const TTC_INTERCHANGES: [StationId; 8] = [9, 10, 22, 30, 47, 48, 50, 64];

/// A subway line, identified by the number the endpoint expects in `subwayLine`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LineId {
    /// Line 1, Yonge-University-Spadina.
    YongeUniversity,
    /// Line 2, Bloor-Danforth.
    BloorDanforth,
    /// Line 4, Sheppard.
    Sheppard,
}

impl LineId {
    pub const ALL: [LineId; 3] = [
        LineId::YongeUniversity,
        LineId::BloorDanforth,
        LineId::Sheppard,
    ];

    pub fn number(self) -> u8 {
        match self {
            LineId::YongeUniversity => 1,
            LineId::BloorDanforth => 2,
            LineId::Sheppard => 4,
        }
    }

    pub fn from_number(n: u8) -> Option<Self> {
        match n {
            1 => Some(LineId::YongeUniversity),
            2 => Some(LineId::BloorDanforth),
            4 => Some(LineId::Sheppard),
            _ => None,
        }
    }

    /// The `subwayLine` code records on this line carry.
    pub fn code(self) -> &'static str {
        LINE_CODES[usize::from(self.number()) - 1]
    }
}

impl fmt::Display for LineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Ordered line → stations mapping plus the interchange set.
#[derive(Debug, Clone)]
pub struct Registry {
    lines: Vec<(LineId, Vec<StationId>)>,
    interchanges: BTreeSet<StationId>,
}

/// On-disk registry layout.
///
/// ```json
/// {
///   "lines": { "1": [1, 2, 3], "2": [33, 34] },
///   "interchanges": [9, 10]
/// }
/// ```
#[derive(Deserialize)]
struct RegistryFile {
    lines: BTreeMap<u8, Vec<StationId>>,
    #[serde(default)]
    interchanges: Vec<StationId>,
}

impl Registry {
    /// Builds a registry from per-line station lists.
    ///
    /// Each line's stations form an ordered set: a repeated station keeps its
    /// first position, and a line given twice gets the union of its lists.
    pub fn new(
        lines: impl IntoIterator<Item = (LineId, Vec<StationId>)>,
        interchanges: impl IntoIterator<Item = StationId>,
    ) -> Self {
        let mut merged: BTreeMap<LineId, (Vec<StationId>, BTreeSet<StationId>)> = BTreeMap::new();
        for (line, stations) in lines {
            let (ordered, seen) = merged.entry(line).or_default();
            for station in stations {
                if seen.insert(station) {
                    ordered.push(station);
                } else {
                    debug!(line = %line, station, "Dropping repeated station");
                }
            }
        }

        Self {
            lines: merged
                .into_iter()
                .map(|(line, (stations, _))| (line, stations))
                .collect(),
            interchanges: interchanges.into_iter().collect(),
        }
    }

    /// The reference TTC deployment.
    pub fn ttc() -> Self {
        Self::new(
            [
                (LineId::YongeUniversity, (1..=32).collect()),
                (LineId::BloorDanforth, (33..=63).collect()),
                (LineId::Sheppard, (64..=68).collect()),
            ],
            TTC_INTERCHANGES,
        )
    }

    /// Loads a registry from a JSON file at `path`.
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read registry file '{path}'"))?;
        Self::from_json(&content).with_context(|| format!("invalid registry file '{path}'"))
    }

    fn from_json(content: &str) -> Result<Self> {
        let file: RegistryFile = serde_json::from_str(content)?;
        let mut lines = Vec::with_capacity(file.lines.len());
        for (number, stations) in file.lines {
            let Some(line) = LineId::from_number(number) else {
                bail!("unknown line {number}");
            };
            lines.push((line, stations));
        }
        Ok(Self::new(lines, file.interchanges))
    }

    pub fn lines(&self) -> impl Iterator<Item = LineId> + '_ {
        self.lines.iter().map(|(line, _)| *line)
    }

    pub fn stations(&self, line: LineId) -> &[StationId] {
        self.lines
            .iter()
            .find(|(l, _)| *l == line)
            .map(|(_, stations)| stations.as_slice())
            .unwrap_or(&[])
    }

    /// Every `(line, station)` pair, in line order then station order.
    pub fn pairs(&self) -> impl Iterator<Item = (LineId, StationId)> + '_ {
        self.lines
            .iter()
            .flat_map(|(line, stations)| stations.iter().map(move |s| (*line, *s)))
    }

    pub fn is_interchange(&self, station: StationId) -> bool {
        self.interchanges.contains(&station)
    }

    /// Number of `(line, station)` pairs.
    pub fn len(&self) -> usize {
        self.lines.iter().map(|(_, stations)| stations.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::ttc()
    }
}
