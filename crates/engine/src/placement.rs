//! Choosing which remote root receives new uploads.
//!
//! Utilization is queried once per invocation; nothing is cached between
//! runs since pools fill up between them.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use log::{debug, info, warn};
use regex::Regex;
use crate::error::{PlacementError, RemoteError};
use crate::remote::RemoteTransport;

static PERCENT_REGEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(\d{1,3})%").unwrap());

/// Utilization of one storage pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskUsageStat {
    pub pool_identifier: String,
    pub used_percent: u8,
}

/// A candidate root with the utilization of the pool it lives on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub root: PathBuf,
    pub pool_identifier: String,
    pub used_percent: u8,
}

/// Parse tabular disk usage output: `<identifier> ... <n>% ...` per row.
///
/// The last percentage on a row is the utilization (zpool prints
/// fragmentation before capacity). Rows without a percentage are skipped.
pub fn parse_disk_usage(output: &str) -> Vec<DiskUsageStat> {
    output
        .lines()
        .filter_map(|line| {
            let identifier = line.split_whitespace().next()?;
            let caps = PERCENT_REGEX.captures_iter(line).last()?;
            let used: u8 = caps.get(1)?.as_str().parse().ok()?;
            if used > 100 {
                return None;
            }
            Some(DiskUsageStat {
                pool_identifier: identifier.to_string(),
                used_percent: used,
            })
        })
        .collect()
}

/// Resolved placement for one invocation
#[derive(Debug, Clone)]
pub struct PlacementSelector {
    candidates: Vec<Candidate>,
    default_index: usize,
    existing: Vec<HashSet<String>>,
}

impl PlacementSelector {
    /// Match every root to the pool named inside its path and pick the least used.
    ///
    /// When several pool identifiers occur in a root, the longest wins
    /// (`tank2` over `tank` for `/mnt/tank2/media`). Ties between roots go to
    /// the first configured.
    pub fn from_stats(roots: &[PathBuf], stats: &[DiskUsageStat]) -> Result<Self, PlacementError> {
        if roots.is_empty() {
            return Err(PlacementError::NoRoots);
        }

        let mut candidates = Vec::with_capacity(roots.len());
        for root in roots {
            let root_str = root.to_string_lossy();
            let pool = stats
                .iter()
                .filter(|s| !s.pool_identifier.is_empty() && root_str.contains(s.pool_identifier.as_str()))
                .max_by_key(|s| s.pool_identifier.len())
                .ok_or_else(|| PlacementError::NoMatchingPool(root.clone()))?;
            candidates.push(Candidate {
                root: root.clone(),
                pool_identifier: pool.pool_identifier.clone(),
                used_percent: pool.used_percent,
            });
        }

        let mut default_index = 0;
        for (i, candidate) in candidates.iter().enumerate() {
            if candidate.used_percent < candidates[default_index].used_percent {
                default_index = i;
            }
        }

        Ok(PlacementSelector {
            existing: vec![HashSet::new(); candidates.len()],
            candidates,
            default_index,
        })
    }

    /// Query pool utilization and the current contents of every root
    pub async fn query(
        transport: &dyn RemoteTransport,
        roots: &[PathBuf],
        disk_usage_command: &str,
    ) -> Result<Self, PlacementError> {
        let output = transport.send_command(disk_usage_command).await?;
        let stats = parse_disk_usage(&output);
        debug!("Disk usage: {:?}", stats);

        let mut selector = Self::from_stats(roots, &stats)?;
        for (i, candidate) in selector.candidates.iter().enumerate() {
            // A root that cannot be listed (not created yet) holds nothing.
            let entries = match transport.read_dir(&candidate.root).await {
                Ok(entries) => entries,
                Err(e @ RemoteError::Command { .. }) => {
                    warn!("Treating {} as empty: {}", candidate.root.display(), e);
                    Vec::new()
                }
                Err(e) => return Err(e.into()),
            };
            selector.existing[i] = entries.into_iter().collect();
        }

        let chosen = &selector.candidates[selector.default_index];
        info!(
            "New items go to {} (pool {} at {}%)",
            chosen.root.display(),
            chosen.pool_identifier,
            chosen.used_percent
        );
        Ok(selector)
    }

    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    /// Root receiving items that do not exist anywhere yet
    pub fn default_root(&self) -> &Path {
        &self.candidates[self.default_index].root
    }

    /// Remote path for `relative` (e.g. `Show/Season 01`).
    ///
    /// An item whose top-level directory already exists under a root stays
    /// on that root regardless of utilization.
    pub fn place(&self, relative: &Path) -> PathBuf {
        let top = relative.components().find_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy().into_owned()),
            _ => None,
        });

        if let Some(top) = top {
            for (candidate, entries) in self.candidates.iter().zip(&self.existing) {
                if entries.contains(&top) {
                    debug!("{} already lives on {}", top, candidate.root.display());
                    return candidate.root.join(relative);
                }
            }
        }
        self.default_root().join(relative)
    }
}
