//! Contention-aware transfer cost model for the CXL/DRAM hierarchy.
//!
//! For every base column a group reads, the model compares the stall time
//! operators would pay reading the column over the contended CXL link
//! against the cost of first copying it into local DRAM and reading it
//! there. The key inputs:
//!
//! - **Execution depth**: an operator's longest path from a leaf. Reads at
//!   the same depth across all groups compete for CXL bandwidth at roughly
//!   the same time, so the system-wide load profile buckets demand by
//!   depth.
//! - **Contended bandwidth**: a column's fair share of the link at depth
//!   `d` is `cxl_bw · S / max(S, bytes_at_depth[d])`, clamped below by a
//!   floor so costs stay finite.
//! - **Aggressiveness**: `log2` of the mean demand-to-size ratio over the
//!   column's depths. Heavier contention both shrinks the share of the
//!   background copy that lands on the critical path (plenty of other work
//!   to overlap with) and lowers the selection thresholds.
//!
//! Selection keeps columns of at least one chunk that are read at least
//! twice and whose saving clears both an absolute floor
//! (`5 ms · e^(-0.6·a)`) and a relative one (`20% · e^(-0.6·a)`).
//!
//! Groups are processed heaviest first; after each group the load profile
//! is mutated - the staged column's reads leave their depths, and the copy
//! itself is charged at depth 0 where it competes with leaf operators - so
//! later groups decide against an updated picture.
//!
//! All hardware numbers are configuration, calibrated by default to
//! bandwidth/latency measurements of a two-socket host with a CXL memory
//! device.

use crate::utils::OrdF64;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Default staging chunk: 4 MiB.
pub const DEFAULT_CHUNK_BYTES: u64 = 4 * 1024 * 1024;

/// Measured hardware parameters of the memory hierarchy.
#[derive(Clone, Copy, Debug)]
pub struct HardwareConfig {
    /// Host -> CXL device link.
    pub cxl_bandwidth_gbps: f64,
    pub cxl_latency_ns: f64,
    /// Local DRAM on the executing socket.
    pub dram_bandwidth_gbps: f64,
    pub dram_latency_ns: f64,
    /// Streaming CXL -> DRAM copy; bottlenecked by the CXL read side.
    pub copy_bandwidth_gbps: f64,
    pub copy_setup_ns: f64,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            cxl_bandwidth_gbps: 52.5,
            cxl_latency_ns: 320.0,
            dram_bandwidth_gbps: 186.0,
            dram_latency_ns: 120.0,
            copy_bandwidth_gbps: 42.0,
            copy_setup_ns: 500.0,
        }
    }
}

/// `bytes / GB/s` happens to be nanoseconds directly (the 1e9 cancels).
#[inline]
fn bytes_to_ns(bytes: f64, bandwidth_gbps: f64) -> f64 {
    bytes / bandwidth_gbps
}

/// System-wide CXL demand bucketed by execution depth.
#[derive(Clone, Debug, Default)]
pub struct LoadProfile {
    pub bytes_at_depth: HashMap<u32, u64>,
}

impl LoadProfile {
    pub fn demand_at(&self, depth: u32) -> u64 {
        self.bytes_at_depth.get(&depth).copied().unwrap_or(0)
    }

    pub fn add(&mut self, depth: u32, bytes: u64) {
        *self.bytes_at_depth.entry(depth).or_insert(0) += bytes;
    }

    pub fn remove(&mut self, depth: u32, bytes: u64) {
        if let Some(demand) = self.bytes_at_depth.get_mut(&depth) {
            *demand = demand.saturating_sub(bytes);
        }
    }

    /// The depth carrying the most demand, with its byte count.
    pub fn peak(&self) -> (u32, u64) {
        self.bytes_at_depth
            .iter()
            .max_by_key(|&(_, bytes)| *bytes)
            .map(|(&d, &bytes)| (d, bytes))
            .unwrap_or((0, 0))
    }
}

/// Access pattern of one base column within one group.
#[derive(Clone, Debug, Default)]
pub struct ColumnAccess {
    pub ident: String,
    pub size_bytes: u64,
    pub access_count: usize,
    /// Depth of every reading item, duplicates included.
    pub access_depths: Vec<u32>,
}

impl ColumnAccess {
    fn unique_depths(&self) -> HashSet<u32> {
        if self.access_depths.is_empty() {
            HashSet::from([0])
        } else {
            self.access_depths.iter().copied().collect()
        }
    }
}

/// Cost comparison for one candidate column.
#[derive(Clone, Copy, Debug, Default)]
pub struct CostEstimate {
    pub cost_without_ns: f64,
    pub cost_with_ns: f64,
    pub saving_ns: f64,
}

fn contended_bandwidth(size: f64, demand: u64, hw: &HardwareConfig) -> f64 {
    let total_demand = size.max(demand as f64);
    let bw = hw.cxl_bandwidth_gbps * (size / total_demand);
    bw.clamp(0.001, hw.cxl_bandwidth_gbps)
}

fn aggressiveness(access: &ColumnAccess, load: &LoadProfile) -> f64 {
    let size = access.size_bytes as f64;
    let depths = access.unique_depths();
    let sum_ratio: f64 = depths
        .iter()
        .map(|&d| (load.demand_at(d) as f64 / size).max(1.0))
        .sum();
    let avg_ratio = sum_ratio / depths.len() as f64;
    if avg_ratio > 1.0 {
        avg_ratio.log2()
    } else {
        0.0
    }
}

/// Estimate the stall cost of reading `access` from CXL vs staging it.
pub fn estimate_transfer_cost(
    access: &ColumnAccess,
    load: &LoadProfile,
    chunk_bytes: u64,
    hw: &HardwareConfig,
) -> CostEstimate {
    let size = access.size_bytes as f64;
    if size <= 0.0 || access.access_count == 0 {
        return CostEstimate::default();
    }
    let chunk = chunk_bytes.min(access.size_bytes) as f64;
    let depths = access.unique_depths();
    let aggr = aggressiveness(access, load);

    // Without staging: a first-chunk stall from contended CXL per unique
    // depth.
    let cost_without: f64 = depths
        .iter()
        .map(|&d| {
            let bw = contended_bandwidth(size, load.demand_at(d), hw);
            bytes_to_ns(chunk, bw) + hw.cxl_latency_ns
        })
        .sum();

    // With staging: the copy's own first chunk competes at depth 0, the
    // residue overlaps with running operators except for an interference
    // fraction that decays with contention, and operators then stall on
    // DRAM instead.
    let copy_bw = contended_bandwidth(size, load.demand_at(0), hw);
    let first_chunk = hw.copy_setup_ns + bytes_to_ns(chunk, copy_bw) + hw.cxl_latency_ns;
    let residue = (size - chunk).max(0.0);
    let interference = 0.30 * (-1.2 * aggr).exp() * bytes_to_ns(residue, hw.copy_bandwidth_gbps);
    let dram_stalls: f64 = depths
        .iter()
        .map(|_| bytes_to_ns(chunk, hw.dram_bandwidth_gbps) + hw.dram_latency_ns)
        .sum();

    let cost_with = first_chunk + interference + dram_stalls;
    let saving = cost_without - cost_with;
    CostEstimate {
        cost_without_ns: cost_without,
        cost_with_ns: cost_with,
        saving_ns: if saving.is_finite() { saving } else { 0.0 },
    }
}

/// Pick the columns of one group worth staging, best saving first.
pub fn select_transfers(
    accesses: &HashMap<String, ColumnAccess>,
    load: &LoadProfile,
    chunk_bytes: u64,
    hw: &HardwareConfig,
) -> Vec<String> {
    let mut candidates: Vec<(String, f64)> = Vec::new();

    for (ident, access) in accesses {
        if access.size_bytes < chunk_bytes || access.access_count < 2 {
            continue;
        }
        let aggr = aggressiveness(access, load);
        // Thresholds decay exponentially with contention rather than
        // flooring at fixed values.
        let min_saving_ns = 5e6 * (-0.6 * aggr).exp();
        let min_improve_ratio = 0.20 * (-0.6 * aggr).exp();

        let estimate = estimate_transfer_cost(access, load, chunk_bytes, hw);
        let improve_ratio = if estimate.cost_without_ns > 0.0 {
            estimate.saving_ns / estimate.cost_without_ns
        } else {
            0.0
        };

        if estimate.saving_ns >= min_saving_ns && improve_ratio >= min_improve_ratio {
            debug!(
                ident,
                size_mib = access.size_bytes / (1024 * 1024),
                accesses = access.access_count,
                saving_ms = estimate.saving_ns / 1e6,
                "transfer candidate"
            );
            candidates.push((ident.clone(), estimate.saving_ns));
        }
    }

    candidates.sort_by_key(|(_, saving)| std::cmp::Reverse(OrdF64(*saving)));
    candidates.into_iter().map(|(ident, _)| ident).collect()
}

/// Decide transfers for every group, heaviest group first, mutating the
/// load profile in between. Returns per-group selections in input order.
pub fn decide_transfers(
    group_accesses: &[HashMap<String, ColumnAccess>],
    load: &mut LoadProfile,
    chunk_bytes: u64,
    hw: &HardwareConfig,
) -> Vec<Vec<String>> {
    let weight = |accesses: &HashMap<String, ColumnAccess>| -> u64 {
        accesses
            .values()
            .map(|a| a.access_count as u64 * a.size_bytes)
            .sum()
    };

    let mut order: Vec<usize> = (0..group_accesses.len()).collect();
    order.sort_by_key(|&g| std::cmp::Reverse(weight(&group_accesses[g])));

    let mut decisions = vec![Vec::new(); group_accesses.len()];
    for g in order {
        let selected = select_transfers(&group_accesses[g], load, chunk_bytes, hw);

        // Staged reads leave their depths; the copy itself reads the full
        // column over CXL once, competing with depth-0 operators.
        for ident in &selected {
            let access = &group_accesses[g][ident];
            for &d in &access.access_depths {
                load.remove(d, access.size_bytes);
            }
            load.add(0, access.size_bytes);
        }
        let (peak_depth, peak_bytes) = load.peak();
        debug!(
            group = g,
            selected = selected.len(),
            peak_depth,
            peak_mib = peak_bytes / (1024 * 1024),
            "group transfer decision"
        );
        decisions[g] = selected;
    }
    decisions
}
