//! The parallel iteration engine: column-strip metabolism and breeding,
//! then settlement of the offspring nursery.
//!
//! Both phases are fork-join. During the tick each worker owns a disjoint
//! column strip and a disjoint nursery segment, so its cell locks are
//! uncontended and its writes never overlap another worker's. During
//! settlement an offspring may target any cell; the per-cell mutex is the
//! only serialisation point and is held for one scan-insert at a time.

use crate::critter::{CritterTick, NurseryEntry};
use crate::environment::Environment;
use crate::grid::{Cell, Grid};
use crate::lookups::{ByteCursor, Lookups};
use crate::SimConfig;
use rayon::prelude::*;

/// Random-byte stream tags keeping the two phases decorrelated.
const STREAM_TICK: u64 = 0;
const STREAM_SETTLE: u64 = 1;

/// Per-worker results of the metabolise/breed phase.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct WorkerTick {
    pub kills: u32,
    /// Entries written into this worker's nursery segment.
    pub used: usize,
}

/// Aggregated results of the settlement phase.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct SettlePhase {
    pub tries: u32,
    pub settles: u32,
    pub settle_fails: u32,
    pub births: u32,
}

/// Run one metabolise/breed pass over the whole grid, partitioned into
/// `workers` column strips. Offspring are deposited into per-worker
/// segments of `nursery`; the returned vector reports each segment's
/// fill level alongside the worker's kill count.
pub(crate) fn run_tick(
    grid: &Grid,
    env: &Environment,
    lookups: &Lookups,
    config: &SimConfig,
    nursery: &mut [NurseryEntry],
    workers: usize,
    tick: u64,
) -> Vec<WorkerTick> {
    let stride = nursery.len() / workers;
    nursery
        .par_chunks_mut(stride)
        .take(workers)
        .enumerate()
        .map(|(worker, segment)| {
            let mut cursor =
                ByteCursor::derive(lookups.seed(), worker as u64, tick, STREAM_TICK);
            let x0 = worker * grid.width() / workers;
            let x1 = (worker + 1) * grid.width() / workers;
            let mut out = WorkerTick::default();
            let mut breeders: Vec<usize> = Vec::with_capacity(grid.slots_per_cell());
            for x in x0..x1 {
                for y in 0..grid.height() {
                    let mut cell = grid.lock(x, y);
                    tick_cell(
                        &mut cell,
                        x,
                        y,
                        env.colour(x, y),
                        lookups,
                        config,
                        segment,
                        &mut cursor,
                        &mut breeders,
                        &mut out,
                    );
                }
            }
            out
        })
        .collect()
}

#[allow(clippy::too_many_arguments)]
fn tick_cell(
    cell: &mut Cell,
    x: usize,
    y: usize,
    colour: [u8; 3],
    lookups: &Lookups,
    config: &SimConfig,
    segment: &mut [NurseryEntry],
    cursor: &mut ByteCursor,
    breeders: &mut Vec<usize>,
    out: &mut WorkerTick,
) {
    if config.recalculate_fitness && cell.max_used >= 0 {
        let mut total = 0u32;
        let mut max_alive = -1i16;
        for slot in 0..=cell.max_used as usize {
            let critter = &mut cell.slots[slot];
            if critter.age == 0 {
                continue;
            }
            let fitness = critter.recalculate_fitness(colour, lookups, config);
            if fitness > 0 {
                total += u32::from(fitness);
                max_alive = slot as i16;
            } else {
                out.kills += 1;
            }
        }
        cell.total_fitness = total;
        cell.max_used = max_alive;
    }

    if cell.total_fitness == 0 {
        return;
    }
    let add_food = 1 + config.food / cell.total_fitness as i32;

    breeders.clear();
    let mut total = 0u32;
    let mut max_alive = -1i16;
    for slot in 0..=cell.max_used as usize {
        match cell.slots[slot].tick(add_food, config) {
            CritterTick::Empty => {}
            CritterTick::Died => out.kills += 1,
            CritterTick::Alive { breeder } => {
                total += u32::from(cell.slots[slot].fitness);
                max_alive = slot as i16;
                if breeder {
                    breeders.push(slot);
                }
            }
        }
    }
    cell.total_fitness = total;
    cell.max_used = max_alive;
    cell.breed_attempts += breeders.len() as u32;

    if breeders.is_empty() {
        return;
    }
    let divider = (255 / breeders.len()).max(1) as u8;
    for index in 0..breeders.len() {
        let partner = if config.asexual {
            index
        } else {
            (cursor.rand8(lookups) / divider) as usize
        };
        if partner >= breeders.len() {
            // no partner found: refund the breed cost paid at marking
            cell.slots[breeders[index]].energy += config.breed_cost;
            continue;
        }
        let mate = cell.slots[breeders[partner]];
        match cell.slots[breeders[index]].breed(&mate, x as u16, y as u16, lookups, cursor, config)
        {
            Ok(entry) if out.used < segment.len() => {
                segment[out.used] = entry;
                out.used += 1;
            }
            _ => {
                cell.slots[breeders[index]].energy += config.breed_cost;
                cell.breed_fails += 1;
            }
        }
    }
}

/// Drain the nursery segments in parallel, settling each offspring into
/// its target cell under that cell's mutex.
pub(crate) fn run_settlement(
    grid: &Grid,
    env: &Environment,
    lookups: &Lookups,
    config: &SimConfig,
    nursery: &[NurseryEntry],
    used: &[WorkerTick],
    workers: usize,
    tick: u64,
) -> SettlePhase {
    let stride = nursery.len() / workers;
    let results: Vec<SettlePhase> = (0..workers)
        .into_par_iter()
        .map(|worker| {
            let start = worker * stride;
            let entries = &nursery[start..start + used[worker].used];
            let mut cursor =
                ByteCursor::derive(lookups.seed(), worker as u64, tick, STREAM_SETTLE);
            let mut out = SettlePhase::default();
            for entry in entries {
                let Some((x, y)) = target_cell(entry, grid, config, lookups, &mut cursor) else {
                    // dropped off a bounded grid
                    out.settle_fails += 1;
                    continue;
                };
                let mut cell = grid.lock(x, y);
                out.tries += 1;
                for slot in 0..grid.slots_per_cell() {
                    if cell.slots[slot].age != 0 {
                        continue;
                    }
                    let fitness = cell.slots[slot].initialise(
                        entry.genome,
                        env.colour(x, y),
                        entry.species_id,
                        lookups,
                        config,
                    );
                    if fitness > 0 {
                        cell.total_fitness += u32::from(fitness);
                        if slot as i16 > cell.max_used {
                            cell.max_used = slot as i16;
                        }
                        cell.settles += 1;
                        out.settles += 1;
                        out.births += 1;
                    } else {
                        cell.settle_fails += 1;
                        out.settle_fails += 1;
                    }
                    break;
                }
            }
            out
        })
        .collect();

    let mut totals = SettlePhase::default();
    for result in results {
        totals.tries += result.tries;
        totals.settles += result.settles;
        totals.settle_fails += result.settle_fails;
        totals.births += result.births;
    }
    totals
}

/// Resolve an offspring's target cell: uniform in non-spatial mode,
/// otherwise a dispersal throw from the origin, wrapped or dropped at
/// the edges.
fn target_cell(
    entry: &NurseryEntry,
    grid: &Grid,
    config: &SimConfig,
    lookups: &Lookups,
    cursor: &mut ByteCursor,
) -> Option<(usize, usize)> {
    if config.non_spatial {
        let x = ((u64::from(cursor.rand32(lookups)) * grid.width() as u64) >> 32) as usize;
        let y = ((u64::from(cursor.rand32(lookups)) * grid.height() as u64) >> 32) as usize;
        return Some((x, y));
    }
    let distance = cursor.rand8(lookups);
    let angle = cursor.rand8(lookups);
    let (dx, dy) = lookups.dispersal(distance, angle);
    let x = dx / entry.dispersal_div + i32::from(entry.origin_x);
    let y = dy / entry.dispersal_div + i32::from(entry.origin_y);
    if config.toroidal {
        Some((
            x.rem_euclid(grid.width() as i32) as usize,
            y.rem_euclid(grid.height() as i32) as usize,
        ))
    } else if x < 0 || y < 0 || x >= grid.width() as i32 || y >= grid.height() as i32 {
        None
    } else {
        Some((x as usize, y as usize))
    }
}
