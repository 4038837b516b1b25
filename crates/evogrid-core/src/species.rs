//! Species identification: grouping genomes by Hamming-distance
//! connectivity and tracking lineage continuity across iterations.
//!
//! Two algorithms sit behind [`SpeciesIdentifier`]: the genealogical
//! splitter (union-find inside each existing species, the primary
//! variant) and the legacy modal-genome grouper with history matching.
//! Both run single-threaded; the tick engine joins before either starts.

use crate::environment::Environment;
use crate::grid::Grid;
use crate::lookups::Lookups;
use crate::phylogeny::{LogSpeciesDataItem, LogSpeciesKey, Phylogeny};
use crate::{MAX_GENOME_COUNT, SimConfig, SpeciesError, SpeciesMode, StatusSink};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Sentinel for a species whose origin time has not been assigned yet.
const ORIGIN_UNSET: u64 = u64::MAX;

/// Working record for one extant species.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Species {
    pub id: u64,
    pub parent_id: u64,
    /// A representative genome.
    pub type_genome: u64,
    /// Live critter count at the last identification.
    pub size: i32,
    pub origin_time: u64,
    /// Transient id used by the modal grouper; -1 otherwise.
    pub internal_id: i32,
    /// Phylogeny node, when a lineage tree is maintained.
    pub log: Option<LogSpeciesKey>,
}

impl Species {
    /// A species with no population data yet.
    #[must_use]
    pub fn new(id: u64, origin_time: u64) -> Self {
        Self {
            id,
            parent_id: 0,
            type_genome: 0,
            size: 0,
            origin_time,
            internal_id: -1,
            log: None,
        }
    }
}

/// Shared state handed to an identifier for one pass.
pub struct IdentifyContext<'a> {
    pub lookups: &'a Lookups,
    pub config: &'a SimConfig,
    pub phylogeny: &'a mut Phylogeny,
    pub next_species_id: &'a mut u64,
    pub iteration: u64,
    pub mode: SpeciesMode,
    pub status: &'a mut dyn StatusSink,
}

/// Capability shared by the identifier variants: consume the grid and the
/// previous species list, produce the new list, and rewrite critter
/// species ids in place.
pub trait SpeciesIdentifier: Send {
    fn identify(
        &mut self,
        grid: &mut Grid,
        env: &Environment,
        old_list: &[Species],
        ctx: &mut IdentifyContext<'_>,
    ) -> Result<Vec<Species>, SpeciesError>;
}

#[inline]
const fn pack(x: usize, y: usize, slot: usize) -> u32 {
    (x as u32) * 65_536 + (y as u32) * 256 + slot as u32
}

#[inline]
const fn unpack(packed: u32) -> (usize, usize, usize) {
    (
        (packed / 65_536) as usize,
        ((packed % 65_536) / 256) as usize,
        (packed % 256) as usize,
    )
}

/// Chase a group code to its root, compressing the walked path.
fn find(parent: &mut [i32], code: i32) -> i32 {
    let mut root = code;
    while parent[root as usize] != root {
        root = parent[root as usize];
    }
    let mut cursor = code;
    while parent[cursor as usize] != root {
        let next = parent[cursor as usize];
        parent[cursor as usize] = root;
        cursor = next;
    }
    root
}

/// Per-species census gathered from the grid in one sweep.
#[derive(Debug, Default)]
struct Census {
    genomes: Vec<u64>,
    index_of: HashMap<u64, usize>,
    /// Positions per genome, packed `x*65536 + y*256 + slot`, parallel
    /// to `genomes`.
    positions: Vec<Vec<u32>>,
}

/// The genealogical splitter: each existing species' genome set is
/// partitioned by union-find under the Hamming threshold; the group with
/// the most distinct genomes keeps the parent id and every other group
/// becomes a new species, written back through the recorded positions.
#[derive(Debug, Default)]
pub struct GenealogicalIdentifier;

impl SpeciesIdentifier for GenealogicalIdentifier {
    fn identify(
        &mut self,
        grid: &mut Grid,
        env: &Environment,
        old_list: &[Species],
        ctx: &mut IdentifyContext<'_>,
    ) -> Result<Vec<Species>, SpeciesError> {
        let max_difference = ctx.config.max_difference;

        // 1. one sweep over the grid: genome sets, positions, sizes
        let mut censuses: BTreeMap<u64, Census> = BTreeMap::new();
        let mut sizes: HashMap<u64, i64> = HashMap::new();
        for x in 0..grid.width() {
            for y in 0..grid.height() {
                let cell = grid.cell_mut(x, y);
                if cell.total_fitness == 0 || cell.max_used < 0 {
                    continue;
                }
                for slot in 0..=cell.max_used as usize {
                    let critter = cell.slots[slot];
                    if critter.age == 0 {
                        continue;
                    }
                    let census = censuses.entry(critter.species_id).or_default();
                    let index = match census.index_of.get(&critter.genome) {
                        Some(&index) => index,
                        None => {
                            let index = census.genomes.len();
                            census.index_of.insert(critter.genome, index);
                            census.genomes.push(critter.genome);
                            census.positions.push(Vec::new());
                            index
                        }
                    };
                    census.positions[index].push(pack(x, y, slot));
                    *sizes.entry(critter.species_id).or_insert(0) += 1;
                }
            }
        }

        let species_total = censuses.len();
        let mut new_list: Vec<Species> = Vec::new();

        // 2. per species: pairwise union-find over its genome set
        for (done, (&species_id, census)) in censuses.iter().enumerate() {
            ctx.status.progress(done + 1, species_total);

            let n = census.genomes.len();
            if n >= MAX_GENOME_COUNT {
                return Err(SpeciesError::GenomeCapacity {
                    species_id,
                    limit: MAX_GENOME_COUNT,
                });
            }
            let log_key = if ctx.mode >= SpeciesMode::Phylogeny {
                Some(
                    ctx.phylogeny
                        .key_of(species_id)
                        .ok_or(SpeciesError::UnknownLogSpecies { species_id })?,
                )
            } else {
                None
            };

            let mut group = vec![-1i32; n];
            let mut parent: Vec<i32> = Vec::new();
            for first in 0..n {
                if group[first] == -1 {
                    let code = parent.len() as i32;
                    parent.push(code);
                    group[first] = code;
                }
                let first_root = find(&mut parent, group[first]);
                group[first] = first_root;
                let first_genome = census.genomes[first];

                for second in first + 1..n {
                    let mut second_root = -1;
                    if group[second] != -1 {
                        second_root = find(&mut parent, group[second]);
                        group[second] = second_root;
                        if second_root == first_root {
                            continue;
                        }
                    }
                    if ctx.lookups.hamming_within(
                        first_genome,
                        census.genomes[second],
                        max_difference,
                    ) {
                        if second_root == -1 {
                            group[second] = first_root;
                        } else {
                            // merge the second group into the first
                            parent[second_root as usize] = first_root;
                        }
                    }
                }
            }
            for code in &mut group {
                *code = find(&mut parent, *code);
            }

            // distinct-genome count per canonical group; the largest keeps
            // the parent id, ties to the lowest code
            let mut counts = vec![0i32; parent.len()];
            for &code in &group {
                counts[code as usize] += 1;
            }
            let mut keep_code = 0i32;
            let mut keep_count = -1i32;
            for (code, &count) in counts.iter().enumerate() {
                if count > keep_count {
                    keep_count = count;
                    keep_code = code as i32;
                }
            }

            // 3. build the new species entries and write back fresh ids
            let mut group_log: HashMap<i32, LogSpeciesKey> = HashMap::new();
            for (code, _) in counts.iter().enumerate().filter(|&(_, &count)| count > 0) {
                let code = code as i32;
                if code == keep_code {
                    let mut kept = old_list
                        .iter()
                        .find(|sp| sp.id == species_id)
                        .cloned()
                        .unwrap_or_else(|| Species::new(species_id, ctx.iteration));
                    if let Some(key) = log_key {
                        kept.log = Some(key);
                        ctx.phylogeny
                            .touch(key, ctx.iteration, LogSpeciesDataItem::at(ctx.iteration));
                        group_log.insert(code, key);
                    }
                    if let Some(index) = (0..n).find(|&i| group[i] == keep_code) {
                        kept.type_genome = census.genomes[index];
                    }
                    new_list.push(kept);
                } else {
                    let new_id = *ctx.next_species_id;
                    *ctx.next_species_id += 1;

                    let mut split_size = 0i64;
                    let mut sample_genome = 0u64;
                    for index in (0..n).filter(|&i| group[i] == code) {
                        let positions = &census.positions[index];
                        split_size += positions.len() as i64;
                        for &packed in positions {
                            let (x, y, slot) = unpack(packed);
                            grid.cell_mut(x, y).slots[slot].species_id = new_id;
                        }
                        sample_genome = census.genomes[index];
                    }
                    sizes.insert(new_id, split_size);
                    *sizes.entry(species_id).or_insert(0) -= split_size;

                    let mut split = Species::new(new_id, ctx.iteration);
                    split.parent_id = species_id;
                    split.type_genome = sample_genome;
                    if let Some(parent_key) = log_key {
                        let child_key = ctx.phylogeny.register_new_child(
                            parent_key,
                            new_id,
                            ctx.iteration,
                            split_size.max(0) as u32,
                        );
                        split.log = Some(child_key);
                        group_log.insert(code, child_key);
                    }
                    new_list.push(split);
                }
            }

            // 4. metrics snapshot per surviving group
            if ctx.mode == SpeciesMode::PhylogenyMetrics {
                for (code, _) in counts.iter().enumerate().filter(|&(_, &count)| count > 0) {
                    let Some(&item_key) = group_log.get(&(code as i32)) else {
                        continue;
                    };
                    let code = code as i32;

                    let mut size = 0u64;
                    let mut diversity = 0u32;
                    let mut sample_genome = 0u64;
                    let mut cells: HashSet<u16> = HashSet::new();
                    let mut sum_fitness = 0u64;
                    let mut sum_x = 0u64;
                    let mut sum_y = 0u64;
                    let mut min_x = i32::MAX;
                    let mut min_y = i32::MAX;
                    let mut max_x = -1i32;
                    let mut max_y = -1i32;
                    let mut min_col = [i32::MAX; 3];
                    let mut max_col = [-1i32; 3];
                    let mut sum_col = [0u64; 3];

                    for index in (0..n).filter(|&i| group[i] == code) {
                        diversity += 1;
                        sample_genome = census.genomes[index];
                        for &packed in &census.positions[index] {
                            let (x, y, slot) = unpack(packed);
                            size += 1;
                            sum_x += x as u64;
                            sum_y += y as u64;
                            min_x = min_x.min(x as i32);
                            min_y = min_y.min(y as i32);
                            max_x = max_x.max(x as i32);
                            max_y = max_y.max(y as i32);
                            sum_fitness += u64::from(grid.cell_mut(x, y).slots[slot].fitness);
                            cells.insert((x as u16) * 256 + y as u16);
                            let colour = env.colour(x, y);
                            for channel in 0..3 {
                                let value = i32::from(colour[channel]);
                                min_col[channel] = min_col[channel].min(value);
                                max_col[channel] = max_col[channel].max(value);
                                sum_col[channel] += u64::from(colour[channel]);
                            }
                        }
                    }
                    if size == 0 {
                        continue;
                    }
                    if let Some(item) = ctx.phylogeny.last_item_mut(item_key) {
                        item.size = size as u32;
                        item.genomic_diversity = diversity;
                        item.sample_genome = sample_genome;
                        item.cells_occupied = cells.len() as u16;
                        item.mean_fitness = ((sum_fitness * 1000) / size) as u16;
                        item.geographical_range = (max_x - min_x).max(max_y - min_y) as u8;
                        item.centroid_x = (sum_x / size) as u8;
                        item.centroid_y = (sum_y / size) as u8;
                        for channel in 0..3 {
                            item.min_env[channel] = min_col[channel] as u8;
                            item.max_env[channel] = max_col[channel] as u8;
                            item.mean_env[channel] = (sum_col[channel] / size) as u8;
                        }
                    }
                }
            }
        }

        // 5. final sizes, plus max-size bookkeeping on the log nodes
        for species in &mut new_list {
            let size = sizes.get(&species.id).copied().unwrap_or(0);
            species.size = size as i32;
            if let Some(key) = species.log {
                ctx.phylogeny.note_size(key, size.max(0) as u32);
            }
        }
        Ok(new_list)
    }
}

/// The legacy modal-genome grouper: a sorted genome census is carved into
/// species seeded from the most common unassigned genome; merges between
/// groups require enough cross links relative to the smaller population;
/// new groups match to old (and archived) species by closest modal
/// genome. It predates the lineage tree and serves basic mode only.
#[derive(Debug, Default)]
pub struct ModalIdentifier {
    /// Species lists from earlier passes, newest first, bounded by
    /// `time_slice_connect - 1`.
    archived: Vec<Vec<Species>>,
}

impl ModalIdentifier {
    /// Insert a genome occurrence into the sorted census.
    fn add_genome(list: &mut Vec<u64>, counts: &mut Vec<i32>, genome: u64) {
        match list.binary_search(&genome) {
            Ok(index) => counts[index] += 1,
            Err(index) => {
                list.insert(index, genome);
                counts.insert(index, 1);
            }
        }
    }
}

impl SpeciesIdentifier for ModalIdentifier {
    fn identify(
        &mut self,
        grid: &mut Grid,
        _env: &Environment,
        old_list: &[Species],
        ctx: &mut IdentifyContext<'_>,
    ) -> Result<Vec<Species>, SpeciesError> {
        let max_difference = ctx.config.max_difference;
        let samples = ctx.config.species_samples;

        // census: sorted genome list with occurrence counts
        let mut genome_list: Vec<u64> = Vec::new();
        let mut genome_count: Vec<i32> = Vec::new();
        for x in 0..grid.width() {
            for y in 0..grid.height() {
                let cell = grid.cell_mut(x, y);
                if cell.total_fitness == 0 || cell.max_used < 0 {
                    continue;
                }
                let mut sampled = 0u32;
                for slot in 0..=cell.max_used as usize {
                    if cell.slots[slot].age == 0 {
                        continue;
                    }
                    Self::add_genome(&mut genome_list, &mut genome_count, cell.slots[slot].genome);
                    sampled += 1;
                    if samples > 0 && sampled >= samples {
                        break;
                    }
                }
            }
        }
        let genome_total = genome_list.len();
        if genome_total >= MAX_GENOME_COUNT {
            return Err(SpeciesError::GenomeCapacity {
                species_id: 0,
                limit: MAX_GENOME_COUNT,
            });
        }

        // carve the census into internal species, largest-count seeds first
        let mut species_of = vec![0i32; genome_total];
        let mut species_sizes = vec![0i32]; // slot 0 unused so ids start at 1
        let mut species_type = vec![0usize];
        let mut next_internal = 1i32;
        loop {
            let mut largest = -1i32;
            let mut largest_index = usize::MAX;
            for index in 0..genome_total {
                if species_of[index] == 0 && genome_count[index] > largest {
                    largest = genome_count[index];
                    largest_index = index;
                }
            }
            if largest == -1 {
                break;
            }

            let seed_genome = genome_list[largest_index];
            let mut this_size = 0i32;
            let mut merge_links: BTreeMap<i32, i32> = BTreeMap::new();
            for index in 0..genome_total {
                if !ctx
                    .lookups
                    .hamming_within(seed_genome, genome_list[index], max_difference)
                {
                    continue;
                }
                if species_of[index] > 0 {
                    *merge_links.entry(species_of[index]).or_insert(0) += genome_count[index];
                } else {
                    this_size += genome_count[index];
                    species_of[index] = next_internal;
                }
            }

            // merge linked groups when the links carry enough of the
            // smaller of the two populations
            let mut highest_count = largest;
            let mut highest_index = largest_index;
            for (&to_merge, &links) in &merge_links {
                let use_size = this_size.min(species_sizes[to_merge as usize]);
                if use_size <= 0 {
                    continue;
                }
                if (links * 100) / use_size >= ctx.config.species_sensitivity as i32 {
                    let type_index = species_type[to_merge as usize];
                    if genome_count[type_index] > highest_count {
                        highest_count = genome_count[type_index];
                        highest_index = type_index;
                    }
                    this_size += species_sizes[to_merge as usize];
                    species_sizes[to_merge as usize] = 0;
                    for index in 0..genome_total {
                        if species_of[index] == to_merge {
                            species_of[index] = next_internal;
                        }
                    }
                }
            }

            species_type.push(highest_index);
            species_sizes.push(this_size);
            next_internal += 1;
        }

        // surviving internal groups become candidate species
        let mut new_list: Vec<Species> = Vec::new();
        for internal in 1..species_sizes.len() {
            if species_sizes[internal] > 0 {
                let mut species = Species::new(0, ORIGIN_UNSET);
                species.type_genome = genome_list[species_type[internal]];
                species.internal_id = internal as i32;
                species.size = species_sizes[internal];
                new_list.push(species);
            }
        }

        // match against the old list plus archived slices (deduplicated
        // by id, most recent wins)
        let mut combined: Vec<Species> = old_list.to_vec();
        let mut seen: HashSet<u64> = old_list.iter().map(|sp| sp.id).collect();
        for slice in self
            .archived
            .iter()
            .take(ctx.config.time_slice_connect.saturating_sub(1))
        {
            for species in slice {
                if seen.insert(species.id) {
                    combined.push(species.clone());
                }
            }
        }

        let mut parents: HashMap<usize, usize> = HashMap::new();
        if !combined.is_empty() {
            let mut primary_child: HashMap<usize, usize> = HashMap::new();
            let mut primary_size_diff: HashMap<usize, i32> = HashMap::new();

            for (new_index, candidate) in new_list.iter().enumerate() {
                let mut best_distance = u32::MAX;
                let mut best_size = -1i32;
                let mut closest_old = 0usize;
                for (old_index, old) in combined.iter().enumerate() {
                    let distance = ctx.lookups.hamming(old.type_genome, candidate.type_genome);
                    let better = distance < best_distance
                        || (distance == best_distance && old.size > best_size);
                    if better {
                        best_distance = distance;
                        best_size = old.size;
                        closest_old = old_index;
                    }
                }
                parents.insert(new_index, closest_old);

                let size_diff = (best_size - candidate.size).abs();
                let replace = match primary_size_diff.get(&closest_old) {
                    Some(&previous) => size_diff < previous,
                    None => true,
                };
                if replace {
                    primary_child.insert(closest_old, new_index);
                    primary_size_diff.insert(closest_old, size_diff);
                }
            }

            // the primary child of each old species carries its identity
            for old_index in 0..combined.len() {
                let Some(&new_index) = primary_child.get(&old_index) else {
                    continue;
                };
                let old = &combined[old_index];
                new_list[new_index].id = old.id;
                new_list[new_index].parent_id = old.parent_id;
                new_list[new_index].origin_time = old.origin_time;
                new_list[new_index].log = old.log;
            }

            // everything else is a genuinely new species
            for index in 0..new_list.len() {
                if new_list[index].id == 0 {
                    new_list[index].id = *ctx.next_species_id;
                    *ctx.next_species_id += 1;
                    if let Some(&old_index) = parents.get(&index) {
                        new_list[index].parent_id = combined[old_index].id;
                    }
                    new_list[index].origin_time = ctx.iteration;
                }
            }

            // anagenetic descendants inherit unfilled fields
            for new_index in 0..new_list.len() {
                let Some(&old_index) = parents.get(&new_index) else {
                    continue;
                };
                if new_list[new_index].parent_id == 0 {
                    new_list[new_index].parent_id = combined[old_index].parent_id;
                }
                if new_list[new_index].origin_time == ORIGIN_UNSET {
                    new_list[new_index].origin_time = combined[old_index].origin_time;
                }
            }
        } else {
            // first pass: everything gets a fresh persistent id
            for species in &mut new_list {
                species.id = *ctx.next_species_id;
                *ctx.next_species_id += 1;
                species.origin_time = ctx.iteration;
            }
        }

        // internal id -> persistent id, then write the ids back into the
        // grid through the census
        let mut persistent = vec![0u64; species_sizes.len()];
        for species in &new_list {
            if species.internal_id > 0 {
                persistent[species.internal_id as usize] = species.id;
            }
        }
        for x in 0..grid.width() {
            for y in 0..grid.height() {
                let cell = grid.cell_mut(x, y);
                if cell.max_used < 0 {
                    continue;
                }
                for slot in 0..=cell.max_used as usize {
                    let critter = &mut cell.slots[slot];
                    if critter.age == 0 {
                        continue;
                    }
                    if let Ok(index) = genome_list.binary_search(&critter.genome) {
                        let internal = species_of[index];
                        if internal > 0 && persistent[internal as usize] != 0 {
                            critter.species_id = persistent[internal as usize];
                        }
                    }
                }
            }
        }

        // archive the pass we just consumed
        if !old_list.is_empty() && ctx.config.time_slice_connect > 1 {
            self.archived.insert(0, old_list.to_vec());
            self.archived
                .truncate(ctx.config.time_slice_connect - 1);
        }

        Ok(new_list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::critter::Critter;
    use crate::environment::EnvFrame;
    use crate::{NullStatus, SpeciesAlgorithm};

    fn harness(mode: SpeciesMode) -> (SimConfig, Grid, Environment, Lookups, Phylogeny) {
        let config = SimConfig {
            grid_x: 8,
            grid_y: 8,
            slots_per_square: 4,
            species_mode: mode,
            max_difference: 2,
            ..SimConfig::default()
        };
        let grid = Grid::new(&config).expect("grid");
        let env = Environment::new(&[EnvFrame::filled(1, 1, [128, 128, 128])], &config)
            .expect("environment");
        let lookups = Lookups::new(7);
        (config, grid, env, lookups, Phylogeny::new())
    }

    fn place(grid: &mut Grid, x: usize, y: usize, slot: usize, genome: u64, species_id: u64) {
        let cell = grid.cell_mut(x, y);
        cell.slots[slot] = Critter {
            genome,
            age: 5,
            energy: 100,
            fitness: 3,
            species_id,
        };
        cell.recount();
    }

    fn run(
        identifier: &mut dyn SpeciesIdentifier,
        grid: &mut Grid,
        env: &Environment,
        old_list: &[Species],
        config: &SimConfig,
        lookups: &Lookups,
        phylogeny: &mut Phylogeny,
        next_species_id: &mut u64,
        iteration: u64,
    ) -> Result<Vec<Species>, SpeciesError> {
        let mut status = NullStatus;
        let mut ctx = IdentifyContext {
            lookups,
            config,
            phylogeny,
            next_species_id,
            iteration,
            mode: config.species_mode,
            status: &mut status,
        };
        identifier.identify(grid, env, old_list, &mut ctx)
    }

    fn founder_list(phylogeny: &mut Phylogeny, genome: u64, size: u32) -> Vec<Species> {
        let key = phylogeny.create_root(1, 0, size, LogSpeciesDataItem::at(0));
        let mut founder = Species::new(1, 0);
        founder.type_genome = genome;
        founder.size = size as i32;
        founder.log = Some(key);
        vec![founder]
    }

    #[test]
    fn close_genomes_stay_one_species() {
        let (config, mut grid, env, lookups, mut phylogeny) = harness(SpeciesMode::Phylogeny);
        place(&mut grid, 1, 1, 0, 0b0000, 1);
        place(&mut grid, 1, 1, 1, 0b0001, 1);
        place(&mut grid, 2, 2, 0, 0b0011, 1);
        let old = founder_list(&mut phylogeny, 0, 3);
        let mut next_id = 2;
        let mut identifier = GenealogicalIdentifier;
        let new_list = run(
            &mut identifier,
            &mut grid,
            &env,
            &old,
            &config,
            &lookups,
            &mut phylogeny,
            &mut next_id,
            10,
        )
        .expect("identify");
        assert_eq!(new_list.len(), 1);
        assert_eq!(new_list[0].id, 1);
        assert_eq!(new_list[0].size, 3);
        assert_eq!(next_id, 2);
        let root = phylogeny.root().expect("root");
        assert!(phylogeny.get(root).expect("root").children.is_empty());
        assert_eq!(phylogeny.get(root).expect("root").t_last, 10);
    }

    #[test]
    fn transitive_chains_group_together() {
        let (config, mut grid, env, lookups, mut phylogeny) = harness(SpeciesMode::Basic);
        // 0 -2bits- 0b11 -2bits- 0b1111: pairwise ends are 4 apart but the
        // chain connects them
        place(&mut grid, 0, 0, 0, 0b0000, 1);
        place(&mut grid, 0, 1, 0, 0b0011, 1);
        place(&mut grid, 0, 2, 0, 0b1111, 1);
        let mut founder = Species::new(1, 0);
        founder.type_genome = 0;
        let old = vec![founder];
        let mut next_id = 2;
        let mut identifier = GenealogicalIdentifier;
        let new_list = run(
            &mut identifier,
            &mut grid,
            &env,
            &old,
            &config,
            &lookups,
            &mut phylogeny,
            &mut next_id,
            5,
        )
        .expect("identify");
        assert_eq!(new_list.len(), 1);
        assert_eq!(new_list[0].size, 3);
    }

    #[test]
    fn distant_genomes_split_and_write_back_ids() {
        let (config, mut grid, env, lookups, mut phylogeny) = harness(SpeciesMode::Phylogeny);
        // two distinct close genomes and one far outlier
        place(&mut grid, 0, 0, 0, 0b0000, 1);
        place(&mut grid, 0, 0, 1, 0b0001, 1);
        place(&mut grid, 5, 5, 0, 0xFF00_0000_0000_0000, 1);
        let old = founder_list(&mut phylogeny, 0, 3);
        let mut next_id = 2;
        let mut identifier = GenealogicalIdentifier;
        let new_list = run(
            &mut identifier,
            &mut grid,
            &env,
            &old,
            &config,
            &lookups,
            &mut phylogeny,
            &mut next_id,
            20,
        )
        .expect("identify");
        assert_eq!(new_list.len(), 2);
        let kept = new_list.iter().find(|sp| sp.id == 1).expect("kept");
        let split = new_list.iter().find(|sp| sp.id == 2).expect("split");
        assert_eq!(kept.size, 2);
        assert_eq!(split.size, 1);
        assert_eq!(split.parent_id, 1);
        assert_eq!(split.origin_time, 20);

        // the outlier critter now carries the new id
        assert_eq!(grid.cell_mut(5, 5).slots[0].species_id, 2);
        assert_eq!(grid.cell_mut(0, 0).slots[0].species_id, 1);

        let root = phylogeny.root().expect("root");
        let root_node = phylogeny.get(root).expect("root");
        assert_eq!(root_node.children.len(), 1);
        let child = phylogeny.get(root_node.children[0]).expect("child");
        assert_eq!(child.id, 2);
        assert_eq!(child.t_first, 20);
    }

    #[test]
    fn metrics_mode_fills_data_items() {
        let (mut config, mut grid, env, lookups, mut phylogeny) =
            harness(SpeciesMode::PhylogenyMetrics);
        config.species_mode = SpeciesMode::PhylogenyMetrics;
        place(&mut grid, 2, 3, 0, 0b0000, 1);
        place(&mut grid, 6, 1, 0, 0b0001, 1);
        let old = founder_list(&mut phylogeny, 0, 2);
        let mut next_id = 2;
        let mut identifier = GenealogicalIdentifier;
        run(
            &mut identifier,
            &mut grid,
            &env,
            &old,
            &config,
            &lookups,
            &mut phylogeny,
            &mut next_id,
            30,
        )
        .expect("identify");

        let root = phylogeny.root().expect("root");
        let node = phylogeny.get(root).expect("node");
        let item = node.data_items.last().expect("data item");
        assert_eq!(item.iteration, 30);
        assert_eq!(item.size, 2);
        assert_eq!(item.genomic_diversity, 2);
        assert_eq!(item.cells_occupied, 2);
        // bounding box is 4 wide in x, 2 in y
        assert_eq!(item.geographical_range, 4);
        assert_eq!(item.centroid_x, 4);
        assert_eq!(item.centroid_y, 2);
        assert_eq!(item.mean_fitness, 3000);
        assert_eq!(item.mean_env, [128, 128, 128]);
        assert_eq!(item.min_env, [128, 128, 128]);
    }

    #[test]
    fn missing_log_node_is_a_fatal_invariant() {
        let (config, mut grid, env, lookups, mut phylogeny) = harness(SpeciesMode::Phylogeny);
        place(&mut grid, 0, 0, 0, 0, 99);
        let mut next_id = 100;
        let mut identifier = GenealogicalIdentifier;
        let result = run(
            &mut identifier,
            &mut grid,
            &env,
            &[],
            &config,
            &lookups,
            &mut phylogeny,
            &mut next_id,
            1,
        );
        assert!(matches!(
            result,
            Err(SpeciesError::UnknownLogSpecies { species_id: 99 })
        ));
    }

    #[test]
    fn modal_grouper_carries_ids_across_passes() {
        let (mut config, mut grid, env, lookups, mut phylogeny) = harness(SpeciesMode::Basic);
        config.species_algorithm = SpeciesAlgorithm::Modal;
        config.species_samples = 0; // census everything
        place(&mut grid, 0, 0, 0, 0b0000, 1);
        place(&mut grid, 0, 0, 1, 0b0000, 1);
        place(&mut grid, 0, 1, 0, 0b0001, 1);
        place(&mut grid, 7, 7, 0, 0xFFFF_0000_0000_0000, 1);

        let mut founder = Species::new(1, 0);
        founder.type_genome = 0;
        founder.size = 4;
        let old = vec![founder];
        let mut next_id = 2;
        let mut identifier = ModalIdentifier::default();
        let new_list = run(
            &mut identifier,
            &mut grid,
            &env,
            &old,
            &config,
            &lookups,
            &mut phylogeny,
            &mut next_id,
            50,
        )
        .expect("identify");

        assert_eq!(new_list.len(), 2);
        let carried = new_list.iter().find(|sp| sp.id == 1).expect("carried");
        assert_eq!(carried.size, 3);
        assert_eq!(carried.origin_time, 0);
        let fresh = new_list.iter().find(|sp| sp.id != 1).expect("fresh");
        assert_eq!(fresh.id, 2);
        assert_eq!(fresh.parent_id, 1);
        assert_eq!(fresh.origin_time, 50);
        assert_eq!(fresh.size, 1);

        // ids written back into the grid
        assert_eq!(grid.cell_mut(0, 0).slots[0].species_id, 1);
        assert_eq!(grid.cell_mut(7, 7).slots[0].species_id, 2);

        // a second pass with the same grid keeps both ids stable
        let second = run(
            &mut identifier,
            &mut grid,
            &env,
            &new_list,
            &config,
            &lookups,
            &mut phylogeny,
            &mut next_id,
            60,
        )
        .expect("identify");
        let mut ids: Vec<u64> = second.iter().map(|sp| sp.id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(identifier.archived.len(), 2);
    }

    #[test]
    fn modal_sensitivity_gates_merges() {
        // A=0b0000 and B=0b1111 are 4 bits apart (over the threshold) but
        // both reach C=0b0011. A's group claims C first; B's group then
        // links back through C and merges only when the link mass clears
        // the sensitivity gate.
        let seed_cells = |grid: &mut Grid| {
            for slot in 0..3 {
                place(grid, 1, 1, slot, 0b0000, 1);
            }
            place(grid, 1, 2, 0, 0b0011, 1);
            place(grid, 1, 3, 0, 0b1111, 1);
            place(grid, 1, 3, 1, 0b1111, 1);
        };

        let (mut config, mut grid, env, lookups, mut phylogeny) = harness(SpeciesMode::Basic);
        config.species_samples = 0;
        config.max_difference = 2;
        config.species_sensitivity = 2;
        seed_cells(&mut grid);
        let mut founder = Species::new(1, 0);
        founder.type_genome = 0;
        let mut next_id = 2;
        let mut identifier = ModalIdentifier::default();
        let merged = run(
            &mut identifier,
            &mut grid,
            &env,
            &[founder.clone()],
            &config,
            &lookups,
            &mut phylogeny,
            &mut next_id,
            5,
        )
        .expect("identify");
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].size, 6);

        // raise the bar past the 50% link ratio and the merge is refused
        let (mut config, mut grid, env, lookups, mut phylogeny) = harness(SpeciesMode::Basic);
        config.species_samples = 0;
        config.max_difference = 2;
        config.species_sensitivity = 80;
        seed_cells(&mut grid);
        let mut next_id = 2;
        let mut identifier = ModalIdentifier::default();
        let split = run(
            &mut identifier,
            &mut grid,
            &env,
            &[founder],
            &config,
            &lookups,
            &mut phylogeny,
            &mut next_id,
            5,
        )
        .expect("identify");
        assert_eq!(split.len(), 2);
        let mut sizes: Vec<i32> = split.iter().map(|sp| sp.size).collect();
        sizes.sort_unstable();
        assert_eq!(sizes, vec![2, 4]);
    }
}
