//! The phylogeny log: an arena-backed tree of species lifetimes.
//!
//! Nodes are never destroyed during a run; the whole arena is dropped at
//! teardown. Children hold arena keys, parents hold an optional key, and
//! an id hashtable stays in sync on every insertion.

use crate::genome_binary;
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use std::collections::HashMap;

new_key_type! {
    /// Stable handle for phylogeny nodes.
    pub struct LogSpeciesKey;
}

/// Per-snapshot metrics attached to a phylogeny node.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogSpeciesDataItem {
    pub iteration: u64,
    pub size: u32,
    /// Number of distinct genomes.
    pub genomic_diversity: u32,
    pub cells_occupied: u16,
    pub sample_genome: u64,
    /// Larger of the x and y extents of the occupied bounding box.
    pub geographical_range: u8,
    pub centroid_x: u8,
    pub centroid_y: u8,
    /// Mean critter fitness, stored times 1000.
    pub mean_fitness: u16,
    pub min_env: [u8; 3],
    pub max_env: [u8; 3],
    pub mean_env: [u8; 3],
}

impl LogSpeciesDataItem {
    /// An empty data item stamped with an iteration.
    #[must_use]
    pub fn at(iteration: u64) -> Self {
        Self {
            iteration,
            ..Self::default()
        }
    }
}

/// One species' entire temporal existence in the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSpecies {
    pub id: u64,
    pub parent: Option<LogSpeciesKey>,
    pub children: Vec<LogSpeciesKey>,
    pub t_first: u64,
    pub t_last: u64,
    pub max_size: u32,
    pub data_items: Vec<LogSpeciesDataItem>,
}

/// The lineage forest (one root: the founder species).
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Phylogeny {
    arena: SlotMap<LogSpeciesKey, LogSpecies>,
    by_id: HashMap<u64, LogSpeciesKey>,
    root: Option<LogSpeciesKey>,
}

impl Phylogeny {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every node (run teardown / reseed).
    pub fn clear(&mut self) {
        self.arena.clear();
        self.by_id.clear();
        self.root = None;
    }

    /// Number of nodes in the tree.
    #[must_use]
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    /// Key of the founder node, if the tree has been seeded.
    #[must_use]
    pub const fn root(&self) -> Option<LogSpeciesKey> {
        self.root
    }

    /// Visit every node in the arena.
    pub fn iter(&self) -> impl Iterator<Item = (LogSpeciesKey, &LogSpecies)> {
        self.arena.iter()
    }

    /// Key of the node logging `id`.
    #[must_use]
    pub fn key_of(&self, id: u64) -> Option<LogSpeciesKey> {
        self.by_id.get(&id).copied()
    }

    #[must_use]
    pub fn get(&self, key: LogSpeciesKey) -> Option<&LogSpecies> {
        self.arena.get(key)
    }

    #[must_use]
    pub fn get_mut(&mut self, key: LogSpeciesKey) -> Option<&mut LogSpecies> {
        self.arena.get_mut(key)
    }

    /// Seed the tree with the founder species.
    pub fn create_root(&mut self, id: u64, t: u64, size: u32, data: LogSpeciesDataItem) -> LogSpeciesKey {
        self.clear();
        let key = self.arena.insert(LogSpecies {
            id,
            parent: None,
            children: Vec::new(),
            t_first: t,
            t_last: t,
            max_size: size,
            data_items: vec![data],
        });
        self.by_id.insert(id, key);
        self.root = Some(key);
        key
    }

    /// Append a freshly split-off child under `parent`, stamped with an
    /// initial data item at `t`.
    pub fn register_new_child(
        &mut self,
        parent: LogSpeciesKey,
        id: u64,
        t: u64,
        initial_size: u32,
    ) -> LogSpeciesKey {
        let key = self.arena.insert(LogSpecies {
            id,
            parent: Some(parent),
            children: Vec::new(),
            t_first: t,
            t_last: t,
            max_size: initial_size,
            data_items: vec![LogSpeciesDataItem::at(t)],
        });
        if let Some(node) = self.arena.get_mut(parent) {
            node.children.push(key);
        }
        self.by_id.insert(id, key);
        key
    }

    /// Extend a node's lifetime to `t` and append a data item.
    pub fn touch(&mut self, key: LogSpeciesKey, t: u64, data: LogSpeciesDataItem) {
        if let Some(node) = self.arena.get_mut(key) {
            node.t_last = t;
            node.max_size = node.max_size.max(data.size);
            node.data_items.push(data);
        }
    }

    /// Raise a node's max size to at least `size`.
    pub fn note_size(&mut self, key: LogSpeciesKey, size: u32) {
        if let Some(node) = self.arena.get_mut(key) {
            node.max_size = node.max_size.max(size);
        }
    }

    /// Mutable access to a node's most recent data item.
    #[must_use]
    pub fn last_item_mut(&mut self, key: LogSpeciesKey) -> Option<&mut LogSpeciesDataItem> {
        self.arena.get_mut(key)?.data_items.last_mut()
    }

    /// Whether `node` should be dropped from renderings: below the size
    /// floor, and either exclusion may orphan descendants or it has none.
    fn excluded(&self, node: &LogSpecies, min_size: u32, allow_exclude_with_descendants: bool) -> bool {
        node.max_size < min_size && (allow_exclude_with_descendants || node.children.is_empty())
    }

    /// Children surviving the exclusion rule; an excluded child's own
    /// children are spliced into its place (attached to the grandparent).
    fn effective_children(
        &self,
        key: LogSpeciesKey,
        min_size: u32,
        allow_exclude: bool,
    ) -> Vec<LogSpeciesKey> {
        let mut out = Vec::new();
        let Some(node) = self.arena.get(key) else {
            return out;
        };
        for &child_key in &node.children {
            let Some(child) = self.arena.get(child_key) else {
                continue;
            };
            if self.excluded(child, min_size, allow_exclude) {
                out.extend(self.effective_children(child_key, min_size, allow_exclude));
            } else {
                out.push(child_key);
            }
        }
        out
    }

    /// Render the tree as a Newick string. Node labels are species ids,
    /// branch lengths are lifetimes. `None` when the tree is empty.
    #[must_use]
    pub fn newick(&self, min_size: u32, allow_exclude_with_descendants: bool) -> Option<String> {
        let root = self.root?;
        let mut out = self.newick_node(root, min_size, allow_exclude_with_descendants);
        out.push(';');
        Some(out)
    }

    fn newick_node(&self, key: LogSpeciesKey, min_size: u32, allow_exclude: bool) -> String {
        let node = &self.arena[key];
        let children = self.effective_children(key, min_size, allow_exclude);
        let span = node.t_last.saturating_sub(node.t_first);
        if children.is_empty() {
            format!("{}:{}", node.id, span)
        } else {
            let inner: Vec<String> = children
                .iter()
                .map(|&child| self.newick_node(child, min_size, allow_exclude))
                .collect();
            format!("({}){}:{}", inner.join(","), node.id, span)
        }
    }

    /// Dump every retained node's data items as CSV, one row per
    /// (species, snapshot). `None` when the tree is empty.
    #[must_use]
    pub fn dump_csv(&self, min_size: u32, allow_exclude_with_descendants: bool) -> Option<String> {
        let root = self.root?;
        let mut out = String::from(
            "ID,ParentID,generation,size,sample_genome,sample_genome_binary,diversity,\
             cells_occupied,geog_range,centroid_x,centroid_y,mean_fit,\
             min_env_red,min_env_green,min_env_blue,\
             max_env_red,max_env_green,max_env_blue,\
             mean_env_red,mean_env_green,mean_env_blue\n",
        );
        self.dump_node(root, 0, min_size, allow_exclude_with_descendants, &mut out);
        Some(out)
    }

    fn dump_node(
        &self,
        key: LogSpeciesKey,
        parent_id: u64,
        min_size: u32,
        allow_exclude: bool,
        out: &mut String,
    ) {
        use std::fmt::Write as _;

        let node = &self.arena[key];
        for item in &node.data_items {
            let _ = writeln!(
                out,
                "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
                node.id,
                parent_id,
                item.iteration,
                item.size,
                item.sample_genome,
                genome_binary(item.sample_genome),
                item.genomic_diversity,
                item.cells_occupied,
                item.geographical_range,
                item.centroid_x,
                item.centroid_y,
                item.mean_fitness,
                item.min_env[0],
                item.min_env[1],
                item.min_env[2],
                item.max_env[0],
                item.max_env[1],
                item.max_env[2],
                item.mean_env[0],
                item.mean_env[1],
                item.mean_env[2],
            );
        }
        for child in self.effective_children(key, min_size, allow_exclude) {
            self.dump_node(child, node.id, min_size, allow_exclude, out);
        }
    }
}
