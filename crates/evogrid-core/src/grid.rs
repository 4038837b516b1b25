//! The cell grid: critter slots plus per-cell aggregates and locks.

use crate::critter::Critter;
use crate::{ConfigError, SimConfig};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// One grid cell: a fixed block of critter slots and the aggregates the
/// tick engine and settlement maintain.
#[derive(Debug, Default)]
pub struct Cell {
    pub slots: Vec<Critter>,
    /// Sum of fitness over alive slots.
    pub total_fitness: u32,
    /// Highest occupied slot index, or -1 when the cell is empty.
    pub max_used: i16,
    pub breed_attempts: u32,
    pub breed_fails: u32,
    pub settles: u32,
    pub settle_fails: u32,
}

impl Cell {
    fn new(slots: usize) -> Self {
        Self {
            slots: vec![Critter::default(); slots],
            total_fitness: 0,
            max_used: -1,
            breed_attempts: 0,
            breed_fails: 0,
            settles: 0,
            settle_fails: 0,
        }
    }

    /// Number of alive slots.
    #[must_use]
    pub fn alive(&self) -> u32 {
        self.slots.iter().filter(|c| c.age > 0).count() as u32
    }

    /// Rebuild `total_fitness` and `max_used` from the slots.
    pub fn recount(&mut self) {
        let mut total = 0u32;
        let mut max_used = -1i16;
        for (index, critter) in self.slots.iter().enumerate() {
            if critter.age > 0 {
                total += u32::from(critter.fitness);
                max_used = index as i16;
            }
        }
        self.total_fitness = total;
        self.max_used = max_used;
    }

    /// Empty every slot and zero the aggregates and counters.
    pub fn reset(&mut self) {
        self.slots.fill(Critter::default());
        self.total_fitness = 0;
        self.max_used = -1;
        self.breed_attempts = 0;
        self.breed_fails = 0;
        self.settles = 0;
        self.settle_fails = 0;
    }
}

/// Fixed-size grid of mutex-guarded cells.
///
/// During the tick phase each worker owns a disjoint column strip so its
/// locks are uncontended; during settlement the per-cell mutex is the
/// only serialisation point, held for a single scan-insert at a time.
#[derive(Debug)]
pub struct Grid {
    width: usize,
    height: usize,
    slots_per_cell: usize,
    cells: Vec<Mutex<Cell>>,
}

impl Grid {
    /// Allocate a grid sized from the validated configuration.
    pub fn new(config: &SimConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let cells = (0..config.grid_x * config.grid_y)
            .map(|_| Mutex::new(Cell::new(config.slots_per_square)))
            .collect();
        Ok(Self {
            width: config.grid_x,
            height: config.grid_y,
            slots_per_cell: config.slots_per_square,
            cells,
        })
    }

    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> usize {
        self.height
    }

    #[must_use]
    pub const fn slots_per_cell(&self) -> usize {
        self.slots_per_cell
    }

    #[inline]
    fn index(&self, x: usize, y: usize) -> usize {
        debug_assert!(x < self.width && y < self.height);
        x * self.height + y
    }

    /// Lock a cell for exclusive access. Poisoning is ignored: a panicked
    /// worker cannot leave the aggregates in a state `recount` cannot fix.
    #[must_use]
    pub fn lock(&self, x: usize, y: usize) -> MutexGuard<'_, Cell> {
        self.cells[self.index(x, y)]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Direct access to a cell through exclusive grid access (no locking).
    #[must_use]
    pub fn cell_mut(&mut self, x: usize, y: usize) -> &mut Cell {
        let index = self.index(x, y);
        self.cells[index]
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Count alive critters across the whole grid.
    #[must_use]
    pub fn count_alive(&mut self) -> u64 {
        let mut alive = 0u64;
        for cell in &mut self.cells {
            alive += u64::from(cell.get_mut().unwrap_or_else(PoisonError::into_inner).alive());
        }
        alive
    }

    /// Reset every cell (used on setup and reseed).
    pub fn reset(&mut self) {
        for cell in &mut self.cells {
            cell.get_mut().unwrap_or_else(PoisonError::into_inner).reset();
        }
    }
}
