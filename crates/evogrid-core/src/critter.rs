//! One critter slot: genome, age, energy, fitness, species membership.

use crate::SimConfig;
use crate::lookups::{ByteCursor, Lookups};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Occupant of a single grid slot. Age 0 means the slot is empty.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Critter {
    pub genome: u64,
    pub age: u8,
    pub energy: i32,
    pub fitness: u8,
    pub species_id: u64,
}

/// Outcome of one metabolism step for a single slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CritterTick {
    /// Slot is empty.
    Empty,
    /// Critter survived the tick.
    Alive { breeder: bool },
    /// Critter died this tick (old age); the slot is now empty.
    Died,
}

/// Why a breeding attempt produced no offspring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BreedError {
    #[error("partner too distant")]
    TooDistant,
    #[error("partner belongs to another species")]
    WrongSpecies,
}

/// One offspring record awaiting settlement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NurseryEntry {
    pub genome: u64,
    pub origin_x: u16,
    pub origin_y: u16,
    pub dispersal_div: i32,
    pub species_id: u64,
}

impl Critter {
    /// Initialise this slot with a genome, scoring it against the cell's
    /// environment colour. A non-viable genome leaves the slot empty
    /// (age 0). Returns the computed fitness.
    pub fn initialise(
        &mut self,
        genome: u64,
        env: [u8; 3],
        species_id: u64,
        lookups: &Lookups,
        config: &SimConfig,
    ) -> u8 {
        let fitness = lookups.fitness(genome, env, config.target, config.settle_tolerance);
        self.genome = genome;
        self.species_id = species_id;
        self.fitness = fitness;
        if fitness == 0 {
            self.age = 0;
            self.energy = 0;
        } else {
            self.age = config.start_age;
            self.energy = i32::from(fitness) * config.energy_scale;
        }
        fitness
    }

    /// Re-score fitness in place against a (possibly changed) environment
    /// colour. A score of zero kills the critter.
    pub fn recalculate_fitness(
        &mut self,
        env: [u8; 3],
        lookups: &Lookups,
        config: &SimConfig,
    ) -> u8 {
        let fitness = lookups.fitness(self.genome, env, config.target, config.settle_tolerance);
        self.fitness = fitness;
        if fitness == 0 {
            self.age = 0;
        }
        fitness
    }

    /// One metabolism step: gain energy in proportion to fitness and the
    /// cell's food share, then age. Marking as a breeder deducts the
    /// breed cost up front; failed attempts refund it later.
    pub fn tick(&mut self, add_food: i32, config: &SimConfig) -> CritterTick {
        if self.age == 0 {
            return CritterTick::Empty;
        }
        self.energy += i32::from(self.fitness) * add_food;
        self.age = self.age.saturating_add(1);
        if u32::from(self.age) > config.lifespan {
            self.age = 0;
            self.fitness = 0;
            return CritterTick::Died;
        }
        let breeder =
            u32::from(self.age) >= config.breed_threshold && self.energy >= config.breed_cost;
        if breeder {
            self.energy -= config.breed_cost;
        }
        CritterTick::Alive { breeder }
    }

    /// Synthesise a child genome with `mate` and package it as a nursery
    /// record. The caller refunds the breed cost on failure.
    pub fn breed(
        &self,
        mate: &Critter,
        origin_x: u16,
        origin_y: u16,
        lookups: &Lookups,
        cursor: &mut ByteCursor,
        config: &SimConfig,
    ) -> Result<NurseryEntry, BreedError> {
        if config.breed_species && mate.species_id != self.species_id {
            return Err(BreedError::WrongSpecies);
        }
        if config.breed_differ && lookups.hamming(self.genome, mate.genome) >= config.max_difference
        {
            return Err(BreedError::TooDistant);
        }

        let mut genome = if config.asexual || mate.genome == self.genome {
            self.genome
        } else {
            let mask = cursor.gene_mask(lookups);
            (self.genome & mask) | (mate.genome & !mask)
        };
        if cursor.rand8(lookups) < config.mutate {
            genome ^= lookups.bit(cursor.rand8(lookups) as usize & 63);
        }

        Ok(NurseryEntry {
            genome,
            origin_x,
            origin_y,
            dispersal_div: config.dispersal,
            species_id: self.species_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn viable_setup(seed: u64) -> (Lookups, SimConfig, u64, [u8; 3]) {
        let config = SimConfig::default();
        let env = [200, 60, 10];
        for candidate in 0..1_000u64 {
            let lookups = Lookups::new(seed + candidate);
            let mut cursor = ByteCursor::derive(seed + candidate, 0, 0, 0);
            for _ in 0..10_000 {
                let genome = cursor.rand64(&lookups);
                if lookups.fitness(genome, env, config.target, config.settle_tolerance) > 0 {
                    return (lookups, config, genome, env);
                }
            }
        }
        unreachable!("no viable genome found for test setup");
    }

    #[test]
    fn initialise_fills_or_clears_the_slot() {
        let (lookups, config, genome, env) = viable_setup(10);
        let mut critter = Critter::default();
        let fitness = critter.initialise(genome, env, 7, &lookups, &config);
        assert!(fitness > 0);
        assert_eq!(critter.age, config.start_age);
        assert_eq!(critter.species_id, 7);
        assert_eq!(critter.energy, i32::from(fitness) * config.energy_scale);

        // find a non-viable genome for the same environment and check the
        // slot stays empty
        let mut cursor = ByteCursor::derive(11, 1, 0, 0);
        let dead_genome = loop {
            let candidate = cursor.rand64(&lookups);
            if lookups.fitness(candidate, env, config.target, config.settle_tolerance) == 0 {
                break candidate;
            }
        };
        let mut empty = Critter::default();
        assert_eq!(empty.initialise(dead_genome, env, 7, &lookups, &config), 0);
        assert_eq!(empty.age, 0);
    }

    #[test]
    fn tick_gains_energy_and_marks_breeders() {
        let (lookups, mut config, genome, env) = viable_setup(20);
        config.breed_threshold = 2;
        config.lifespan = 200;
        config.start_age = 1;
        let mut critter = Critter::default();
        critter.initialise(genome, env, 1, &lookups, &config);
        critter.energy = config.breed_cost;

        // age 1 -> 2, meets both gates, pays the breed cost
        let outcome = critter.tick(0, &config);
        assert_eq!(outcome, CritterTick::Alive { breeder: true });
        assert_eq!(critter.energy, 0);

        // broke now, still alive but no breeding
        assert_eq!(critter.tick(0, &config), CritterTick::Alive { breeder: false });

        let gained = critter.energy;
        critter.tick(10, &config);
        assert_eq!(
            critter.energy - gained,
            i32::from(critter.fitness) * 10
        );
    }

    #[test]
    fn tick_kills_past_lifespan() {
        let (lookups, mut config, genome, env) = viable_setup(30);
        config.lifespan = u32::from(config.start_age) + 1;
        config.breed_threshold = u32::MAX;
        let mut critter = Critter::default();
        critter.initialise(genome, env, 1, &lookups, &config);
        assert!(matches!(critter.tick(1, &config), CritterTick::Alive { .. }));
        assert_eq!(critter.tick(1, &config), CritterTick::Died);
        assert_eq!(critter.age, 0);
        assert_eq!(critter.tick(1, &config), CritterTick::Empty);
    }

    #[test]
    fn asexual_breeding_without_mutation_clones_the_parent() {
        let (lookups, mut config, genome, env) = viable_setup(40);
        config.asexual = true;
        config.mutate = 0;
        let mut parent = Critter::default();
        parent.initialise(genome, env, 3, &lookups, &config);
        let mate = parent;
        let mut cursor = ByteCursor::derive(40, 0, 1, 0);
        let child = parent
            .breed(&mate, 4, 5, &lookups, &mut cursor, &config)
            .expect("breed");
        assert_eq!(child.genome, genome);
        assert_eq!(child.origin_x, 4);
        assert_eq!(child.origin_y, 5);
        assert_eq!(child.species_id, 3);
        assert_eq!(child.dispersal_div, config.dispersal);
    }

    #[test]
    fn sexual_breeding_mixes_both_parents() {
        let (lookups, mut config, genome, env) = viable_setup(50);
        config.mutate = 0;
        config.breed_differ = false;
        let mut parent = Critter::default();
        parent.initialise(genome, env, 3, &lookups, &config);
        let mut mate = parent;
        mate.genome = !genome;
        let mut cursor = ByteCursor::derive(50, 0, 1, 0);
        let child = parent
            .breed(&mate, 0, 0, &lookups, &mut cursor, &config)
            .expect("breed");
        // every child bit comes from one of the two parents
        for bit in 0..64 {
            let mask = 1u64 << bit;
            let from_parent = child.genome & mask == parent.genome & mask;
            let from_mate = child.genome & mask == mate.genome & mask;
            assert!(from_parent || from_mate);
        }
    }

    #[test]
    fn distant_partner_is_rejected() {
        let (lookups, mut config, genome, env) = viable_setup(60);
        config.breed_differ = true;
        config.max_difference = 2;
        let mut parent = Critter::default();
        parent.initialise(genome, env, 3, &lookups, &config);
        let mut mate = parent;
        mate.genome = genome ^ 0xFF00_0000_0000_0000;
        let mut cursor = ByteCursor::derive(60, 0, 1, 0);
        assert_eq!(
            parent.breed(&mate, 0, 0, &lookups, &mut cursor, &config),
            Err(BreedError::TooDistant)
        );

        config.breed_species = true;
        mate.genome = genome;
        mate.species_id = 99;
        assert_eq!(
            parent.breed(&mate, 0, 0, &lookups, &mut cursor, &config),
            Err(BreedError::WrongSpecies)
        );
    }
}
