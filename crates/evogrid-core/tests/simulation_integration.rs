//! End-to-end scenarios: seeded runs on one worker, checked against the
//! structural invariants after every interesting phase.

use evogrid_core::{
    Critter, EnvFrame, EnvironmentMode, Lookups, SimConfig, Simulation, SpeciesMode, Tick,
};
use std::collections::HashSet;

fn red_frames() -> Vec<EnvFrame> {
    vec![EnvFrame::filled(1, 1, [255, 0, 0])]
}

fn base_config(seed: u64) -> SimConfig {
    SimConfig {
        grid_x: 10,
        grid_y: 10,
        slots_per_square: 10,
        rng_seed: Some(seed),
        worker_threads: Some(1),
        environment_mode: EnvironmentMode::Static,
        ..SimConfig::default()
    }
}

/// Find a table seed under which `genome` survives at `colour`.
fn seed_viable_for(genome: u64, colour: [u8; 3], config: &SimConfig) -> u64 {
    let mut seed = 1u64;
    loop {
        let lookups = Lookups::new(seed);
        if lookups.fitness(genome, colour, config.target, config.settle_tolerance) > 0 {
            return seed;
        }
        seed += 1;
    }
}

/// The cross-cutting invariants from the design: census totals, cell
/// aggregates, species coverage, and phylogeny shape.
fn check_invariants(sim: &mut Simulation) {
    let alive = sim.alive_count();
    assert_eq!(alive, sim.grid_mut().count_alive(), "alive census drifted");

    let width = sim.grid().width();
    let height = sim.grid().height();
    let mut live_species: HashSet<u64> = HashSet::new();
    for x in 0..width {
        for y in 0..height {
            let cell = sim.grid_mut().cell_mut(x, y);
            let total = cell.total_fitness;
            let max_used = cell.max_used;
            for critter in cell.slots.iter().filter(|c| c.age > 0) {
                live_species.insert(critter.species_id);
            }
            cell.recount();
            assert_eq!(cell.total_fitness, total, "total_fitness drifted at ({x},{y})");
            assert_eq!(cell.max_used, max_used, "max_used drifted at ({x},{y})");
        }
    }

    let listed: HashSet<u64> = sim.species().iter().map(|sp| sp.id).collect();
    for id in &live_species {
        assert!(
            listed.contains(id),
            "live species {id} missing from the working list"
        );
    }

    // phylogeny: one root, acyclic parents, sane lifetimes
    if let Some(root) = sim.phylogeny().root() {
        let tree = sim.phylogeny();
        let node_count = tree.iter().count();
        let mut roots = 0;
        for (key, node) in tree.iter() {
            assert!(node.t_last >= node.t_first);
            if node.parent.is_none() {
                roots += 1;
                assert_eq!(key, root);
            } else {
                let parent = tree.get(node.parent.expect("parent")).expect("parent node");
                assert!(parent.t_first <= node.t_first);
            }
            // parent chains terminate well before the arena size
            let mut cursor = node.parent;
            let mut hops = 0;
            while let Some(parent_key) = cursor {
                hops += 1;
                assert!(hops <= node_count, "parent cycle detected");
                cursor = tree.get(parent_key).expect("chain").parent;
            }
        }
        assert_eq!(roots, 1, "phylogeny must have exactly one root");
    }
}

#[test]
fn solo_viability_fills_the_centre_cell() {
    let mut config = base_config(0);
    config.reseed_known = true;
    config.reseed_genome = 0;
    let seed = seed_viable_for(0, [255, 0, 0], &config);
    config.rng_seed = Some(seed);

    let mut sim = Simulation::new(config.clone(), &red_frames()).expect("sim");
    assert_eq!(sim.alive_count(), config.slots_per_square as u64);
    assert_eq!(sim.species()[0].type_genome, 0);

    // every critter sits in the centre cell
    let centre = sim.grid_mut().cell_mut(5, 5);
    assert_eq!(centre.alive() as usize, config.slots_per_square);
    for x in 0..10 {
        for y in 0..10 {
            if (x, y) != (5, 5) {
                assert_eq!(sim.grid_mut().cell_mut(x, y).alive(), 0);
            }
        }
    }
    check_invariants(&mut sim);
}

#[test]
fn stable_census_grows_monotonically_without_mutation() {
    let mut config = base_config(0);
    config.reseed_known = true;
    config.reseed_genome = 0;
    config.rng_seed = Some(seed_viable_for(0, [255, 0, 0], &config));
    config.mutate = 0;
    config.asexual = true;
    config.sexual = false;
    config.lifespan = 255; // ages saturate, nothing dies of old age
    config.species_mode = SpeciesMode::Phylogeny;
    config.species_check_interval = 10;

    let mut sim = Simulation::new(config, &red_frames()).expect("sim");
    let mut previous = sim.alive_count();
    for _ in 0..100 {
        let events = sim.step().expect("step");
        assert!(!events.halted);
        assert_eq!(events.kills, 0);
        let alive = sim.alive_count();
        assert!(alive >= previous, "census shrank from {previous} to {alive}");
        previous = alive;
        assert_eq!(sim.species().len(), 1, "clones must stay one species");
    }
    assert!(previous > 10, "population never grew");
    assert!(previous <= 1_000);

    let root = sim.phylogeny().root().expect("root");
    let node = sim.phylogeny().get(root).expect("root node");
    assert_eq!(node.t_last, 100);
    assert!(node.children.is_empty());
    check_invariants(&mut sim);
}

/// Drop a hand-built critter into the grid for identifier scenarios.
fn place(sim: &mut Simulation, x: usize, y: usize, slot: usize, genome: u64, species_id: u64) {
    let cell = sim.grid_mut().cell_mut(x, y);
    cell.slots[slot] = Critter {
        genome,
        age: 5,
        energy: 100,
        fitness: 1,
        species_id,
    };
    cell.recount();
}

#[test]
fn split_produces_a_child_species_under_the_root() {
    let mut config = base_config(21);
    config.species_mode = SpeciesMode::Phylogeny;
    let mut sim = Simulation::new(config, &red_frames()).expect("sim");

    // replace the founder population with two genomes whose distance
    // (entirely in the non-coding half) exceeds the threshold
    sim.grid_mut().reset();
    place(&mut sim, 0, 0, 0, 0, 1);
    place(&mut sim, 9, 9, 0, 0xFF00_0000_0000_0000, 1);

    sim.run_species_check().expect("identify");

    assert_eq!(sim.species().len(), 2);
    let kept = sim.species().iter().find(|sp| sp.id == 1).expect("kept");
    let split = sim.species().iter().find(|sp| sp.id == 2).expect("split");
    assert_eq!(kept.parent_id, 0);
    assert_eq!(split.parent_id, 1);

    let root = sim.phylogeny().root().expect("root");
    let root_node = sim.phylogeny().get(root).expect("root node");
    assert_eq!(root_node.children.len(), 1);
    let child = sim
        .phylogeny()
        .get(root_node.children[0])
        .expect("child node");
    assert_eq!(child.id, 2);
    assert_eq!(child.parent, Some(root));
}

#[test]
fn three_way_split_hangs_two_children_off_the_root() {
    let mut config = base_config(22);
    config.species_mode = SpeciesMode::Phylogeny;
    let mut sim = Simulation::new(config, &red_frames()).expect("sim");

    sim.grid_mut().reset();
    place(&mut sim, 0, 0, 0, 0, 1);
    place(&mut sim, 4, 4, 0, 0xFF, 1);
    place(&mut sim, 9, 9, 0, 0xFF_0000, 1);

    sim.run_species_check().expect("identify");

    assert_eq!(sim.species().len(), 3);
    let root = sim.phylogeny().root().expect("root");
    let root_node = sim.phylogeny().get(root).expect("root node");
    assert_eq!(root_node.children.len(), 2);
    for &child_key in &root_node.children {
        let child = sim.phylogeny().get(child_key).expect("child");
        assert_eq!(child.parent, Some(root));
        assert!(child.id == 2 || child.id == 3);
    }
    // all three species reference the founder lineage
    for species in sim.species() {
        if species.id != 1 {
            assert_eq!(species.parent_id, 1);
        }
    }
}

#[test]
fn once_mode_environment_halts_the_run() {
    let mut config = base_config(30);
    config.environment_mode = EnvironmentMode::Once;
    config.environment_change_rate = 5;
    config.species_mode = SpeciesMode::Off;
    let frames = vec![
        EnvFrame::filled(1, 1, [255, 0, 0]),
        EnvFrame::filled(1, 1, [0, 255, 0]),
    ];
    config.rng_seed = Some(seed_viable_for(0, [255, 0, 0], &config));
    config.reseed_known = true;
    config.reseed_genome = 0;

    let mut sim = Simulation::new(config, &frames).expect("sim");
    for tick in 1..=9u64 {
        let events = sim.step().expect("step");
        assert!(!events.halted, "halted early at tick {tick}");
    }
    let events = sim.step().expect("step");
    assert!(events.halted);
    assert_eq!(events.tick, Tick(10));
}

#[test]
fn bounce_mode_cycles_the_keyframe_cursor() {
    let mut config = base_config(31);
    config.environment_mode = EnvironmentMode::Bounce;
    config.environment_change_rate = 2;
    config.species_mode = SpeciesMode::Off;
    let frames = vec![
        EnvFrame::filled(1, 1, [255, 0, 0]),
        EnvFrame::filled(1, 1, [0, 255, 0]),
        EnvFrame::filled(1, 1, [0, 0, 255]),
    ];
    config.rng_seed = Some(seed_viable_for(0, [255, 0, 0], &config));
    config.reseed_known = true;
    config.reseed_genome = 0;

    let mut sim = Simulation::new(config, &frames).expect("sim");
    let mut cursors = vec![sim.environment().cursor()];
    for _ in 0..11 {
        let events = sim.step().expect("step");
        assert!(!events.halted, "bounce mode never halts");
        cursors.push(sim.environment().cursor());
    }
    assert_eq!(cursors, vec![0, 0, 1, 1, 2, 2, 1, 1, 0, 0, 1, 1]);
}

#[test]
fn long_run_preserves_every_invariant() {
    let mut config = base_config(77);
    config.species_mode = SpeciesMode::PhylogenyMetrics;
    config.species_check_interval = 25;
    config.logging = true;
    config.toroidal = true;

    let mut sim = Simulation::new(config, &red_frames()).expect("sim");
    for _ in 0..150 {
        let events = sim.step().expect("step");
        assert!(!events.halted);
        if events.species_checked {
            check_invariants(&mut sim);
        }
    }
    check_invariants(&mut sim);

    // the species log grew chronologically
    let log = sim.species_log();
    assert!(!log.is_empty());
    let mut last_time = 0;
    for record in log {
        assert!(record.time >= last_time);
        last_time = record.time;
        assert!(record.current_size >= 0);
    }
}

#[test]
fn transitive_groups_respect_the_hamming_threshold() {
    // after an identifier pass, every pair inside a species is connected
    // through steps of at most max_difference
    let mut config = base_config(88);
    config.species_mode = SpeciesMode::Basic;
    config.species_check_interval = 50;
    let mut sim = Simulation::new(config.clone(), &red_frames()).expect("sim");
    for _ in 0..50 {
        sim.step().expect("step");
    }

    // collect genomes per species and verify connectivity by flood fill
    let lookups = Lookups::new(config.rng_seed.expect("seed"));
    let mut by_species: std::collections::HashMap<u64, HashSet<u64>> =
        std::collections::HashMap::new();
    for x in 0..10 {
        for y in 0..10 {
            let cell = sim.grid_mut().cell_mut(x, y);
            for critter in cell.slots.iter().filter(|c| c.age > 0) {
                by_species
                    .entry(critter.species_id)
                    .or_default()
                    .insert(critter.genome);
            }
        }
    }
    for (species_id, genomes) in by_species {
        let genomes: Vec<u64> = genomes.into_iter().collect();
        if genomes.len() < 2 {
            continue;
        }
        let mut reached = vec![false; genomes.len()];
        let mut stack = vec![0usize];
        reached[0] = true;
        while let Some(index) = stack.pop() {
            for other in 0..genomes.len() {
                if !reached[other]
                    && lookups.hamming_within(
                        genomes[index],
                        genomes[other],
                        config.max_difference,
                    )
                {
                    reached[other] = true;
                    stack.push(other);
                }
            }
        }
        assert!(
            reached.iter().all(|&r| r),
            "species {species_id} is not Hamming-connected"
        );
    }
}
