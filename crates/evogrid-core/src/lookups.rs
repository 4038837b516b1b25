//! Precomputed tables built once at startup from a seeded PRNG.
//!
//! Everything the hot path needs from randomness or trigonometry is
//! table-driven: Hamming weights, dispersal vectors, fitness XOR masks,
//! gene-exchange masks, and a ring of pre-rolled random bytes consumed
//! through per-worker cursors.

use rand::{Rng, SeedableRng, rngs::SmallRng};

/// Radian divisor mapping a byte angle onto a full circle.
const ANGLE_SCALE: f64 = 40.5845;

/// Immutable lookup tables shared by every worker.
pub struct Lookups {
    popcount16: Vec<u32>,
    bit64: [u64; 64],
    xormasks: [[u32; 3]; 256],
    dispersal_x: Vec<i32>,
    dispersal_y: Vec<i32>,
    gene_exchange: Vec<u64>,
    rand8: Vec<u8>,
    species_colours: Vec<[u8; 3]>,
    seed: u64,
}

impl std::fmt::Debug for Lookups {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lookups").field("seed", &self.seed).finish()
    }
}

impl Lookups {
    /// Build every table from the provided seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);

        let popcount16 = (0u32..65_536).map(u32::count_ones).collect();

        let mut bit64 = [0u64; 64];
        for (n, mask) in bit64.iter_mut().enumerate() {
            *mask = 1u64 << n;
        }

        // Fitness masks evolve by flipping one random bit per step from a
        // random start, independently per channel, so adjacent environment
        // values score adjacent mask patterns.
        let mut xormasks = [[0u32; 3]; 256];
        for channel in 0..3 {
            xormasks[0][channel] = rng.random::<u32>();
        }
        for n in 1..256 {
            for channel in 0..3 {
                let flip = 1u32 << rng.random_range(0..32u32);
                xormasks[n][channel] = xormasks[n - 1][channel] ^ flip;
            }
        }

        // Dispersal vectors: distance byte biases locally via the square
        // root, angle byte sweeps the circle.
        let mut dispersal_x = vec![0i32; 256 * 256];
        let mut dispersal_y = vec![0i32; 256 * 256];
        for d in 0..256usize {
            let mut r = (65_536.0 / (d as f64 + 1.0)).sqrt() - 16.0;
            if r < 0.0 {
                r = 0.0;
            }
            for theta in 0..256usize {
                let angle = theta as f64 / ANGLE_SCALE;
                dispersal_x[d * 256 + theta] = (r * angle.sin()) as i32;
                dispersal_y[d * 256 + theta] = (r * angle.cos()) as i32;
            }
        }

        let gene_exchange = (0..65_536).map(|_| rng.random::<u64>()).collect();
        let rand8 = (0..65_536).map(|_| rng.random::<u8>()).collect();
        let species_colours = (0..65_536)
            .map(|_| [rng.random::<u8>(), rng.random::<u8>(), rng.random::<u8>()])
            .collect();

        Self {
            popcount16,
            bit64,
            xormasks,
            dispersal_x,
            dispersal_y,
            gene_exchange,
            rand8,
            species_colours,
            seed,
        }
    }

    /// The seed the tables were built from.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Single-bit mask for bit `n` of a genome.
    #[inline]
    #[must_use]
    pub fn bit(&self, n: usize) -> u64 {
        self.bit64[n & 63]
    }

    /// Hamming weight of a 16-bit value via the precomputed table.
    #[inline]
    #[must_use]
    pub fn popcount16(&self, value: u16) -> u32 {
        self.popcount16[value as usize]
    }

    /// Hamming weight of a 32-bit value (two table lookups).
    #[inline]
    #[must_use]
    pub fn popcount32(&self, value: u32) -> u32 {
        self.popcount16((value >> 16) as u16) + self.popcount16(value as u16)
    }

    /// Hamming distance between two full genomes (four table lookups).
    #[inline]
    #[must_use]
    pub fn hamming(&self, a: u64, b: u64) -> u32 {
        let x = a ^ b;
        self.popcount32(x as u32) + self.popcount32((x >> 32) as u32)
    }

    /// Whether two genomes are within `max` Hamming distance, bailing out
    /// after the lower 32 bits when they already exceed it.
    #[inline]
    #[must_use]
    pub fn hamming_within(&self, a: u64, b: u64, max: u32) -> bool {
        let x = a ^ b;
        let lower = self.popcount32(x as u32);
        if lower > max {
            return false;
        }
        lower + self.popcount32((x >> 32) as u32) <= max
    }

    /// Fitness of a genome's coding half against an environment colour.
    ///
    /// Each channel XORs its mask with the lower 32 bits and counts bits;
    /// the summed count is compared to `target` and distances inside
    /// `tolerance` map to a score in `(0, tolerance]`. The upper 32 bits
    /// never contribute.
    #[must_use]
    pub fn fitness(&self, genome: u64, env: [u8; 3], target: u8, tolerance: u8) -> u8 {
        let coding = genome as u32;
        let mut sum = 0u32;
        for channel in 0..3 {
            let mask = self.xormasks[env[channel] as usize][channel];
            sum += self.popcount32(mask ^ coding);
        }
        let distance = (i32::from(target) - sum as i32).unsigned_abs();
        if distance >= u32::from(tolerance) {
            0
        } else {
            tolerance - distance as u8
        }
    }

    /// Dispersal vector for a (distance, angle) byte pair.
    #[inline]
    #[must_use]
    pub fn dispersal(&self, distance: u8, angle: u8) -> (i32, i32) {
        let index = distance as usize * 256 + angle as usize;
        (self.dispersal_x[index], self.dispersal_y[index])
    }

    /// Pre-rolled display colour for a species id.
    #[inline]
    #[must_use]
    pub fn colour(&self, species_id: u64) -> [u8; 3] {
        self.species_colours[(species_id & 0xFFFF) as usize]
    }
}

/// A worker's private position in the pre-rolled random tables.
///
/// Each worker derives its cursor from `(seed, worker, tick, stream)` so
/// the byte sequences consumed by disjoint workers never overlap within a
/// tick and a fixed worker count replays identically.
#[derive(Debug, Clone, Copy)]
pub struct ByteCursor {
    byte_pos: u16,
    mask_pos: u16,
}

impl ByteCursor {
    /// Deterministically derive a cursor for one worker and phase.
    #[must_use]
    pub fn derive(seed: u64, worker: u64, tick: u64, stream: u64) -> Self {
        // splitmix64 finaliser over the mixed inputs
        let mut z = seed
            .wrapping_add(worker.wrapping_mul(0x9E37_79B9_7F4A_7C15))
            .wrapping_add(tick.wrapping_mul(0xBF58_476D_1CE4_E5B9))
            .wrapping_add(stream.wrapping_mul(0x94D0_49BB_1331_11EB));
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        Self {
            byte_pos: z as u16,
            mask_pos: (z >> 16) as u16,
        }
    }

    /// Next pre-rolled byte; the cursor wraps naturally.
    #[inline]
    pub fn rand8(&mut self, lookups: &Lookups) -> u8 {
        let value = lookups.rand8[self.byte_pos as usize];
        self.byte_pos = self.byte_pos.wrapping_add(1);
        value
    }

    /// Next 32-bit value assembled from four pre-rolled bytes.
    #[inline]
    pub fn rand32(&mut self, lookups: &Lookups) -> u32 {
        let mut value = 0u32;
        for shift in [0u32, 8, 16, 24] {
            value |= u32::from(self.rand8(lookups)) << shift;
        }
        value
    }

    /// Next 64-bit value, useful for rolling candidate genomes.
    #[inline]
    pub fn rand64(&mut self, lookups: &Lookups) -> u64 {
        u64::from(self.rand32(lookups)) | (u64::from(self.rand32(lookups)) << 32)
    }

    /// Next gene-exchange mask.
    #[inline]
    pub fn gene_mask(&mut self, lookups: &Lookups) -> u64 {
        let value = lookups.gene_exchange[self.mask_pos as usize];
        self.mask_pos = self.mask_pos.wrapping_add(1);
        value
    }
}
