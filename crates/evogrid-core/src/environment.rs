//! The keyframed environment colour field.
//!
//! Frames arrive as raw RGB planes (image decoding is the caller's
//! problem) and are sampled to the grid once at load. Between keyframes
//! the current plane can interpolate linearly; at each keyframe boundary
//! the cursor advances according to the configured mode.

use crate::{ConfigError, EnvironmentMode, SimConfig};

/// One raw environment frame as supplied by a frame source.
#[derive(Debug, Clone)]
pub struct EnvFrame {
    width: usize,
    height: usize,
    pixels: Vec<[u8; 3]>,
}

impl EnvFrame {
    /// Wrap a raw RGB plane; `pixels` is row-major `y * width + x`.
    pub fn new(width: usize, height: usize, pixels: Vec<[u8; 3]>) -> Result<Self, ConfigError> {
        if width == 0 || height == 0 || pixels.len() != width * height {
            return Err(ConfigError::InvalidConfig(
                "environment frame dimensions do not match its pixel data",
            ));
        }
        Ok(Self {
            width,
            height,
            pixels,
        })
    }

    /// A frame filled with a single colour.
    #[must_use]
    pub fn filled(width: usize, height: usize, colour: [u8; 3]) -> Self {
        Self {
            width,
            height,
            pixels: vec![colour; width * height],
        }
    }

    #[must_use]
    pub const fn width(&self) -> usize {
        self.width
    }

    #[must_use]
    pub const fn height(&self) -> usize {
        self.height
    }

    /// Sample this frame to the grid: nearest-neighbour rescale when the
    /// frame is smaller than the grid, crop at the grid bounds when it is
    /// larger. Output is column-major `x * grid_y + y` to match the grid.
    fn sample(&self, grid_x: usize, grid_y: usize) -> Vec<[u8; 3]> {
        let mut out = vec![[0u8; 3]; grid_x * grid_y];
        let scale_needed = self.width < grid_x || self.height < grid_y;
        for x in 0..grid_x {
            for y in 0..grid_y {
                let (sx, sy) = if scale_needed {
                    (x * self.width / grid_x, y * self.height / grid_y)
                } else {
                    (x, y)
                };
                out[x * grid_y + y] = self.pixels[sy * self.width + sx];
            }
        }
        out
    }
}

/// The live colour field: three parallel planes plus the keyframe cursor.
#[derive(Debug)]
pub struct Environment {
    grid_x: usize,
    grid_y: usize,
    frames: Vec<Vec<[u8; 3]>>,
    current: Vec<[u8; 3]>,
    last: Vec<[u8; 3]>,
    next: Vec<[u8; 3]>,
    cursor: usize,
    forward: bool,
    countdown: u32,
    change_rate: u32,
    mode: EnvironmentMode,
    interpolate: bool,
    exhausted: bool,
}

impl Environment {
    /// Sample every frame to the grid and load the first keyframe.
    pub fn new(frames: &[EnvFrame], config: &SimConfig) -> Result<Self, ConfigError> {
        if frames.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "at least one environment frame is required",
            ));
        }
        let sampled: Vec<Vec<[u8; 3]>> = frames
            .iter()
            .map(|frame| frame.sample(config.grid_x, config.grid_y))
            .collect();
        let plane = sampled[0].clone();
        let mut env = Self {
            grid_x: config.grid_x,
            grid_y: config.grid_y,
            frames: sampled,
            current: plane.clone(),
            last: plane.clone(),
            next: plane,
            cursor: 0,
            forward: true,
            countdown: config.environment_change_rate.max(1),
            change_rate: config.environment_change_rate,
            mode: config.environment_mode,
            interpolate: config.environment_interpolate,
            exhausted: false,
        };
        env.reload_planes();
        Ok(env)
    }

    /// Current colour at a cell.
    #[inline]
    #[must_use]
    pub fn colour(&self, x: usize, y: usize) -> [u8; 3] {
        self.current[x * self.grid_y + y]
    }

    /// Index of the active keyframe.
    #[must_use]
    pub const fn cursor(&self) -> usize {
        self.cursor
    }

    /// Number of loaded keyframes.
    #[must_use]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Whether the field ever changes.
    #[must_use]
    pub fn is_static(&self) -> bool {
        self.change_rate == 0
            || self.mode == EnvironmentMode::Static
            || self.frames.len() == 1
    }

    /// Rewind to the first keyframe (used on setup and reseed).
    pub fn reset(&mut self) {
        self.cursor = 0;
        self.forward = true;
        self.countdown = self.change_rate.max(1);
        self.exhausted = false;
        self.reload_planes();
    }

    /// Advance one tick. Returns `true` when a once-mode environment has
    /// been exhausted and the simulation should halt.
    pub fn advance(&mut self) -> bool {
        if self.exhausted {
            return true;
        }
        if self.is_static() {
            return false;
        }
        self.countdown -= 1;
        if self.countdown == 0 {
            if self.mode != EnvironmentMode::Bounce && !self.forward {
                self.forward = true;
            }
            if self.forward {
                self.cursor += 1;
                if self.cursor >= self.frames.len() {
                    match self.mode {
                        EnvironmentMode::Once => {
                            self.cursor -= 1;
                            self.exhausted = true;
                            return true;
                        }
                        EnvironmentMode::Loop => self.cursor = 0,
                        EnvironmentMode::Bounce => {
                            // step back past the overrun and turn around
                            self.cursor -= 2;
                            self.forward = false;
                        }
                        EnvironmentMode::Static => unreachable!("static fields never advance"),
                    }
                }
            } else if self.cursor == 0 {
                self.cursor = 1;
                self.forward = true;
            } else {
                self.cursor -= 1;
            }
            self.countdown = self.change_rate;
            self.reload_planes();
        } else if self.interpolate {
            let f = self.countdown as f32 / self.change_rate as f32;
            for index in 0..self.current.len() {
                for channel in 0..3 {
                    let last = f32::from(self.last[index][channel]);
                    let next = f32::from(self.next[index][channel]);
                    self.current[index][channel] =
                        (last * f + next * (1.0 - f) + 0.5) as u8;
                }
            }
        }
        false
    }

    /// Reload `last`/`next`/`current` around the active cursor. The next
    /// plane peeks one keyframe ahead along the travel direction.
    fn reload_planes(&mut self) {
        let count = self.frames.len();
        let next_index = if self.is_static() {
            self.cursor
        } else if self.forward {
            if self.cursor + 1 < count {
                self.cursor + 1
            } else {
                match self.mode {
                    EnvironmentMode::Loop => 0,
                    EnvironmentMode::Bounce => self.cursor - 1,
                    // past the end in once mode the peek target is moot
                    EnvironmentMode::Once | EnvironmentMode::Static => self.cursor,
                }
            }
        } else if self.cursor > 0 {
            self.cursor - 1
        } else {
            1
        };
        self.last.copy_from_slice(&self.frames[self.cursor]);
        self.current.copy_from_slice(&self.frames[self.cursor]);
        self.next.copy_from_slice(&self.frames[next_index]);
    }
}
