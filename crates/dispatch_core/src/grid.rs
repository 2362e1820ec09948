use rand::Rng;
use serde::{Deserialize, Serialize};

/// Integer grid coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Coord {
    pub x: i32,
    pub y: i32,
}

impl Coord {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// `|dx| + |dy|`, the only cost metric used for pairing. Widened so any
    /// pair of `i32` coordinates fits.
    pub fn manhattan(self, other: Coord) -> u64 {
        u64::from(self.x.abs_diff(other.x)) + u64::from(self.y.abs_diff(other.y))
    }

    /// One axis-aligned cell toward `target`, x first.
    pub fn step_toward(self, target: Coord) -> Coord {
        if self.x != target.x {
            Coord::new(step(self.x, target.x), self.y)
        } else if self.y != target.y {
            Coord::new(self.x, step(self.y, target.y))
        } else {
            self
        }
    }
}

fn step(from: i32, to: i32) -> i32 {
    if from < to {
        from + 1
    } else {
        from - 1
    }
}

/// Bounds of the operating area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grid {
    pub width: i32,
    pub height: i32,
}

impl Grid {
    pub const fn new(width: i32, height: i32) -> Self {
        Self { width, height }
    }

    pub fn contains(&self, coord: Coord) -> bool {
        (0..self.width).contains(&coord.x) && (0..self.height).contains(&coord.y)
    }

    pub fn random_coord<R: Rng + ?Sized>(&self, rng: &mut R) -> Coord {
        Coord::new(
            rng.gen_range(0..self.width.max(1)),
            rng.gen_range(0..self.height.max(1)),
        )
    }
}
