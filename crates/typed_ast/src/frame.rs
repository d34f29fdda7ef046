//! Stack-frame offset allocator

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GrowthDirection {
    Up,
    Down,
}

/// Hands out storage offsets within one frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    initial: i64,
    storage_pointer: i64,
    direction: GrowthDirection,
}

impl Default for Frame {
    fn default() -> Self {
        Self::new(0, GrowthDirection::Up)
    }
}

impl Frame {
    pub fn new(storage_pointer: i64, direction: GrowthDirection) -> Self {
        Self {
            initial: storage_pointer,
            storage_pointer,
            direction,
        }
    }

    /// Reserve `size` words and return the offset of the first
    pub fn allocate(&mut self, size: usize) -> i64 {
        let size = size as i64;
        match self.direction {
            GrowthDirection::Up => {
                let offset = self.storage_pointer;
                self.storage_pointer += size;
                offset
            }
            GrowthDirection::Down => {
                self.storage_pointer -= size;
                self.storage_pointer
            }
        }
    }

    pub fn reset(&mut self) {
        self.storage_pointer = self.initial;
    }

    /// Words allocated so far
    pub fn size(&self) -> usize {
        (self.storage_pointer - self.initial).unsigned_abs() as usize
    }
}
