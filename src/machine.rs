//! Machine model used by the cost estimator and the schedule emitter.

use serde::{Deserialize, Serialize};

use crate::ir::ElemType;

/// Parameters of the machine the pipeline is scheduled for.
///
/// `balance` is the compute-to-memory ratio of the machine: roughly how
/// many arithmetic operations can be retired in the time one value is
/// fetched from main memory. It caps the per-load penalty applied by the
/// cost model as allocation footprints outgrow the last level cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineParams {
    /// Number of parallel workers the schedule should saturate.
    pub parallelism: i64,
    /// Size of the last level cache in bytes.
    pub last_level_cache_size: i64,
    /// Compute-to-memory balance of the machine.
    pub balance: i64,
}

impl Default for MachineParams {
    fn default() -> Self {
        Self {
            parallelism: 16,
            last_level_cache_size: 16 * 1024 * 1024,
            balance: 40,
        }
    }
}

impl MachineParams {
    /// Create machine parameters from explicit values.
    pub fn new(parallelism: i64, last_level_cache_size: i64, balance: i64) -> Self {
        Self {
            parallelism,
            last_level_cache_size,
            balance,
        }
    }
}

/// Description of the target instruction set, reduced to what the
/// scheduler needs: the width of the vector registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    /// Width of a vector register in bits.
    pub vector_bits: u32,
}

impl Default for Target {
    fn default() -> Self {
        Self { vector_bits: 128 }
    }
}

impl Target {
    /// Create a target with the given vector register width.
    pub fn new(vector_bits: u32) -> Self {
        Self { vector_bits }
    }

    /// Number of lanes of `ty` that fit in one vector register.
    pub fn natural_vector_size(&self, ty: ElemType) -> i64 {
        let lanes = (self.vector_bits as i64 / 8) / ty.bytes();
        lanes.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_natural_vector_size() {
        let t = Target::default();
        assert_eq!(t.natural_vector_size(ElemType::Float32), 4);
        assert_eq!(t.natural_vector_size(ElemType::UInt8), 16);

        let wide = Target::new(256);
        assert_eq!(wide.natural_vector_size(ElemType::Float32), 8);
    }

    #[test]
    fn test_machine_params_defaults() {
        let m = MachineParams::default();
        assert_eq!(m.parallelism, 16);
        assert!(m.last_level_cache_size > m.balance);
    }
}
