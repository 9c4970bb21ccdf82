//! Shared tag enums: parallelization, memory placement, element types.

/// Parallelization strategy of a loop axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ParallelType {
    #[strum(to_string = "S")]
    Serial,
    #[strum(to_string = "UR")]
    Unroll,
    #[strum(to_string = "V")]
    Vectorize,
    #[strum(to_string = "threadIdx.x")]
    TIDx,
    #[strum(to_string = "threadIdx.y")]
    TIDy,
    #[strum(to_string = "threadIdx.z")]
    TIDz,
    #[strum(to_string = "blockIdx.x")]
    BIDx,
    #[strum(to_string = "blockIdx.y")]
    BIDy,
    #[strum(to_string = "blockIdx.z")]
    BIDz,
}

impl ParallelType {
    /// True for threadIdx-bound axes.
    pub fn is_thread_dim(self) -> bool {
        matches!(self, Self::TIDx | Self::TIDy | Self::TIDz)
    }

    /// True for blockIdx-bound axes.
    pub fn is_block_dim(self) -> bool {
        matches!(self, Self::BIDx | Self::BIDy | Self::BIDz)
    }

    /// Anything that is not a plain serial loop.
    pub fn is_parallel(self) -> bool {
        !matches!(self, Self::Serial)
    }
}

/// Memory space a tensor is allocated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum MemoryType {
    #[strum(to_string = "global")]
    Global,
    #[strum(to_string = "shared")]
    Shared,
    #[strum(to_string = "local")]
    Local,
}

/// Kind of an iteration domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IterType {
    Iteration,
    Broadcast,
    Reduction,
}

/// Element type of a tensor. Only the byte width is consulted during
/// lowering (double-buffer switch sizes are computed in bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum DType {
    #[strum(to_string = "f32")]
    Float32,
    #[strum(to_string = "f16")]
    Float16,
    #[strum(to_string = "bf16")]
    BFloat16,
    #[strum(to_string = "i32")]
    Int32,
    #[strum(to_string = "i64")]
    Int64,
    #[strum(to_string = "bool")]
    Bool,
}

impl DType {
    pub fn bytes(self) -> u64 {
        match self {
            Self::Float32 | Self::Int32 => 4,
            Self::Float16 | Self::BFloat16 => 2,
            Self::Int64 => 8,
            Self::Bool => 1,
        }
    }
}
