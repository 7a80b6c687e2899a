use std::fmt;

// Normalization phase and mode
//
// Both halves of normkit need to agree on what a batch-norm call looks like:
// the executors pick a library mode from the input rank and phase, and the
// symbolic exporter decides how many outputs the IR node declares from the
// phase. Keeping both rules here means there is exactly one place that
// branches on "training".
//
//   rank 2            → PerActivation   (statistics per feature, over N)
//   rank 3..=5        → Spatial         (statistics per channel, over N×spatial)
//   … and training    → SpatialPersistent, if the library is new enough

/// Whether a call updates statistics (training) or only reads them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Training,
    Inference,
}

impl Phase {
    pub fn from_training(training: bool) -> Self {
        if training {
            Phase::Training
        } else {
            Phase::Inference
        }
    }

    pub fn is_training(&self) -> bool {
        matches!(self, Phase::Training)
    }

    /// Number of results the operation produces in this phase.
    ///
    /// Training yields the output, the updated running mean and variance,
    /// and the saved batch mean and inverse std; inference yields only the
    /// output.
    pub fn output_arity(&self) -> usize {
        match self {
            Phase::Training => 5,
            Phase::Inference => 1,
        }
    }
}

/// How the primitives library groups elements when computing statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BatchNormMode {
    /// One mean/variance per feature, reduced over the batch only.
    PerActivation,
    /// One mean/variance per channel, reduced over batch and spatial dims.
    Spatial,
    /// `Spatial` with a faster, persistent-kernel implementation.
    SpatialPersistent,
}

impl BatchNormMode {
    pub fn is_spatial(&self) -> bool {
        !matches!(self, BatchNormMode::PerActivation)
    }
}

impl fmt::Display for BatchNormMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BatchNormMode::PerActivation => "per_activation",
            BatchNormMode::Spatial => "spatial",
            BatchNormMode::SpatialPersistent => "spatial_persistent",
        };
        f.write_str(s)
    }
}

/// Version of the primitives library, encoded like cuDNN's
/// `CUDNN_VERSION` (major * 1000 + minor * 100 + patch).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LibraryVersion(pub u32);

impl LibraryVersion {
    /// First version that ships the persistent spatial mode.
    pub const PERSISTENT_SPATIAL: LibraryVersion = LibraryVersion(7003);

    pub fn supports_persistent_spatial(&self) -> bool {
        *self >= Self::PERSISTENT_SPATIAL
    }
}

impl fmt::Display for LibraryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let v = self.0;
        write!(f, "{}.{}.{}", v / 1000, (v % 1000) / 100, v % 100)
    }
}

/// Pick the library mode for an input of the given rank.
///
/// Rank 2 is always `PerActivation`, whatever the phase. Higher ranks use
/// `Spatial`, upgraded to `SpatialPersistent` only when training on a
/// library that has it.
pub fn select_mode(rank: usize, phase: Phase, version: LibraryVersion) -> BatchNormMode {
    if rank == 2 {
        BatchNormMode::PerActivation
    } else if phase.is_training() && version.supports_persistent_spatial() {
        BatchNormMode::SpatialPersistent
    } else {
        BatchNormMode::Spatial
    }
}
