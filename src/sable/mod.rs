use burn::{
    config::Config,
    prelude::*,
    tensor::{Bool, Tensor},
};
use serde::{Deserialize, Serialize};

pub mod decoder;
pub mod encoder;
pub mod network;
pub mod pos_encoding;
pub mod retention;
pub mod util;

pub use network::{HiddenStates, SableNetwork};

/// Action space of the environment. Only `Discrete` passes validation; the
/// continuous path of the original design is deliberately unsupported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionSpaceType {
    Discrete,
    Continuous,
}

/// How the network chunks sequences and whether retention memory carries
/// across timesteps.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum MemoryKind {
    /// Whole sequence in a single parallel pass.
    FullParallel,
    /// Feed-forward Sable: chunking over the agent axis within a timestep.
    /// The decay scaling factor is pinned to 1.0 in this mode.
    FfChunked { agents_chunk_size: usize },
    /// Recurrent Sable: chunking over time; the chunk covers
    /// `timestep_chunk_size * n_agents` tokens.
    RecChunked { timestep_chunk_size: usize },
}

/// Memory/decay settings, fixed for the lifetime of a network.
#[derive(Config, Debug)]
pub struct MemoryConfig {
    pub kind: MemoryKind,
    /// Global multiplier on the per-head decay schedule, in `[0, 1]`.
    #[config(default = 1.0)]
    pub decay_scaling_factor: f64,
    /// Add a sinusoidal timestep encoding to k/q/v. Only effective in
    /// `RecChunked` mode.
    #[config(default = false)]
    pub timestep_positional_encoding: bool,
}

/// Configuration for the Sable policy/value network.
#[derive(Config, Debug)]
pub struct SableConfig {
    /// Number of agents acting per timestep.
    pub n_agents: usize,
    /// Per-agent observation feature width.
    pub obs_dim: usize,
    /// Number of discrete actions.
    pub action_dim: usize,
    pub memory: MemoryConfig,
    #[config(default = 3)]
    pub n_block: usize,
    #[config(default = 128)]
    pub embed_dim: usize,
    #[config(default = 4)]
    pub n_head: usize,
    #[config(default = "ActionSpaceType::Discrete")]
    pub action_space_type: ActionSpaceType,
}

#[derive(Debug, thiserror::Error)]
pub enum SableError {
    #[error("unsupported action space {0:?}: only Discrete is validated")]
    UnsupportedActionSpace(ActionSpaceType),
    #[error("n_agents ({n_agents}) must be divisible by agents_chunk_size ({chunk_size})")]
    ChunkSize { n_agents: usize, chunk_size: usize },
    #[error("decay_scaling_factor must be in [0, 1], got {0}")]
    DecayScalingFactor(f64),
    #[error("embed_dim ({embed_dim}) must be divisible by n_head ({n_head})")]
    EmbedDim { embed_dim: usize, n_head: usize },
}

/// What one timestep's worth of agents observes. Produced by the
/// environment loop, consumed (never mutated) by the network.
#[derive(Debug, Clone)]
pub struct Observation<B: Backend> {
    /// `[batch, seq, obs_dim]` per-agent feature vectors; `seq` is
    /// `n_agents` at act time and `timesteps * n_agents` at train time.
    pub agents_view: Tensor<B, 3>,
    /// `[batch, seq, action_dim]` legal-action mask, `true` = legal.
    pub action_mask: Tensor<B, 3, Bool>,
    /// `[batch, seq]` steps elapsed since the start of the episode.
    pub step_count: Tensor<B, 2>,
}

impl SableConfig {
    pub(crate) fn head_dim(&self) -> usize {
        self.embed_dim / self.n_head
    }

    /// Decay scaling factor after mode-specific pinning: the feed-forward
    /// variant has no memory compression knob.
    pub(crate) fn effective_decay_scaling(&self) -> f64 {
        match self.memory.kind {
            MemoryKind::FfChunked { .. } => 1.0,
            _ => self.memory.decay_scaling_factor,
        }
    }

    /// Tokens per chunk for the chunked execution forms, `None` when the
    /// whole sequence is processed in one parallel pass.
    pub(crate) fn chunk_size(&self) -> Option<usize> {
        match self.memory.kind {
            MemoryKind::FullParallel => None,
            MemoryKind::FfChunked { agents_chunk_size } => Some(agents_chunk_size),
            MemoryKind::RecChunked {
                timestep_chunk_size,
            } => Some(timestep_chunk_size * self.n_agents),
        }
    }

    pub(crate) fn validate(&self) -> Result<(), SableError> {
        if self.action_space_type != ActionSpaceType::Discrete {
            return Err(SableError::UnsupportedActionSpace(self.action_space_type));
        }
        if let MemoryKind::FfChunked { agents_chunk_size } = self.memory.kind {
            if agents_chunk_size == 0 || self.n_agents % agents_chunk_size != 0 {
                return Err(SableError::ChunkSize {
                    n_agents: self.n_agents,
                    chunk_size: agents_chunk_size,
                });
            }
        }
        let scale = self.memory.decay_scaling_factor;
        if !(0.0..=1.0).contains(&scale) {
            return Err(SableError::DecayScalingFactor(scale));
        }
        if self.n_head == 0 || self.embed_dim % self.n_head != 0 {
            return Err(SableError::EmbedDim {
                embed_dim: self.embed_dim,
                n_head: self.n_head,
            });
        }
        Ok(())
    }
}
