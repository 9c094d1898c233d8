//! Sable: a retention-based sequence model for multi-agent reinforcement
//! learning.
//!
//! Agents within a timestep form a token block; the encoder embeds their
//! observations and estimates values, the decoder selects actions one
//! agent at a time conditioned on the agents before it. Multi-scale
//! retention gives the network memory over past timesteps with a fixed
//! per-head exponential decay, and admits three numerically equivalent
//! computation forms (parallel, chunked, recurrent) so that training and
//! acting can use whichever is cheapest.

pub mod sable;

pub use sable::{
    ActionSpaceType, HiddenStates, MemoryConfig, MemoryKind, Observation, SableConfig, SableError,
    SableNetwork,
};
