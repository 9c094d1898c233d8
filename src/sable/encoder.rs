use burn::{
    config::Config,
    module::Module,
    nn::{Initializer, Linear, LinearConfig, RmsNorm, RmsNormConfig},
    prelude::Backend,
    tensor::{activation::gelu, Bool, Tensor},
};

use super::{
    retention::{MultiScaleRetention, MultiScaleRetentionConfig},
    util::{SwiGlu, SwiGluConfig},
};

/// One encoder layer: full self-retention over the token sequence,
/// post-norm residuals, feed-forward.
#[derive(Module, Debug)]
pub struct EncodeBlock<B: Backend> {
    pub retention: MultiScaleRetention<B>,
    ln1: RmsNorm<B>,
    ln2: RmsNorm<B>,
    ffn: SwiGlu<B>,
}

#[derive(Config, Debug)]
pub struct EncodeBlockConfig {
    embed_dim: usize,
    n_head: usize,
    #[config(default = 1.0)]
    decay_scaling_factor: f64,
    #[config(default = false)]
    timestep_positional_encoding: bool,
}

impl EncodeBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> EncodeBlock<B> {
        EncodeBlock {
            retention: MultiScaleRetentionConfig::new(self.embed_dim, self.n_head)
                .with_full_self_retention(true)
                .with_decay_scaling_factor(self.decay_scaling_factor)
                .with_timestep_positional_encoding(self.timestep_positional_encoding)
                .init(device),
            ln1: RmsNormConfig::new(self.embed_dim).init(device),
            ln2: RmsNormConfig::new(self.embed_dim).init(device),
            ffn: SwiGluConfig::new(self.embed_dim, self.embed_dim).init(device),
        }
    }
}

impl<B: Backend> EncodeBlock<B> {
    pub fn forward_chunkwise(
        &self,
        x: Tensor<B, 3>,
        hstate: Tensor<B, 4>,
        dones: Tensor<B, 2, Bool>,
        decay_idx: Tensor<B, 2>,
        chunk_size: usize,
    ) -> (Tensor<B, 3>, Tensor<B, 4>) {
        let (ret, new_state) = self.retention.forward_chunkwise(
            x.clone(),
            x.clone(),
            x.clone(),
            hstate,
            dones,
            decay_idx,
            chunk_size,
        );
        let x = self.ln1.forward(x + ret);
        let out = self.ln2.forward(x.clone() + self.ffn.forward(x));
        (out, new_state)
    }

    pub fn forward_recurrent(
        &self,
        x: Tensor<B, 3>,
        hstate: Tensor<B, 4>,
        decay_idx: &Tensor<B, 2>,
    ) -> (Tensor<B, 3>, Tensor<B, 4>) {
        let (ret, new_state) = self.retention.forward_recurrent(
            x.clone(),
            x.clone(),
            x.clone(),
            hstate,
            decay_idx,
        );
        let x = self.ln1.forward(x + ret);
        let out = self.ln2.forward(x.clone() + self.ffn.forward(x));
        (out, new_state)
    }
}

/// Observation encoder: projects agent observations to an embedded
/// representation through a stack of [`EncodeBlock`]s and estimates a
/// per-token value.
#[derive(Module, Debug)]
pub struct Encoder<B: Backend> {
    ln: RmsNorm<B>,
    obs_norm: RmsNorm<B>,
    obs_proj: Linear<B>,
    pub blocks: Vec<EncodeBlock<B>>,
    value_proj: Linear<B>,
    value_norm: RmsNorm<B>,
    value_head: Linear<B>,
}

#[derive(Config, Debug)]
pub struct EncoderConfig {
    obs_dim: usize,
    embed_dim: usize,
    n_head: usize,
    n_block: usize,
    #[config(default = 1.0)]
    decay_scaling_factor: f64,
    #[config(default = false)]
    timestep_positional_encoding: bool,
}

impl EncoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Encoder<B> {
        let blocks = (0..self.n_block)
            .map(|_| {
                EncodeBlockConfig::new(self.embed_dim, self.n_head)
                    .with_decay_scaling_factor(self.decay_scaling_factor)
                    .with_timestep_positional_encoding(self.timestep_positional_encoding)
                    .init(device)
            })
            .collect();

        Encoder {
            ln: RmsNormConfig::new(self.embed_dim).init(device),
            obs_norm: RmsNormConfig::new(self.obs_dim).init(device),
            obs_proj: LinearConfig::new(self.obs_dim, self.embed_dim)
                .with_bias(false)
                .init(device),
            blocks,
            value_proj: LinearConfig::new(self.embed_dim, self.embed_dim).init(device),
            value_norm: RmsNormConfig::new(self.embed_dim).init(device),
            value_head: LinearConfig::new(self.embed_dim, 1)
                .with_initializer(Initializer::Normal {
                    mean: 0.0,
                    std: 0.01,
                })
                .init(device),
        }
    }
}

impl<B: Backend> Encoder<B> {
    fn embed_obs(&self, obs: Tensor<B, 3>) -> Tensor<B, 3> {
        gelu(self.obs_proj.forward(self.obs_norm.forward(obs)))
    }

    fn value(&self, obs_rep: Tensor<B, 3>) -> Tensor<B, 2> {
        let v = gelu(self.value_proj.forward(obs_rep));
        self.value_head
            .forward(self.value_norm.forward(v))
            .reshape([0, 0])
    }

    /// `obs`: `[batch, seq, obs_dim]`, `hstate`: per-block states stacked
    /// as `[batch, n_head, n_block, head_dim, head_dim]`.
    ///
    /// Returns the value estimate `[batch, seq]`, the observation
    /// representation `[batch, seq, embed_dim]` and the updated state.
    pub fn forward_chunkwise(
        &self,
        obs: Tensor<B, 3>,
        hstate: Tensor<B, 5>,
        dones: Tensor<B, 2, Bool>,
        decay_idx: Tensor<B, 2>,
        chunk_size: usize,
    ) -> (Tensor<B, 2>, Tensor<B, 3>, Tensor<B, 5>) {
        let mut obs_rep = self.embed_obs(obs);
        let mut hstate = hstate;
        for (i, block) in self.blocks.iter().enumerate() {
            let (out, block_state) = block.forward_chunkwise(
                self.ln.forward(obs_rep),
                block_hidden_state(&hstate, i),
                dones.clone(),
                decay_idx.clone(),
                chunk_size,
            );
            obs_rep = out;
            hstate = set_block_hidden_state(hstate, i, block_state);
        }
        (self.value(obs_rep.clone()), obs_rep, hstate)
    }

    pub fn forward_recurrent(
        &self,
        obs: Tensor<B, 3>,
        hstate: Tensor<B, 5>,
        decay_idx: &Tensor<B, 2>,
    ) -> (Tensor<B, 2>, Tensor<B, 3>, Tensor<B, 5>) {
        let mut obs_rep = self.embed_obs(obs);
        let mut hstate = hstate;
        for (i, block) in self.blocks.iter().enumerate() {
            let (out, block_state) = block.forward_recurrent(
                self.ln.forward(obs_rep),
                block_hidden_state(&hstate, i),
                decay_idx,
            );
            obs_rep = out;
            hstate = set_block_hidden_state(hstate, i, block_state);
        }
        (self.value(obs_rep.clone()), obs_rep, hstate)
    }
}

/// Extracts block `i`'s `[batch, n_head, head_dim, head_dim]` slice from
/// a stacked `[batch, n_head, n_block, head_dim, head_dim]` state.
pub(crate) fn block_hidden_state<B: Backend>(hstate: &Tensor<B, 5>, i: usize) -> Tensor<B, 4> {
    let [batch, n_head, _, head_dim, _] = hstate.dims();
    hstate
        .clone()
        .slice([0..batch, 0..n_head, i..i + 1, 0..head_dim, 0..head_dim])
        .reshape([batch, n_head, head_dim, head_dim])
}

pub(crate) fn set_block_hidden_state<B: Backend>(
    hstate: Tensor<B, 5>,
    i: usize,
    block_state: Tensor<B, 4>,
) -> Tensor<B, 5> {
    let [batch, n_head, _, head_dim, _] = hstate.dims();
    hstate.slice_assign(
        [0..batch, 0..n_head, i..i + 1, 0..head_dim, 0..head_dim],
        block_state.reshape([batch, n_head, 1, head_dim, head_dim]),
    )
}
