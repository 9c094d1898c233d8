use burn::{
    config::Config,
    module::Module,
    nn::{Embedding, EmbeddingConfig, Initializer, Linear, LinearConfig, RmsNorm, RmsNormConfig},
    prelude::Backend,
    tensor::{activation::gelu, Bool, Int, Tensor},
};

use super::{
    encoder::{block_hidden_state, set_block_hidden_state},
    retention::{MultiScaleRetention, MultiScaleRetentionConfig},
    util::{SwiGlu, SwiGluConfig},
};

/// One decoder layer: causal self-retention over the shifted action
/// sequence, then causal cross-retention reading it from the observation
/// representation.
#[derive(Module, Debug)]
pub struct DecodeBlock<B: Backend> {
    pub self_retention: MultiScaleRetention<B>,
    pub cross_retention: MultiScaleRetention<B>,
    ln1: RmsNorm<B>,
    ln2: RmsNorm<B>,
    ln3: RmsNorm<B>,
    ffn: SwiGlu<B>,
}

#[derive(Config, Debug)]
pub struct DecodeBlockConfig {
    embed_dim: usize,
    n_head: usize,
    #[config(default = 1.0)]
    decay_scaling_factor: f64,
    #[config(default = false)]
    timestep_positional_encoding: bool,
}

impl DecodeBlockConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> DecodeBlock<B> {
        let retention = || {
            MultiScaleRetentionConfig::new(self.embed_dim, self.n_head)
                .with_decay_scaling_factor(self.decay_scaling_factor)
                .with_timestep_positional_encoding(self.timestep_positional_encoding)
                .init(device)
        };
        DecodeBlock {
            self_retention: retention(),
            cross_retention: retention(),
            ln1: RmsNormConfig::new(self.embed_dim).init(device),
            ln2: RmsNormConfig::new(self.embed_dim).init(device),
            ln3: RmsNormConfig::new(self.embed_dim).init(device),
            ffn: SwiGluConfig::new(self.embed_dim, self.embed_dim).init(device),
        }
    }
}

impl<B: Backend> DecodeBlock<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn forward_chunkwise(
        &self,
        x: Tensor<B, 3>,
        obs_rep: Tensor<B, 3>,
        self_state: Tensor<B, 4>,
        cross_state: Tensor<B, 4>,
        dones: Tensor<B, 2, Bool>,
        decay_idx: Tensor<B, 2>,
        chunk_size: usize,
    ) -> (Tensor<B, 3>, Tensor<B, 4>, Tensor<B, 4>) {
        let (ret, self_state) = self.self_retention.forward_chunkwise(
            x.clone(),
            x.clone(),
            x.clone(),
            self_state,
            dones.clone(),
            decay_idx.clone(),
            chunk_size,
        );
        let x = self.ln1.forward(x + ret);

        let (ret2, cross_state) = self.cross_retention.forward_chunkwise(
            x.clone(),
            obs_rep.clone(),
            x,
            cross_state,
            dones,
            decay_idx,
            chunk_size,
        );
        let y = self.ln2.forward(obs_rep + ret2);
        let out = self.ln3.forward(y.clone() + self.ffn.forward(y));
        (out, self_state, cross_state)
    }

    /// Single-token step; causal retention is recurrent one token at a time.
    pub fn forward_recurrent(
        &self,
        x: Tensor<B, 3>,
        obs_rep: Tensor<B, 3>,
        self_state: Tensor<B, 4>,
        cross_state: Tensor<B, 4>,
        decay_idx: &Tensor<B, 2>,
    ) -> (Tensor<B, 3>, Tensor<B, 4>, Tensor<B, 4>) {
        let (ret, self_state) = self.self_retention.forward_recurrent(
            x.clone(),
            x.clone(),
            x.clone(),
            self_state,
            decay_idx,
        );
        let x = self.ln1.forward(x + ret);

        let (ret2, cross_state) = self.cross_retention.forward_recurrent(
            x.clone(),
            obs_rep.clone(),
            x,
            cross_state,
            decay_idx,
        );
        let y = self.ln2.forward(obs_rep + ret2);
        let out = self.ln3.forward(y.clone() + self.ffn.forward(y));
        (out, self_state, cross_state)
    }
}

/// Autoregressive action decoder. Consumes the shifted action token
/// sequence (start token, then each agent's action) and the encoder's
/// observation representation, and produces per-agent action logits.
#[derive(Module, Debug)]
pub struct Decoder<B: Backend> {
    ln: RmsNorm<B>,
    action_embedding: Embedding<B>,
    pub blocks: Vec<DecodeBlock<B>>,
    head_proj: Linear<B>,
    head_norm: RmsNorm<B>,
    head: Linear<B>,
}

#[derive(Config, Debug)]
pub struct DecoderConfig {
    action_dim: usize,
    embed_dim: usize,
    n_head: usize,
    n_block: usize,
    #[config(default = 1.0)]
    decay_scaling_factor: f64,
    #[config(default = false)]
    timestep_positional_encoding: bool,
}

impl DecoderConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Decoder<B> {
        let blocks = (0..self.n_block)
            .map(|_| {
                DecodeBlockConfig::new(self.embed_dim, self.n_head)
                    .with_decay_scaling_factor(self.decay_scaling_factor)
                    .with_timestep_positional_encoding(self.timestep_positional_encoding)
                    .init(device)
            })
            .collect();

        Decoder {
            ln: RmsNormConfig::new(self.embed_dim).init(device),
            // One extra id for the start-of-timestep token.
            action_embedding: EmbeddingConfig::new(self.action_dim + 1, self.embed_dim)
                .init(device),
            blocks,
            head_proj: LinearConfig::new(self.embed_dim, self.embed_dim).init(device),
            head_norm: RmsNormConfig::new(self.embed_dim).init(device),
            head: LinearConfig::new(self.embed_dim, self.action_dim)
                .with_initializer(Initializer::Normal {
                    mean: 0.0,
                    std: 0.01,
                })
                .init(device),
        }
    }
}

impl<B: Backend> Decoder<B> {
    fn embed_actions(&self, action_tokens: Tensor<B, 2, Int>) -> Tensor<B, 3> {
        gelu(self.action_embedding.forward(action_tokens))
    }

    fn logits(&self, y: Tensor<B, 3>) -> Tensor<B, 3> {
        let h = gelu(self.head_proj.forward(y));
        self.head.forward(self.head_norm.forward(h))
    }

    /// `action_tokens`: `[batch, seq]` shifted token ids; states are
    /// stacked per block as `[batch, n_head, n_block, head_dim, head_dim]`.
    #[allow(clippy::too_many_arguments)]
    pub fn forward_chunkwise(
        &self,
        action_tokens: Tensor<B, 2, Int>,
        obs_rep: Tensor<B, 3>,
        self_state: Tensor<B, 5>,
        cross_state: Tensor<B, 5>,
        dones: Tensor<B, 2, Bool>,
        decay_idx: Tensor<B, 2>,
        chunk_size: usize,
    ) -> (Tensor<B, 3>, Tensor<B, 5>, Tensor<B, 5>) {
        let mut x = self.embed_actions(action_tokens);
        let mut self_state = self_state;
        let mut cross_state = cross_state;
        for (i, block) in self.blocks.iter().enumerate() {
            let (out, block_self, block_cross) = block.forward_chunkwise(
                self.ln.forward(x),
                obs_rep.clone(),
                block_hidden_state(&self_state, i),
                block_hidden_state(&cross_state, i),
                dones.clone(),
                decay_idx.clone(),
                chunk_size,
            );
            x = out;
            self_state = set_block_hidden_state(self_state, i, block_self);
            cross_state = set_block_hidden_state(cross_state, i, block_cross);
        }
        (self.logits(x), self_state, cross_state)
    }

    /// Single-token step for autoregressive action selection.
    pub fn forward_recurrent(
        &self,
        action_tokens: Tensor<B, 2, Int>,
        obs_rep: Tensor<B, 3>,
        self_state: Tensor<B, 5>,
        cross_state: Tensor<B, 5>,
        decay_idx: &Tensor<B, 2>,
    ) -> (Tensor<B, 3>, Tensor<B, 5>, Tensor<B, 5>) {
        let mut x = self.embed_actions(action_tokens);
        let mut self_state = self_state;
        let mut cross_state = cross_state;
        for (i, block) in self.blocks.iter().enumerate() {
            let (out, block_self, block_cross) = block.forward_recurrent(
                self.ln.forward(x),
                obs_rep.clone(),
                block_hidden_state(&self_state, i),
                block_hidden_state(&cross_state, i),
                decay_idx,
            );
            x = out;
            self_state = set_block_hidden_state(self_state, i, block_self);
            cross_state = set_block_hidden_state(cross_state, i, block_cross);
        }
        (self.logits(x), self_state, cross_state)
    }
}
