use burn::{
    config::Config,
    module::{Ignored, Module, Param},
    nn::{Initializer, Linear, LinearConfig},
    prelude::Backend,
    tensor::{activation::silu, Bool, Tensor},
};

use super::{
    pos_encoding::{PositionalEncoding, PositionalEncodingConfig},
    util::{cumulative_sum, lower_triangular},
};

/// Floor on the per-head decay rate before taking its logarithm, so a
/// scaling factor of zero yields `kappa^0 = 1` and `kappa^(d>0) = 0`
/// instead of NaN.
const KAPPA_FLOOR: f64 = 1e-30;

/// Per-head decay rates: a geometric interpolation from a fast-decaying
/// head (`1 - 1/32`) to a slow-decaying head (`1 - 1/512`), globally
/// scaled by `decay_scaling_factor`.
pub fn decay_kappas(n_head: usize, decay_scaling_factor: f64) -> Vec<f64> {
    let lo = (1.0f64 / 32.0).ln();
    let hi = (1.0f64 / 512.0).ln();
    (0..n_head)
        .map(|h| {
            let t = if n_head > 1 {
                h as f64 / (n_head - 1) as f64
            } else {
                0.0
            };
            (1.0 - (lo + t * (hi - lo)).exp()) * decay_scaling_factor
        })
        .collect()
}

/// The decay schedule as a `[n_head]` tensor.
pub fn decay_kappa_tensor<B: Backend>(
    n_head: usize,
    decay_scaling_factor: f64,
    device: &B::Device,
) -> Tensor<B, 1> {
    let kappas: Vec<f32> = decay_kappas(n_head, decay_scaling_factor)
        .into_iter()
        .map(|k| k as f32)
        .collect();
    Tensor::from_floats(kappas.as_slice(), device)
}

#[derive(Debug, Clone)]
pub struct RetentionSettings {
    pub n_head: usize,
    pub head_dim: usize,
    /// Encoder mode: every token of a timestep attends every other token
    /// of that timestep. Decoder mode is causal over token positions.
    pub full_self_retention: bool,
}

/// Multi-scale retention: unnormalized linear attention where the
/// contribution of key `j` to query `i` decays as `kappa^(idx_i - idx_j)`
/// with one fixed `kappa` per head.
///
/// All three computation forms (`forward_parallel`, `forward_chunkwise`,
/// `forward_recurrent`) evaluate the same function; see the equivalence
/// tests. The hidden state is a `[batch, n_head, head_dim, head_dim]`
/// decayed running sum of key-value outer products, owned by the caller.
#[derive(Module, Debug)]
pub struct MultiScaleRetention<B: Backend> {
    pub q_proj: Linear<B>,
    pub k_proj: Linear<B>,
    pub v_proj: Linear<B>,
    pub g_proj: Linear<B>,
    pub o_proj: Linear<B>,
    pub head_norm: MultiHeadRmsNorm<B>,
    pub pos_enc: PositionalEncoding<B>,
    /// `ln(max(kappa_h, floor))`, fixed at construction.
    pub log_kappas: Tensor<B, 1>,
    pub settings: Ignored<RetentionSettings>,
}

#[derive(Config, Debug)]
pub struct MultiScaleRetentionConfig {
    embed_dim: usize,
    n_head: usize,
    #[config(default = false)]
    full_self_retention: bool,
    #[config(default = 1.0)]
    decay_scaling_factor: f64,
    #[config(default = false)]
    timestep_positional_encoding: bool,
}

impl MultiScaleRetentionConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MultiScaleRetention<B> {
        debug_assert_eq!(self.embed_dim % self.n_head, 0);
        let head_dim = self.embed_dim / self.n_head;
        let linear = |bias| {
            LinearConfig::new(self.embed_dim, self.embed_dim)
                .with_bias(bias)
                .init(device)
        };

        let log_kappas: Vec<f32> = decay_kappas(self.n_head, self.decay_scaling_factor)
            .into_iter()
            .map(|k| k.max(KAPPA_FLOOR).ln() as f32)
            .collect();

        MultiScaleRetention {
            q_proj: linear(false),
            k_proj: linear(false),
            v_proj: linear(false),
            g_proj: linear(false),
            o_proj: linear(false),
            head_norm: MultiHeadRmsNormConfig::new(self.n_head, head_dim).init(device),
            pos_enc: PositionalEncodingConfig::new(self.embed_dim)
                .with_enabled(self.timestep_positional_encoding)
                .init(device),
            log_kappas: Tensor::from_floats(log_kappas.as_slice(), device),
            settings: Ignored(RetentionSettings {
                n_head: self.n_head,
                head_dim,
                full_self_retention: self.full_self_retention,
            }),
        }
    }
}

impl<B: Backend> MultiScaleRetention<B> {
    /// Projects `[batch, seq, embed]` inputs to `[batch, head, seq, head_dim]`
    /// queries/keys/values, with the query pre-scaled by `1/sqrt(head_dim)`.
    fn project(
        &self,
        key: Tensor<B, 3>,
        query: Tensor<B, 3>,
        value: Tensor<B, 3>,
        decay_idx: &Tensor<B, 2>,
    ) -> (Tensor<B, 4>, Tensor<B, 4>, Tensor<B, 4>) {
        let (key, query, value) = self.pos_enc.apply(key, query, value, decay_idx);

        let split_heads = |x: Tensor<B, 3>| {
            x.reshape([0, 0, self.settings.n_head as i32, -1])
                .permute([0, 2, 1, 3])
        };

        let q = split_heads(self.q_proj.forward(query)) / (self.settings.head_dim as f32).sqrt();
        let k = split_heads(self.k_proj.forward(key));
        let v = split_heads(self.v_proj.forward(value));
        (q, k, v)
    }

    /// Per-head normalization, swish gate and output projection.
    fn combine(&self, ret: Tensor<B, 4>, gate_input: Tensor<B, 3>) -> Tensor<B, 3> {
        let [batch, n_head, seq_len, head_dim] = ret.dims();
        let y = self
            .head_norm
            .forward(ret)
            .permute([0, 2, 1, 3])
            .reshape([batch, seq_len, n_head * head_dim]);
        let gate = silu(self.g_proj.forward(gate_input));
        self.o_proj.forward(gate * y)
    }

    /// `[batch, n_head, seq, seq]` decay-weighted attention mask.
    ///
    /// Entry `(i, j)` is `kappa^(idx_i - idx_j)` where the pair is
    /// admissible and zero otherwise. Admissible pairs are index-causal
    /// (`idx_j <= idx_i`, tokens of one timestep mutually visible) in full
    /// mode, position-causal (`j <= i`) in masked mode, and never span an
    /// episode boundary.
    fn decay_matrix(&self, decay_idx: &Tensor<B, 2>, dones: &Tensor<B, 2, Bool>) -> Tensor<B, 4> {
        let [batch, seq_len] = decay_idx.dims();
        let device = decay_idx.device();

        let idx_q = decay_idx.clone().reshape([batch, seq_len, 1]);
        let idx_k = decay_idx.clone().reshape([batch, 1, seq_len]);
        let delta = idx_q - idx_k;

        let mask = if self.settings.full_self_retention {
            delta.clone().greater_equal_elem(0.0).float()
        } else {
            lower_triangular::<B>(seq_len, &device).unsqueeze::<3>()
        };

        // Zero every pair that crosses an episode boundary.
        let seg = cumulative_sum(dones.clone().float());
        let seg_q = seg.clone().reshape([batch, seq_len, 1]);
        let seg_k = seg.reshape([batch, 1, seq_len]);
        let same_episode = (seg_q - seg_k).equal_elem(0.0).float();

        let mask = (mask * same_episode).reshape([batch, 1, seq_len, seq_len]);

        // Masked-off pairs may carry a negative exponent; clamp before
        // exponentiating so they contribute exactly zero, not NaN.
        let delta = delta
            .clamp_min(0.0)
            .reshape([batch, 1, seq_len, seq_len]);
        let log_kappas = self
            .log_kappas
            .clone()
            .reshape([1, self.settings.n_head, 1, 1]);

        (delta * log_kappas).exp() * mask
    }

    /// Whole-sequence parallel form; no hidden state involved.
    pub fn forward_parallel(
        &self,
        key: Tensor<B, 3>,
        query: Tensor<B, 3>,
        value: Tensor<B, 3>,
        dones: Tensor<B, 2, Bool>,
        decay_idx: Tensor<B, 2>,
    ) -> Tensor<B, 3> {
        let gate_input = query.clone();
        let (q, k, v) = self.project(key, query, value, &decay_idx);
        let decay = self.decay_matrix(&decay_idx, &dones);
        let ret = (q.matmul(k.swap_dims(2, 3)) * decay).matmul(v);
        self.combine(ret, gate_input)
    }

    /// Chunked form: parallel within consecutive `chunk_size`-token
    /// windows, recurrent across them through the hidden state.
    ///
    /// Contract: `hstate` is positioned at the decay index of the first
    /// token (the act-time per-timestep decay has already been applied by
    /// the caller); the returned state is positioned at the last token.
    pub fn forward_chunkwise(
        &self,
        key: Tensor<B, 3>,
        query: Tensor<B, 3>,
        value: Tensor<B, 3>,
        hstate: Tensor<B, 4>,
        dones: Tensor<B, 2, Bool>,
        decay_idx: Tensor<B, 2>,
        chunk_size: usize,
    ) -> (Tensor<B, 3>, Tensor<B, 4>) {
        let gate_input = query.clone();
        let (q, k, v) = self.project(key, query, value, &decay_idx);
        let [batch, n_head, seq_len, head_dim] = q.dims();
        assert!(
            chunk_size > 0 && seq_len % chunk_size == 0,
            "sequence length {seq_len} is not divisible by chunk size {chunk_size}"
        );

        let log_kappas = self.log_kappas.clone().reshape([1, n_head, 1, 1]);
        let mut state = hstate;
        let mut outputs = Vec::with_capacity(seq_len / chunk_size);

        for chunk in 0..seq_len / chunk_size {
            let start = chunk * chunk_size;
            let end = start + chunk_size;
            let token_range = start..end;

            let qc = q.clone().slice([0..batch, 0..n_head, token_range.clone(), 0..head_dim]);
            let kc = k.clone().slice([0..batch, 0..n_head, token_range.clone(), 0..head_dim]);
            let vc = v.clone().slice([0..batch, 0..n_head, token_range.clone(), 0..head_dim]);
            let idx_c = decay_idx.clone().slice([0..batch, token_range.clone()]);
            let dones_c = dones.clone().slice([0..batch, token_range]);

            let first = idx_c.clone().slice([0..batch, 0..1]);
            let last = idx_c.clone().slice([0..batch, chunk_size - 1..chunk_size]);

            if chunk > 0 {
                // Reposition the carried state across the index gap
                // between the previous chunk's last token and this one's
                // first (one timestep for contiguous trajectories).
                let prev_last = decay_idx
                    .clone()
                    .slice([0..batch, start - 1..start]);
                let gap = (first.clone() - prev_last).clamp_min(0.0);
                state = state * (gap.reshape([batch, 1, 1, 1]) * log_kappas.clone()).exp();
            }

            // Parallel term within the chunk.
            let decay = self.decay_matrix(&idx_c, &dones_c);
            let inner = (qc.clone().matmul(kc.clone().swap_dims(2, 3)) * decay).matmul(vc.clone());

            // Cross-chunk term: a decayed read of the incoming state,
            // suppressed from the first in-chunk episode boundary onward.
            let seg_c = cumulative_sum(dones_c.float());
            let offset = (idx_c.clone() - first.clone()).reshape([batch, 1, chunk_size, 1]);
            let unreset = seg_c
                .clone()
                .equal_elem(0.0)
                .float()
                .reshape([batch, 1, chunk_size, 1]);
            let cross_decay = (offset * log_kappas.clone()).exp() * unreset;
            let cross = qc.matmul(state.clone()) * cross_decay;

            outputs.push(inner + cross);

            // State update: decay the old state over the chunk's span
            // (dropping it entirely if an episode ended inside the chunk)
            // and add the chunk's own decayed key-value outer products.
            let seg_last = seg_c.clone().slice([0..batch, chunk_size - 1..chunk_size]);
            let keep_old = seg_last
                .clone()
                .equal_elem(0.0)
                .float()
                .reshape([batch, 1, 1, 1]);
            let span = (last.clone() - first).reshape([batch, 1, 1, 1]);
            let state_decay = (span * log_kappas.clone()).exp();

            let within = (last - idx_c).reshape([batch, 1, chunk_size, 1]);
            let live = (seg_c - seg_last)
                .equal_elem(0.0)
                .float()
                .reshape([batch, 1, chunk_size, 1]);
            let k_decayed = kc * (within * log_kappas.clone()).exp() * live;

            state = state * state_decay * keep_old + k_decayed.swap_dims(2, 3).matmul(vc);
        }

        let ret = Tensor::cat(outputs, 2);
        (self.combine(ret, gate_input), state)
    }

    /// Recurrent form over one timestep's token block.
    ///
    /// No decay is applied here: the caller decays the state once per
    /// timestep before the call. The block's outer products are added to
    /// the state and every token reads the updated state, which realises
    /// full self-retention within the block. Masked (decoder) retention
    /// must therefore feed tokens one at a time.
    pub fn forward_recurrent(
        &self,
        key: Tensor<B, 3>,
        query: Tensor<B, 3>,
        value: Tensor<B, 3>,
        hstate: Tensor<B, 4>,
        decay_idx: &Tensor<B, 2>,
    ) -> (Tensor<B, 3>, Tensor<B, 4>) {
        let gate_input = query.clone();
        let (q, k, v) = self.project(key, query, value, decay_idx);
        debug_assert!(
            self.settings.full_self_retention || q.dims()[2] == 1,
            "masked retention is recurrent one token at a time"
        );
        let new_state = hstate + k.swap_dims(2, 3).matmul(v);
        let ret = q.matmul(new_state.clone());
        (self.combine(ret, gate_input), new_state)
    }
}

/// RMS normalization applied independently per retention head, with a
/// learned per-head scale.
#[derive(Module, Debug)]
pub struct MultiHeadRmsNorm<B: Backend> {
    /// `[n_head, head_dim]`
    pub weight: Param<Tensor<B, 2>>,
    pub epsilon: f64,
}

#[derive(Config, Debug)]
pub struct MultiHeadRmsNormConfig {
    n_head: usize,
    head_dim: usize,
    #[config(default = 1e-6)]
    epsilon: f64,
}

impl MultiHeadRmsNormConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> MultiHeadRmsNorm<B> {
        MultiHeadRmsNorm {
            weight: Initializer::Ones.init([self.n_head, self.head_dim], device),
            epsilon: self.epsilon,
        }
    }
}

impl<B: Backend> MultiHeadRmsNorm<B> {
    /// `x`: `[batch, n_head, seq, head_dim]`.
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, n_head, _, head_dim] = x.dims();
        let rms = (x.clone().powf_scalar(2.0).mean_dim(3) + self.epsilon).sqrt();
        let weight = self.weight.val().reshape([1, n_head, 1, head_dim]);
        x / rms * weight
    }
}
