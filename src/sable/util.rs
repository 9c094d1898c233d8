use burn::{
    config::Config,
    module::Module,
    nn::{Linear, LinearConfig},
    prelude::Backend,
    tensor::{
        activation::{log_softmax, silu},
        Bool, Distribution, Int, Tensor,
    },
};

/// Additive bias for illegal actions. Large enough that the bias
/// underflows to exactly zero probability after softmax in f32.
pub(crate) const ILLEGAL_ACTION_BIAS: f32 = -1.0e9;

/// `[seq, seq]` lower-triangular ones (diagonal included).
pub(crate) fn lower_triangular<B: Backend>(seq_len: usize, device: &B::Device) -> Tensor<B, 2> {
    let idx = Tensor::<B, 1, Int>::arange(0..seq_len as i64, device).float();
    let rows = idx.clone().reshape([seq_len, 1]).expand([seq_len, seq_len]);
    let cols = idx.reshape([1, seq_len]).expand([seq_len, seq_len]);
    rows.greater_equal(cols).float()
}

/// Inclusive cumulative sum along the sequence axis of a `[batch, seq]`
/// tensor, via a triangular matmul.
pub(crate) fn cumulative_sum<B: Backend>(x: Tensor<B, 2>) -> Tensor<B, 2> {
    let [batch, seq_len] = x.dims();
    let tril = lower_triangular::<B>(seq_len, &x.device());
    tril.unsqueeze::<3>()
        .matmul(x.reshape([batch, seq_len, 1]))
        .reshape([batch, seq_len])
}

/// Marks the first token of every `n_agents`-token block in a
/// `[batch, seq]` trajectory.
pub(crate) fn timestep_starts<B: Backend>(
    batch: usize,
    seq_len: usize,
    n_agents: usize,
    device: &B::Device,
) -> Tensor<B, 2, Bool> {
    let flags: Vec<f32> = (0..seq_len)
        .map(|i| if i % n_agents == 0 { 1.0 } else { 0.0 })
        .collect();
    Tensor::<B, 1>::from_floats(flags.as_slice(), device)
        .reshape([1, seq_len])
        .expand([batch, seq_len])
        .greater_elem(0.5)
}

/// All-false done mask, for single-timestep calls where no episode
/// boundary can occur mid-sequence.
pub(crate) fn no_dones<B: Backend>(
    batch: usize,
    seq_len: usize,
    device: &B::Device,
) -> Tensor<B, 2, Bool> {
    Tensor::<B, 2>::zeros([batch, seq_len], device).greater_elem(0.5)
}

/// Log-probabilities of a legal-action-masked categorical distribution.
///
/// Illegal logits receive a large negative additive bias before
/// normalization, which drives their probability mass to exactly zero.
pub fn masked_log_softmax<B: Backend>(
    logits: Tensor<B, 3>,
    legal_actions: Tensor<B, 3, Bool>,
) -> Tensor<B, 3> {
    let masked = logits.mask_fill(legal_actions.bool_not(), ILLEGAL_ACTION_BIAS);
    log_softmax(masked, 2)
}

/// Gumbel-max sample from `[batch, seq, n_actions]` log-probabilities.
/// Returns `[batch, seq]` action indices drawn with the backend RNG.
pub fn sample_categorical<B: Backend>(log_probs: Tensor<B, 3>) -> Tensor<B, 2, Int> {
    let [batch, seq_len, _] = log_probs.dims();
    let uniform = Tensor::<B, 3>::random(
        log_probs.shape(),
        Distribution::Uniform(0.0, 1.0),
        &log_probs.device(),
    );
    let gumbel = -(-uniform.log()).log();
    (log_probs + gumbel).argmax(2).reshape([batch, seq_len])
}

/// Mode of the distribution, for deterministic evaluation.
pub fn mode_categorical<B: Backend>(log_probs: Tensor<B, 3>) -> Tensor<B, 2, Int> {
    let [batch, seq_len, _] = log_probs.dims();
    log_probs.argmax(2).reshape([batch, seq_len])
}

/// Log-probability of `actions` and entropy of the masked distribution,
/// both `[batch, seq]`. Illegal entries contribute nothing to the entropy.
pub fn categorical_stats<B: Backend>(
    log_probs: Tensor<B, 3>,
    actions: Tensor<B, 2, Int>,
    legal_actions: Tensor<B, 3, Bool>,
) -> (Tensor<B, 2>, Tensor<B, 2>) {
    let [batch, seq_len, _] = log_probs.dims();
    let action_log_prob = log_probs
        .clone()
        .gather(2, actions.reshape([batch, seq_len, 1]))
        .reshape([batch, seq_len]);
    let probs = log_probs.clone().exp();
    let entropy = -(probs * log_probs * legal_actions.float())
        .sum_dim(2)
        .reshape([batch, seq_len]);
    (action_log_prob, entropy)
}

/// Gated feed-forward sublayer: `down(silu(gate) * up)` with the gate and
/// up projections fused into one split linear.
#[derive(Module, Debug)]
pub struct SwiGlu<B: Backend> {
    up_gate_proj: Linear<B>,
    down_proj: Linear<B>,
    intermediate_size: usize,
}

#[derive(Config, Debug)]
pub struct SwiGluConfig {
    hidden_size: usize,
    intermediate_size: usize,
}

impl SwiGluConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> SwiGlu<B> {
        SwiGlu {
            up_gate_proj: LinearConfig::new(self.hidden_size, 2 * self.intermediate_size)
                .with_bias(false)
                .init(device),
            down_proj: LinearConfig::new(self.intermediate_size, self.hidden_size)
                .with_bias(false)
                .init(device),
            intermediate_size: self.intermediate_size,
        }
    }
}

impl<B: Backend> SwiGlu<B> {
    pub fn forward(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        let [gate, up] = self
            .up_gate_proj
            .forward(x)
            .split(self.intermediate_size, 2)
            .try_into()
            .unwrap();

        self.down_proj.forward(silu(gate) * up)
    }
}
