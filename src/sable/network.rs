use burn::{
    module::{Ignored, Module},
    prelude::Backend,
    tensor::{Bool, Int, Tensor},
};

use super::{
    decoder::{Decoder, DecoderConfig},
    encoder::{Encoder, EncoderConfig},
    retention::decay_kappa_tensor,
    util::{
        categorical_stats, masked_log_softmax, mode_categorical, no_dones, sample_categorical,
        timestep_starts,
    },
    MemoryKind, Observation, SableConfig, SableError,
};

/// Per-block retention states carried between timesteps, each stacked as
/// `[batch, n_head, n_block, head_dim, head_dim]`.
#[derive(Debug, Clone)]
pub struct HiddenStates<B: Backend> {
    pub encoder: Tensor<B, 5>,
    pub decoder_self: Tensor<B, 5>,
    pub decoder_cross: Tensor<B, 5>,
}

impl<B: Backend> HiddenStates<B> {
    pub fn zeros(
        batch: usize,
        n_head: usize,
        n_block: usize,
        head_dim: usize,
        device: &B::Device,
    ) -> Self {
        let shape = [batch, n_head, n_block, head_dim, head_dim];
        Self {
            encoder: Tensor::zeros(shape, device),
            decoder_self: Tensor::zeros(shape, device),
            decoder_cross: Tensor::zeros(shape, device),
        }
    }

    /// Zeroes the states of batch elements whose episode just ended, so
    /// the next timestep starts from empty memory. `done`: `[batch]`.
    pub fn reset_terminated(&self, done: Tensor<B, 1, Bool>) -> Self {
        let batch = done.dims()[0];
        let keep = done.bool_not().float().reshape([batch, 1, 1, 1, 1]);
        Self {
            encoder: self.encoder.clone() * keep.clone(),
            decoder_self: self.decoder_self.clone() * keep.clone(),
            decoder_cross: self.decoder_cross.clone() * keep,
        }
    }

    /// Applies the once-per-timestep per-head decay.
    fn decayed(&self, kappas: &Tensor<B, 1>) -> Self {
        let n_head = kappas.dims()[0];
        let kappas = kappas.clone().reshape([1, n_head, 1, 1, 1]);
        Self {
            encoder: self.encoder.clone() * kappas.clone(),
            decoder_self: self.decoder_self.clone() * kappas.clone(),
            decoder_cross: self.decoder_cross.clone() * kappas,
        }
    }
}

#[derive(Debug, Clone)]
struct NetworkSettings {
    n_agents: usize,
    action_dim: usize,
    n_head: usize,
    n_block: usize,
    head_dim: usize,
    /// `None` runs whole sequences as one chunk.
    chunk_size: Option<usize>,
    /// Thread retention states across timesteps when acting.
    recurrent_act: bool,
    /// Memory is scoped to one timestep's agent sequence.
    feed_forward: bool,
}

/// Retention-based encoder-decoder over agent tokens: per-agent value
/// estimates from the encoder, autoregressive per-agent actions from the
/// decoder.
#[derive(Module, Debug)]
pub struct SableNetwork<B: Backend> {
    pub encoder: Encoder<B>,
    pub decoder: Decoder<B>,
    decay_kappas: Tensor<B, 1>,
    settings: Ignored<NetworkSettings>,
}

impl SableConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<SableNetwork<B>, SableError> {
        self.validate()?;

        let decay_scaling = self.effective_decay_scaling();
        let recurrent_act = matches!(self.memory.kind, MemoryKind::RecChunked { .. });
        // Timestep positions only matter when memory spans timesteps.
        let positional = recurrent_act && self.memory.timestep_positional_encoding;
        let chunk_size = self.chunk_size();

        tracing::debug!(
            kind = ?self.memory.kind,
            chunk_size = ?chunk_size,
            decay_scaling,
            positional,
            "initializing sable network"
        );

        let encoder = EncoderConfig::new(self.obs_dim, self.embed_dim, self.n_head, self.n_block)
            .with_decay_scaling_factor(decay_scaling)
            .with_timestep_positional_encoding(positional)
            .init(device);
        let decoder =
            DecoderConfig::new(self.action_dim, self.embed_dim, self.n_head, self.n_block)
                .with_decay_scaling_factor(decay_scaling)
                .with_timestep_positional_encoding(positional)
                .init(device);

        Ok(SableNetwork {
            encoder,
            decoder,
            decay_kappas: decay_kappa_tensor(self.n_head, decay_scaling, device),
            settings: Ignored(NetworkSettings {
                n_agents: self.n_agents,
                action_dim: self.action_dim,
                n_head: self.n_head,
                n_block: self.n_block,
                head_dim: self.head_dim(),
                chunk_size,
                recurrent_act,
                feed_forward: matches!(self.memory.kind, MemoryKind::FfChunked { .. }),
            }),
        })
    }
}

impl<B: Backend> SableNetwork<B> {
    pub fn init_hidden_states(&self, batch: usize, device: &B::Device) -> HiddenStates<B> {
        let s = &self.settings.0;
        HiddenStates::zeros(batch, s.n_head, s.n_block, s.head_dim, device)
    }

    /// Token id marking the start of a timestep's action sequence.
    fn start_token(&self) -> i32 {
        self.settings.action_dim as i32
    }

    /// Shifts actions right within each timestep: the decoder input for
    /// agent `i` is agent `i - 1`'s action, with a start token for agent 0.
    fn shift_actions(&self, action: Tensor<B, 2, Int>) -> Tensor<B, 2, Int> {
        let n_agents = self.settings.n_agents;
        let [batch, seq_len] = action.dims();
        let n_steps = seq_len / n_agents;
        let device = action.device();

        let start = Tensor::full([batch, n_steps, 1], self.start_token(), &device);
        if n_agents == 1 {
            return start.reshape([batch, seq_len]);
        }
        let prev = action
            .reshape([batch, n_steps, n_agents])
            .slice([0..batch, 0..n_steps, 0..n_agents - 1]);
        Tensor::cat(vec![start, prev], 2).reshape([batch, seq_len])
    }

    /// Evaluates a trajectory of `n_steps * n_agents` tokens under teacher
    /// forcing. Hidden states position the trajectory after earlier data;
    /// pass zeroed states for a trajectory that starts fresh.
    ///
    /// Returns per-token value estimates, log-probabilities of the taken
    /// actions and policy entropies, each `[batch, seq]`.
    pub fn train(
        &self,
        obs: Observation<B>,
        action: Tensor<B, 2, Int>,
        hstates: &HiddenStates<B>,
        dones: Tensor<B, 2, Bool>,
    ) -> (Tensor<B, 2>, Tensor<B, 2>, Tensor<B, 2>) {
        let [batch, seq_len] = action.dims();
        let chunk_size = self.settings.chunk_size.unwrap_or(seq_len);
        let decay_idx = obs.step_count;

        // Feed-forward memory is scoped to one timestep's agent
        // sequence: every timestep start becomes a segment boundary, so
        // no retention weight and no carried state crosses timesteps.
        let dones = if self.settings.feed_forward {
            let starts = timestep_starts::<B>(
                batch,
                seq_len,
                self.settings.n_agents,
                &action.device(),
            );
            (dones.float() + starts.float()).greater_elem(0.5)
        } else {
            dones
        };

        let (value, obs_rep, _) = self.encoder.forward_chunkwise(
            obs.agents_view,
            hstates.encoder.clone(),
            dones.clone(),
            decay_idx.clone(),
            chunk_size,
        );

        let shifted = self.shift_actions(action.clone());
        let (logits, _, _) = self.decoder.forward_chunkwise(
            shifted,
            obs_rep,
            hstates.decoder_self.clone(),
            hstates.decoder_cross.clone(),
            dones,
            decay_idx,
            chunk_size,
        );

        let log_probs = masked_log_softmax(logits, obs.action_mask.clone());
        let (log_prob, entropy) = categorical_stats(log_probs, action, obs.action_mask);
        (value, log_prob, entropy)
    }

    /// Samples one action per agent for a single timestep.
    ///
    /// Returns actions `[batch, n_agents]`, their log-probabilities, the
    /// per-agent value estimates and the updated hidden states. The
    /// feed-forward variant keeps no memory between timesteps: it runs
    /// from fresh states and hands the caller's states back unchanged.
    ///
    /// Sampling draws from the backend RNG. For reproducible runs, seed
    /// the backend after the parameters have been materialized (after a
    /// first forward pass), since lazy initialization also consumes the
    /// RNG.
    pub fn act(
        &self,
        obs: Observation<B>,
        hstates: &HiddenStates<B>,
    ) -> (Tensor<B, 2, Int>, Tensor<B, 2>, Tensor<B, 2>, HiddenStates<B>) {
        self.get_actions(obs, hstates, false)
    }

    /// Greedy variant of [`act`](Self::act): picks the highest-probability
    /// legal action per agent.
    pub fn act_deterministic(
        &self,
        obs: Observation<B>,
        hstates: &HiddenStates<B>,
    ) -> (Tensor<B, 2, Int>, Tensor<B, 2>, Tensor<B, 2>, HiddenStates<B>) {
        self.get_actions(obs, hstates, true)
    }

    fn get_actions(
        &self,
        obs: Observation<B>,
        hstates: &HiddenStates<B>,
        deterministic: bool,
    ) -> (Tensor<B, 2, Int>, Tensor<B, 2>, Tensor<B, 2>, HiddenStates<B>) {
        let s = &self.settings.0;
        let [batch, n_agents, _] = obs.agents_view.dims();
        let device = obs.agents_view.device();
        let decay_idx = obs.step_count;

        // The per-timestep decay happens here, once, not inside the
        // recurrent retention ops. Feed-forward memory does not outlive
        // the timestep, so it starts empty instead.
        let carried = hstates;
        let hstates = if s.feed_forward {
            HiddenStates::zeros(batch, s.n_head, s.n_block, s.head_dim, &device)
        } else {
            carried.decayed(&self.decay_kappas)
        };

        let (value, obs_rep, encoder_state) = if s.recurrent_act {
            self.encoder
                .forward_recurrent(obs.agents_view, hstates.encoder.clone(), &decay_idx)
        } else {
            let chunk_size = s.chunk_size.unwrap_or(n_agents);
            self.encoder.forward_chunkwise(
                obs.agents_view,
                hstates.encoder.clone(),
                no_dones(batch, n_agents, &device),
                decay_idx.clone(),
                chunk_size,
            )
        };

        let mut self_state = hstates.decoder_self.clone();
        let mut cross_state = hstates.decoder_cross.clone();
        let mut token: Tensor<B, 2, Int> = Tensor::full([batch, 1], self.start_token(), &device);
        let mut actions = Vec::with_capacity(n_agents);
        let mut log_probs = Vec::with_capacity(n_agents);

        let [_, _, action_dim] = obs.action_mask.dims();
        let [_, _, embed_dim] = obs_rep.dims();

        for agent in 0..n_agents {
            let obs_rep_i = obs_rep
                .clone()
                .slice([0..batch, agent..agent + 1, 0..embed_dim]);
            let idx_i = decay_idx.clone().slice([0..batch, agent..agent + 1]);

            let (logits, new_self, new_cross) = self.decoder.forward_recurrent(
                token,
                obs_rep_i,
                self_state,
                cross_state,
                &idx_i,
            );
            self_state = new_self;
            cross_state = new_cross;

            let mask_i = obs
                .action_mask
                .clone()
                .slice([0..batch, agent..agent + 1, 0..action_dim]);
            let agent_log_probs = masked_log_softmax(logits, mask_i);

            let action_i = if deterministic {
                mode_categorical(agent_log_probs.clone())
            } else {
                sample_categorical(agent_log_probs.clone())
            };
            let log_prob_i = agent_log_probs
                .gather(2, action_i.clone().reshape([batch, 1, 1]))
                .reshape([batch, 1]);

            token = action_i.clone();
            actions.push(action_i);
            log_probs.push(log_prob_i);
        }

        let new_hstates = if s.feed_forward {
            carried.clone()
        } else {
            HiddenStates {
                encoder: encoder_state,
                decoder_self: self_state,
                decoder_cross: cross_state,
            }
        };
        (
            Tensor::cat(actions, 1),
            Tensor::cat(log_probs, 1),
            value,
            new_hstates,
        )
    }
}
