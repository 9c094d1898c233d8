//! Equivalence and masking properties of the three retention forms.

use burn::tensor::{Bool, Distribution, Tensor};
use sable::sable::retention::{MultiScaleRetention, MultiScaleRetentionConfig};

type B = burn::backend::NdArray;
type Device = <B as burn::prelude::Backend>::Device;

const EMBED_DIM: usize = 16;
const N_HEAD: usize = 2;

fn masked_retention(device: &Device) -> MultiScaleRetention<B> {
    MultiScaleRetentionConfig::new(EMBED_DIM, N_HEAD).init(device)
}

fn full_retention(device: &Device) -> MultiScaleRetention<B> {
    MultiScaleRetentionConfig::new(EMBED_DIM, N_HEAD)
        .with_full_self_retention(true)
        .init(device)
}

fn random_input(batch: usize, seq_len: usize, device: &Device) -> Tensor<B, 3> {
    Tensor::random(
        [batch, seq_len, EMBED_DIM],
        Distribution::Uniform(-1.0, 1.0),
        device,
    )
}

fn all_false(batch: usize, seq_len: usize, device: &Device) -> Tensor<B, 2, Bool> {
    Tensor::<B, 2>::zeros([batch, seq_len], device).greater_elem(0.5)
}

fn zero_state(batch: usize, device: &Device) -> Tensor<B, 4> {
    Tensor::zeros([batch, N_HEAD, EMBED_DIM / N_HEAD, EMBED_DIM / N_HEAD], device)
}

/// Token positions as decay indices: one token per timestep.
fn token_positions(batch: usize, seq_len: usize, device: &Device) -> Tensor<B, 2> {
    let positions: Vec<f32> = (0..seq_len).map(|i| i as f32).collect();
    Tensor::<B, 1>::from_floats(positions.as_slice(), device)
        .reshape([1, seq_len])
        .expand([batch, seq_len])
}

fn max_abs_diff(a: Tensor<B, 3>, b: Tensor<B, 3>) -> f32 {
    (a - b).abs().max().into_data().to_vec::<f32>().unwrap()[0]
}

fn max_abs_state_diff(a: Tensor<B, 4>, b: Tensor<B, 4>) -> f32 {
    (a - b).abs().max().into_data().to_vec::<f32>().unwrap()[0]
}

/// Per-head decay factors of a module, shaped for state updates.
fn kappa_view(retention: &MultiScaleRetention<B>) -> Tensor<B, 4> {
    retention.log_kappas.clone().exp().reshape([1, N_HEAD, 1, 1])
}

#[test]
fn parallel_and_chunked_agree() {
    let device = Device::default();
    let retention = masked_retention(&device);
    let (batch, seq_len) = (2, 8);
    let x = random_input(batch, seq_len, &device);
    let dones = all_false(batch, seq_len, &device);
    let idx = token_positions(batch, seq_len, &device);

    let parallel = retention.forward_parallel(
        x.clone(),
        x.clone(),
        x.clone(),
        dones.clone(),
        idx.clone(),
    );

    let mut final_states = Vec::new();
    for chunk_size in [2, 4, 8] {
        let (chunked, state) = retention.forward_chunkwise(
            x.clone(),
            x.clone(),
            x.clone(),
            zero_state(batch, &device),
            dones.clone(),
            idx.clone(),
            chunk_size,
        );
        let diff = max_abs_diff(parallel.clone(), chunked);
        assert!(diff < 1e-4, "chunk size {chunk_size}: diff {diff}");
        final_states.push(state);
    }

    // The final hidden state is independent of the chunking.
    let reference = final_states.pop().unwrap();
    for state in final_states {
        let diff = max_abs_state_diff(reference.clone(), state);
        assert!(diff < 1e-4, "final state diff {diff}");
    }
}

#[test]
fn parallel_and_recurrent_agree() {
    let device = Device::default();
    let retention = masked_retention(&device);
    let (batch, seq_len) = (2, 6);
    let x = random_input(batch, seq_len, &device);
    let dones = all_false(batch, seq_len, &device);
    let idx = token_positions(batch, seq_len, &device);

    let parallel = retention.forward_parallel(
        x.clone(),
        x.clone(),
        x.clone(),
        dones,
        idx.clone(),
    );

    // One token per call; the caller owns the per-step state decay.
    let kappas = kappa_view(&retention);
    let mut state = zero_state(batch, &device);
    let mut outputs = Vec::with_capacity(seq_len);
    for t in 0..seq_len {
        if t > 0 {
            state = state * kappas.clone();
        }
        let x_t = x.clone().slice([0..batch, t..t + 1, 0..EMBED_DIM]);
        let idx_t = idx.clone().slice([0..batch, t..t + 1]);
        let (out, new_state) =
            retention.forward_recurrent(x_t.clone(), x_t.clone(), x_t, state, &idx_t);
        state = new_state;
        outputs.push(out);
    }
    let recurrent = Tensor::cat(outputs, 1);

    let diff = max_abs_diff(parallel, recurrent);
    assert!(diff < 1e-4, "diff {diff}");

    // The token-by-token state must land where the chunked state does.
    let (_, chunked_state) = retention.forward_chunkwise(
        x.clone(),
        x.clone(),
        x.clone(),
        zero_state(batch, &device),
        all_false(batch, seq_len, &device),
        idx,
        seq_len,
    );
    let diff = max_abs_state_diff(chunked_state, state);
    assert!(diff < 1e-4, "state diff {diff}");
}

#[test]
fn full_retention_recurrent_agrees_over_timestep_blocks() {
    let device = Device::default();
    let retention = full_retention(&device);
    let (batch, n_agents, n_steps) = (2, 3, 4);
    let seq_len = n_agents * n_steps;
    let x = random_input(batch, seq_len, &device);
    let dones = all_false(batch, seq_len, &device);

    // Agents of one timestep share a decay index.
    let positions: Vec<f32> = (0..seq_len).map(|i| (i / n_agents) as f32).collect();
    let idx = Tensor::<B, 1>::from_floats(positions.as_slice(), &device)
        .reshape([1, seq_len])
        .expand([batch, seq_len]);

    let parallel = retention.forward_parallel(
        x.clone(),
        x.clone(),
        x.clone(),
        dones,
        idx.clone(),
    );

    let kappas = kappa_view(&retention);
    let mut state = zero_state(batch, &device);
    let mut outputs = Vec::with_capacity(n_steps);
    for t in 0..n_steps {
        if t > 0 {
            state = state * kappas.clone();
        }
        let range = t * n_agents..(t + 1) * n_agents;
        let x_t = x.clone().slice([0..batch, range.clone(), 0..EMBED_DIM]);
        let idx_t = idx.clone().slice([0..batch, range]);
        let (out, new_state) =
            retention.forward_recurrent(x_t.clone(), x_t.clone(), x_t, state, &idx_t);
        state = new_state;
        outputs.push(out);
    }
    let recurrent = Tensor::cat(outputs, 1);

    let diff = max_abs_diff(parallel, recurrent);
    assert!(diff < 1e-4, "diff {diff}");
}

#[test]
fn future_tokens_do_not_change_past_outputs() {
    let device = Device::default();
    let retention = masked_retention(&device);
    let (batch, seq_len) = (1, 5);
    let x = random_input(batch, seq_len, &device);
    let dones = all_false(batch, seq_len, &device);
    let idx = token_positions(batch, seq_len, &device);

    let base = retention.forward_parallel(
        x.clone(),
        x.clone(),
        x.clone(),
        dones.clone(),
        idx.clone(),
    );

    // Replace the last token with something else entirely.
    let perturbed = x.clone().slice_assign(
        [0..batch, seq_len - 1..seq_len, 0..EMBED_DIM],
        Tensor::ones([batch, 1, EMBED_DIM], &device) * 5.0,
    );
    let out = retention.forward_parallel(
        perturbed.clone(),
        perturbed.clone(),
        perturbed,
        dones,
        idx,
    );

    let prefix = 0..seq_len - 1;
    let diff = max_abs_diff(
        base.slice([0..batch, prefix.clone(), 0..EMBED_DIM]),
        out.slice([0..batch, prefix, 0..EMBED_DIM]),
    );
    assert!(diff < 1e-6, "diff {diff}");
}

#[test]
fn episode_boundary_resets_retention() {
    let device = Device::default();
    let retention = masked_retention(&device);
    let (batch, seq_len, boundary) = (1, 6, 3);
    let x = random_input(batch, seq_len, &device);
    let idx = token_positions(batch, seq_len, &device);

    // A new episode starts at `boundary`.
    let done_flags: Vec<f32> = (0..seq_len)
        .map(|i| if i == boundary { 1.0 } else { 0.0 })
        .collect();
    let dones = Tensor::<B, 1>::from_floats(done_flags.as_slice(), &device)
        .reshape([batch, seq_len])
        .greater_elem(0.5);

    let full = retention.forward_parallel(
        x.clone(),
        x.clone(),
        x.clone(),
        dones,
        idx.clone(),
    );

    // Running the suffix alone from scratch must give the same outputs.
    let suffix = boundary..seq_len;
    let x_suffix = x.slice([0..batch, suffix.clone(), 0..EMBED_DIM]);
    let idx_suffix = idx.slice([0..batch, suffix.clone()]);
    let alone = retention.forward_parallel(
        x_suffix.clone(),
        x_suffix.clone(),
        x_suffix,
        all_false(batch, seq_len - boundary, &device),
        idx_suffix,
    );

    let diff = max_abs_diff(full.slice([0..batch, suffix, 0..EMBED_DIM]), alone);
    assert!(diff < 1e-5, "diff {diff}");
}

#[test]
fn episode_boundary_inside_a_chunk_matches_parallel() {
    let device = Device::default();
    let retention = masked_retention(&device);
    let (batch, seq_len) = (2, 8);
    let x = random_input(batch, seq_len, &device);
    let idx = token_positions(batch, seq_len, &device);

    // Boundary at token 5, in the middle of the second chunk of 4.
    let done_flags: Vec<f32> = (0..seq_len).map(|i| if i == 5 { 1.0 } else { 0.0 }).collect();
    let dones = Tensor::<B, 1>::from_floats(done_flags.as_slice(), &device)
        .reshape([1, seq_len])
        .expand([batch, seq_len])
        .greater_elem(0.5);

    let parallel = retention.forward_parallel(
        x.clone(),
        x.clone(),
        x.clone(),
        dones.clone(),
        idx.clone(),
    );
    let (chunked, _) = retention.forward_chunkwise(
        x.clone(),
        x.clone(),
        x.clone(),
        zero_state(batch, &device),
        dones,
        idx,
        4,
    );

    let diff = max_abs_diff(parallel, chunked);
    assert!(diff < 1e-4, "diff {diff}");
}

#[test]
fn zero_decay_scaling_forgets_other_timesteps() {
    let device = Device::default();
    let retained = MultiScaleRetentionConfig::new(EMBED_DIM, N_HEAD)
        .with_decay_scaling_factor(1.0)
        .init::<B>(&device);
    // Same weights, decay scaled to zero.
    let mut memoryless = MultiScaleRetentionConfig::new(EMBED_DIM, N_HEAD)
        .with_decay_scaling_factor(0.0)
        .init::<B>(&device);
    memoryless.q_proj = retained.q_proj.clone();
    memoryless.k_proj = retained.k_proj.clone();
    memoryless.v_proj = retained.v_proj.clone();
    memoryless.g_proj = retained.g_proj.clone();
    memoryless.o_proj = retained.o_proj.clone();
    memoryless.head_norm = retained.head_norm.clone();

    let (batch, seq_len, last) = (1, 5, 4);
    let x = random_input(batch, seq_len, &device);
    let dones = all_false(batch, seq_len, &device);
    let idx = token_positions(batch, seq_len, &device);

    let perturbed = x.clone().slice_assign(
        [0..batch, 0..1, 0..EMBED_DIM],
        Tensor::ones([batch, 1, EMBED_DIM], &device) * 3.0,
    );

    let output_at_last = |retention: &MultiScaleRetention<B>, input: &Tensor<B, 3>| {
        retention
            .forward_parallel(
                input.clone(),
                input.clone(),
                input.clone(),
                dones.clone(),
                idx.clone(),
            )
            .slice([0..batch, last..last + 1, 0..EMBED_DIM])
    };

    // With decay scaling zero, token 0 cannot reach token 4.
    let diff = max_abs_diff(
        output_at_last(&memoryless, &x),
        output_at_last(&memoryless, &perturbed),
    );
    assert!(diff < 1e-6, "memoryless diff {diff}");

    // With full decay scaling it does.
    let diff = max_abs_diff(
        output_at_last(&retained, &x),
        output_at_last(&retained, &perturbed),
    );
    assert!(diff > 1e-6, "retained diff {diff}");
}
