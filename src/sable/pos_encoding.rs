use burn::{
    config::Config,
    module::Module,
    prelude::Backend,
    tensor::{Int, Tensor},
};

/// Additive sinusoidal encoding of the timestep index, applied to key,
/// query and value before retention. Only active for the recurrent
/// network variant when the timestep encoding toggle is set.
#[derive(Module, Debug)]
pub struct PositionalEncoding<B: Backend> {
    /// `[d_model / 2]` frequency scaling for the even indices.
    div_term: Tensor<B, 1>,
    d_model: usize,
    enabled: bool,
}

#[derive(Config, Debug)]
pub struct PositionalEncodingConfig {
    d_model: usize,
    #[config(default = false)]
    enabled: bool,
}

impl PositionalEncodingConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> PositionalEncoding<B> {
        debug_assert_eq!(self.d_model % 2, 0, "d_model must be even");
        let even = Tensor::<B, 1, Int>::arange_step(0..self.d_model as i64, 2, device).float();
        let div_term = (even * (-(10_000.0f32.ln()) / self.d_model as f32)).exp();
        PositionalEncoding {
            div_term,
            d_model: self.d_model,
            enabled: self.enabled,
        }
    }
}

impl<B: Backend> PositionalEncoding<B> {
    /// Adds the encoding of `position` (`[batch, seq]`) to each of the
    /// `[batch, seq, d_model]` inputs. No-op when disabled.
    pub fn apply(
        &self,
        key: Tensor<B, 3>,
        query: Tensor<B, 3>,
        value: Tensor<B, 3>,
        position: &Tensor<B, 2>,
    ) -> (Tensor<B, 3>, Tensor<B, 3>, Tensor<B, 3>) {
        if !self.enabled {
            return (key, query, value);
        }
        let pe = self.encoding(position);
        (key + pe.clone(), query + pe.clone(), value + pe)
    }

    /// Sine on even indices, cosine on odd indices.
    fn encoding(&self, position: &Tensor<B, 2>) -> Tensor<B, 3> {
        let [batch, seq_len] = position.dims();
        let half = self.d_model / 2;
        let x = position.clone().reshape([batch, seq_len, 1]) * self.div_term.clone().reshape([
            1, 1, half,
        ]);
        Tensor::stack::<4>(vec![x.clone().sin(), x.cos()], 3).reshape([batch, seq_len, self.d_model])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type B = burn::backend::NdArray;

    #[test]
    fn disabled_encoding_is_identity() {
        let device = Default::default();
        let enc = PositionalEncodingConfig::new(8).init::<B>(&device);
        let x = Tensor::<B, 3>::ones([1, 2, 8], &device);
        let pos = Tensor::<B, 2>::zeros([1, 2], &device);
        let (k, _, _) = enc.apply(x.clone(), x.clone(), x.clone(), &pos);
        let diff = (k - x).abs().max().into_data().to_vec::<f32>().unwrap()[0];
        assert_eq!(diff, 0.0);
    }

    #[test]
    fn encoding_interleaves_sin_and_cos() {
        let device = Default::default();
        let enc = PositionalEncodingConfig::new(4).with_enabled(true).init::<B>(&device);
        let zero = Tensor::<B, 3>::zeros([1, 1, 4], &device);
        let pos = Tensor::<B, 2>::zeros([1, 1], &device);
        // At position 0 every sine term is 0 and every cosine term is 1.
        let (k, _, _) = enc.apply(zero.clone(), zero.clone(), zero, &pos);
        let got = k.into_data().to_vec::<f32>().unwrap();
        assert_eq!(got, vec![0.0, 1.0, 0.0, 1.0]);
    }

    #[test]
    fn distinct_timesteps_get_distinct_codes() {
        let device = Default::default();
        let enc = PositionalEncodingConfig::new(8).with_enabled(true).init::<B>(&device);
        let zero = Tensor::<B, 3>::zeros([1, 2, 8], &device);
        let pos = Tensor::<B, 2>::from_floats([[3.0, 11.0]], &device);
        let (k, _, _) = enc.apply(zero.clone(), zero.clone(), zero, &pos);
        let row0 = k.clone().slice([0..1, 0..1, 0..8]).into_data().to_vec::<f32>().unwrap();
        let row1 = k.slice([0..1, 1..2, 0..8]).into_data().to_vec::<f32>().unwrap();
        assert_ne!(row0, row1);
    }
}
