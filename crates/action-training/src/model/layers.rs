//! Building blocks shared by the transformer backbones.

use burn::{
    module::Module,
    nn::{Dropout, DropoutConfig, Linear, LinearConfig},
    tensor::{
        activation::{gelu, softmax},
        backend::Backend,
        Distribution, Tensor,
    },
};

use action_core::ForwardMode;

use crate::weights::impl_named_weights;

/// Two-layer feed-forward network with GELU
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    pub fc1: Linear<B>,
    pub fc2: Linear<B>,
    dropout: Dropout,
}

impl<B: Backend> Mlp<B> {
    pub fn new(dim: usize, hidden: usize, dropout: f64, device: &B::Device) -> Self {
        Self {
            fc1: LinearConfig::new(dim, hidden).init(device),
            fc2: LinearConfig::new(hidden, dim).init(device),
            dropout: DropoutConfig::new(dropout).init(),
        }
    }

    pub fn forward<const D: usize>(&self, x: Tensor<B, D>, mode: ForwardMode) -> Tensor<B, D> {
        let x = gelu(self.fc1.forward(x));
        let x = train_dropout(&self.dropout, x, mode);
        let x = self.fc2.forward(x);
        train_dropout(&self.dropout, x, mode)
    }
}

impl_named_weights!(Mlp { fc1, fc2 });

/// Multi-head self-attention over `[batch, tokens, dim]`
#[derive(Module, Debug)]
pub struct Attention<B: Backend> {
    pub qkv: Linear<B>,
    pub proj: Linear<B>,
    num_heads: usize,
}

impl<B: Backend> Attention<B> {
    pub fn new(dim: usize, num_heads: usize, qkv_bias: bool, device: &B::Device) -> Self {
        Self {
            qkv: LinearConfig::new(dim, dim * 3).with_bias(qkv_bias).init(device),
            proj: LinearConfig::new(dim, dim).init(device),
            num_heads,
        }
    }

    /// `bias` is added to the attention logits and must be
    /// `[batch, heads, tokens, tokens]`.
    pub fn forward(&self, x: Tensor<B, 3>, bias: Option<Tensor<B, 4>>) -> Tensor<B, 3> {
        multi_head_attention(&self.qkv, &self.proj, self.num_heads, x, bias)
    }
}

/// Self-attention of `x` (`[batch, tokens, dim]`) through a fused `qkv`
/// projection and an output projection.
pub fn multi_head_attention<B: Backend>(
    qkv: &Linear<B>,
    proj: &Linear<B>,
    num_heads: usize,
    x: Tensor<B, 3>,
    bias: Option<Tensor<B, 4>>,
) -> Tensor<B, 3> {
    let [batch, tokens, dim] = x.dims();
    let head_dim = dim / num_heads;

    let qkv = qkv
        .forward(x)
        .reshape([batch, tokens, 3, num_heads, head_dim])
        .permute([2, 0, 3, 1, 4]);
    let take = |index: usize| {
        qkv.clone()
            .narrow(0, index, 1)
            .reshape([batch, num_heads, tokens, head_dim])
    };
    let (q, k, v) = (take(0), take(1), take(2));

    let out = scaled_dot_product(q, k, v, bias)
        .swap_dims(1, 2)
        .reshape([batch, tokens, dim]);
    proj.forward(out)
}

impl_named_weights!(Attention { qkv, proj });

/// `softmax(q k^T / sqrt(d) + bias) v` over `[batch, heads, tokens, head_dim]`
pub fn scaled_dot_product<B: Backend>(
    q: Tensor<B, 4>,
    k: Tensor<B, 4>,
    v: Tensor<B, 4>,
    bias: Option<Tensor<B, 4>>,
) -> Tensor<B, 4> {
    let head_dim = q.dims()[3];
    let scale = (head_dim as f64).powf(-0.5);

    let mut logits = q.matmul(k.swap_dims(2, 3)).mul_scalar(scale);
    if let Some(bias) = bias {
        logits = logits + bias;
    }
    softmax(logits, 3).matmul(v)
}

/// Stochastic depth: zero whole samples with probability `rate` and rescale
/// the survivors. Identity outside training.
pub fn drop_path<B: Backend, const D: usize>(x: Tensor<B, D>, rate: f64, mode: ForwardMode) -> Tensor<B, D> {
    if !mode.is_train() || rate <= 0.0 {
        return x;
    }
    let keep = 1.0 - rate;
    let mut shape = [1; D];
    shape[0] = x.dims()[0];

    let mask = Tensor::<B, D>::random(shape, Distribution::Bernoulli(keep), &x.device());
    x * mask.div_scalar(keep)
}

pub fn train_dropout<B: Backend, const D: usize>(dropout: &Dropout, x: Tensor<B, D>, mode: ForwardMode) -> Tensor<B, D> {
    if mode.is_train() {
        dropout.forward(x)
    } else {
        x
    }
}

/// Per-block drop path rates rising linearly from 0 to `max_rate`
pub fn drop_path_schedule(max_rate: f64, depth: usize) -> Vec<f64> {
    if depth <= 1 {
        return vec![0.0; depth];
    }
    (0..depth)
        .map(|i| max_rate * i as f64 / (depth - 1) as f64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_attention_shape() {
        let device = Default::default();
        let attn = Attention::<TestBackend>::new(16, 4, true, &device);
        let x = Tensor::<TestBackend, 3>::ones([2, 5, 16], &device);
        assert_eq!(attn.forward(x, None).dims(), [2, 5, 16]);
    }

    #[test]
    fn test_masked_attention_ignores_blocked_tokens() {
        let device = Default::default();
        // q = k = 0 gives uniform weights before the bias
        let q = Tensor::<TestBackend, 4>::zeros([1, 1, 2, 1], &device);
        let k = q.clone();
        let v = Tensor::<TestBackend, 4>::from_floats([[[[1.0], [3.0]]]], &device);
        let bias = Tensor::<TestBackend, 4>::from_floats([[[[0.0, -100.0], [-100.0, 0.0]]]], &device);

        let out = scaled_dot_product(q.clone(), k.clone(), v.clone(), None)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert!((out[0] - 2.0).abs() < 1e-5);

        let out = scaled_dot_product(q, k, v, Some(bias)).into_data().to_vec::<f32>().unwrap();
        assert!((out[0] - 1.0).abs() < 1e-4);
        assert!((out[1] - 3.0).abs() < 1e-4);
    }

    #[test]
    fn test_drop_path_identity_in_eval() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 3>::ones([4, 2, 2], &device);
        let out = drop_path(x.clone(), 0.9, ForwardMode::Eval);
        assert_eq!(out.into_data(), x.into_data());
    }

    #[test]
    fn test_drop_path_keeps_or_drops_whole_samples() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 3>::ones([8, 3, 2], &device);
        let values = drop_path(x, 0.5, ForwardMode::Train).into_data().to_vec::<f32>().unwrap();

        for sample in values.chunks(6) {
            assert!(sample.iter().all(|&v| v == sample[0]));
            assert!(sample[0] == 0.0 || (sample[0] - 2.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_drop_path_schedule() {
        assert_eq!(drop_path_schedule(0.1, 1), vec![0.0]);
        let rates = drop_path_schedule(0.2, 3);
        assert!((rates[1] - 0.1).abs() < 1e-12);
        assert!((rates[2] - 0.2).abs() < 1e-12);
    }
}
