//! Vision Transformer with divided space-time attention.
//!
//! Frames are embedded patch by patch; each block attends over time for
//! every patch position, then over space within every frame, then applies
//! the MLP. The class token (and the optional auxiliary token) attend with
//! every frame's patches and the per-frame results are averaged.

use burn::{
    module::{Ignored, Module, Param},
    nn::{Dropout, DropoutConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig},
    tensor::{backend::Backend, Distribution, Tensor},
};

use action_core::{Error, ForwardMode, Result};

use super::layers::{drop_path, drop_path_schedule, train_dropout, Attention, Mlp};
use crate::weights::impl_named_weights;

const LAYER_NORM_EPS: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq)]
pub struct VitConfig {
    pub img_size: usize,
    pub patch_size: usize,
    pub in_chans: usize,
    pub num_frames: usize,
    pub embed_dim: usize,
    pub depth: usize,
    pub num_heads: usize,
    pub mlp_ratio: usize,
    pub qkv_bias: bool,
    pub drop_rate: f64,
    pub drop_path_rate: f64,
    /// Class token plus an auxiliary token
    pub two_token: bool,
}

impl VitConfig {
    pub fn num_patches(&self) -> usize {
        (self.img_size / self.patch_size).pow(2)
    }

    pub fn num_tokens(&self) -> usize {
        if self.two_token {
            2
        } else {
            1
        }
    }

    /// Width of the feature handed to the classification head
    pub fn output_dim(&self) -> usize {
        self.embed_dim * self.num_tokens()
    }

    pub fn validate(&self) -> Result<()> {
        if self.patch_size == 0 || self.img_size % self.patch_size != 0 {
            return Err(Error::Model(format!(
                "image size {} is not a multiple of patch size {}",
                self.img_size, self.patch_size
            )));
        }
        if self.num_heads == 0 || self.embed_dim % self.num_heads != 0 {
            return Err(Error::Model(format!(
                "embed dim {} is not divisible by {} heads",
                self.embed_dim, self.num_heads
            )));
        }
        if self.num_frames == 0 || self.depth == 0 {
            return Err(Error::Model("ViT needs at least one frame and one block".into()));
        }
        Ok(())
    }
}

/// Per-frame patch projection, stored under the convolution's name
#[derive(Module, Debug)]
pub struct PatchEmbed<B: Backend> {
    pub proj: Linear<B>,
    patch_size: usize,
}

impl<B: Backend> PatchEmbed<B> {
    /// `[b, c, t, h, w]` to `[b, t, patches, dim]`
    pub fn forward(&self, clips: Tensor<B, 5>) -> Tensor<B, 4> {
        self.proj.forward(patchify(clips, self.patch_size))
    }
}

/// Cut every frame into `p x p` patches: `[b, c, t, h, w]` to
/// `[b, t, patches, c * p * p]`, features in `(c, row, col)` order.
///
/// burn-ndarray stops at rank 6, so rows and columns are split in two passes.
pub(crate) fn patchify<B: Backend>(clips: Tensor<B, 5>, p: usize) -> Tensor<B, 4> {
    let [b, c, t, h, w] = clips.dims();
    let (gh, gw) = (h / p, w / p);

    clips
        .reshape([b * c * t, gh, p, gw, p])
        .permute([0, 1, 3, 2, 4])
        .reshape([b, c, t, gh * gw, p * p])
        .permute([0, 2, 3, 1, 4])
        .reshape([b, t, gh * gw, c * p * p])
}

impl_named_weights!(PatchEmbed { proj });

#[derive(Module, Debug)]
pub struct DividedBlock<B: Backend> {
    pub norm1: LayerNorm<B>,
    pub attn: Attention<B>,
    pub temporal_norm1: LayerNorm<B>,
    pub temporal_attn: Attention<B>,
    pub temporal_fc: Linear<B>,
    pub norm2: LayerNorm<B>,
    pub mlp: Mlp<B>,
    num_tokens: usize,
    drop_path: Ignored<f64>,
}

impl<B: Backend> DividedBlock<B> {
    fn new(config: &VitConfig, drop_path: f64, device: &B::Device) -> Self {
        let dim = config.embed_dim;
        let norm = || LayerNormConfig::new(dim).with_epsilon(LAYER_NORM_EPS).init(device);
        Self {
            norm1: norm(),
            attn: Attention::new(dim, config.num_heads, config.qkv_bias, device),
            temporal_norm1: norm(),
            temporal_attn: Attention::new(dim, config.num_heads, config.qkv_bias, device),
            temporal_fc: LinearConfig::new(dim, dim).init(device),
            norm2: norm(),
            mlp: Mlp::new(dim, dim * config.mlp_ratio, config.drop_rate, device),
            num_tokens: config.num_tokens(),
            drop_path: Ignored(drop_path),
        }
    }

    /// `x` is `[b, k + n * t, d]`: `k` class tokens, then patches with the
    /// patch index major and the frame index minor.
    pub fn forward(&self, x: Tensor<B, 3>, frames: usize, mode: ForwardMode) -> Tensor<B, 3> {
        let [b, len, d] = x.dims();
        let k = self.num_tokens;
        let t = frames;
        let n = (len - k) / t;
        let rate = self.drop_path.0;

        let cls = x.clone().narrow(1, 0, k);
        let patches = x.narrow(1, k, n * t);

        // Temporal attention, one sequence per patch position
        let xt = patches.clone().reshape([b * n, t, d]);
        let res = self.temporal_attn.forward(self.temporal_norm1.forward(xt), None);
        let res = drop_path(res, rate, mode).reshape([b, n * t, d]);
        let xt = patches + self.temporal_fc.forward(res);

        // Spatial attention, one sequence per frame with the class tokens
        let cls_per_frame = cls.clone().unsqueeze_dim::<4>(1).repeat_dim(1, t).reshape([b * t, k, d]);
        let xs = xt.clone().reshape([b, n, t, d]).swap_dims(1, 2).reshape([b * t, n, d]);
        let xs = Tensor::cat(vec![cls_per_frame, xs], 1);
        let res = drop_path(self.attn.forward(self.norm1.forward(xs), None), rate, mode);

        let res_cls = res.clone().narrow(1, 0, k).reshape([b, t, k, d]).mean_dim(1).reshape([b, k, d]);
        let res_patches = res
            .narrow(1, k, n)
            .reshape([b, t, n, d])
            .swap_dims(1, 2)
            .reshape([b, n * t, d]);

        let x = Tensor::cat(vec![cls, xt], 1) + Tensor::cat(vec![res_cls, res_patches], 1);
        let res = self.mlp.forward(self.norm2.forward(x.clone()), mode);
        x + drop_path(res, rate, mode)
    }
}

impl_named_weights!(DividedBlock {
    norm1,
    attn,
    temporal_norm1,
    temporal_attn,
    temporal_fc,
    norm2,
    mlp
});

/// Backbone producing the class-token feature of a clip
#[derive(Module, Debug)]
pub struct VisionTransformer<B: Backend> {
    pub patch_embed: PatchEmbed<B>,
    pub cls_token: Param<Tensor<B, 3>>,
    pub aux_token: Option<Param<Tensor<B, 3>>>,
    pub pos_embed: Param<Tensor<B, 3>>,
    pub time_embed: Param<Tensor<B, 3>>,
    pub blocks: Vec<DividedBlock<B>>,
    pub norm: LayerNorm<B>,
    pos_drop: Dropout,
    num_tokens: usize,
    embed_dim: usize,
}

impl<B: Backend> VisionTransformer<B> {
    pub fn new(config: &VitConfig, device: &B::Device) -> Self {
        let dim = config.embed_dim;
        let k = config.num_tokens();
        let normal = |shape: [usize; 3]| {
            Param::from_tensor(Tensor::<B, 3>::random(shape, Distribution::Normal(0.0, 0.02), device))
        };

        let blocks = drop_path_schedule(config.drop_path_rate, config.depth)
            .into_iter()
            .map(|rate| DividedBlock::new(config, rate, device))
            .collect();

        Self {
            patch_embed: PatchEmbed {
                proj: LinearConfig::new(config.in_chans * config.patch_size.pow(2), dim).init(device),
                patch_size: config.patch_size,
            },
            cls_token: normal([1, 1, dim]),
            aux_token: config.two_token.then(|| normal([1, 1, dim])),
            pos_embed: normal([1, config.num_patches() + k, dim]),
            time_embed: Param::from_tensor(Tensor::zeros([1, config.num_frames, dim], device)),
            blocks,
            norm: LayerNormConfig::new(dim).with_epsilon(LAYER_NORM_EPS).init(device),
            pos_drop: DropoutConfig::new(config.drop_rate).init(),
            num_tokens: k,
            embed_dim: dim,
        }
    }

    pub fn output_dim(&self) -> usize {
        self.embed_dim * self.num_tokens
    }

    fn class_tokens(&self) -> Tensor<B, 3> {
        match &self.aux_token {
            Some(aux) => Tensor::cat(vec![self.cls_token.val(), aux.val()], 1),
            None => self.cls_token.val(),
        }
    }

    /// `[b, c, t, h, w]` to `[b, output_dim]`
    pub fn forward_features(&self, clips: Tensor<B, 5>, mode: ForwardMode) -> Tensor<B, 2> {
        let k = self.num_tokens;
        let patches = self.patch_embed.forward(clips);
        let [b, t, n, d] = patches.dims();

        let cls = self.class_tokens().repeat_dim(0, b * t);
        let x = Tensor::cat(vec![cls, patches.reshape([b * t, n, d])], 1);
        let x = x + self.pos_embed.val().narrow(1, 0, k + n);
        let x = train_dropout(&self.pos_drop, x, mode);

        // Class tokens of the first frame carry on; patches get time embeddings
        let cls = x.clone().narrow(1, 0, k).reshape([b, t, k, d]).narrow(1, 0, 1).reshape([b, k, d]);
        let time = self.time_embed.val().narrow(1, 0, t).reshape([1, 1, t, d]);
        let patches = x.narrow(1, k, n).reshape([b, t, n, d]).swap_dims(1, 2) + time;
        let patches = train_dropout(&self.pos_drop, patches.reshape([b, n * t, d]), mode);

        let mut x = Tensor::cat(vec![cls, patches], 1);
        for block in &self.blocks {
            x = block.forward(x, t, mode);
        }

        self.norm.forward(x).narrow(1, 0, k).reshape([b, k * d])
    }
}

impl_named_weights!(VisionTransformer {
    patch_embed,
    cls_token,
    aux_token,
    pos_embed,
    time_embed,
    blocks,
    norm
});
