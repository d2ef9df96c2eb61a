//! 3D Swin Transformer.
//!
//! Features are kept channels-last as `[b, t, h, w, c]`. Every stage runs
//! pairs of window-attention blocks, the second of each pair on windows
//! shifted by half a window, followed by 2x2 spatial patch merging on all
//! but the last stage.

use burn::{
    module::{Ignored, Module, Param},
    nn::{Dropout, DropoutConfig, LayerNorm, LayerNormConfig, Linear, LinearConfig},
    tensor::{backend::Backend, Distribution, Int, Tensor, TensorData},
};

use action_core::{Error, ForwardMode, Result};

use super::layers::{drop_path, drop_path_schedule, multi_head_attention, train_dropout, Mlp};
use crate::weights::impl_named_weights;

/// Added to attention logits between tokens of different shifted regions
const MASK_VALUE: f32 = -100.0;

#[derive(Debug, Clone, PartialEq)]
pub struct SwinConfig {
    pub patch_size: [usize; 3],
    pub in_chans: usize,
    pub embed_dim: usize,
    pub depths: Vec<usize>,
    pub num_heads: Vec<usize>,
    pub window_size: [usize; 3],
    pub mlp_ratio: usize,
    pub qkv_bias: bool,
    pub drop_rate: f64,
    pub drop_path_rate: f64,
}

impl Default for SwinConfig {
    fn default() -> Self {
        Self {
            patch_size: [2, 4, 4],
            in_chans: 3,
            embed_dim: 128,
            depths: vec![2, 2, 18, 2],
            num_heads: vec![4, 8, 16, 32],
            window_size: [8, 7, 7],
            mlp_ratio: 4,
            qkv_bias: true,
            drop_rate: 0.0,
            drop_path_rate: 0.2,
        }
    }
}

impl SwinConfig {
    /// Channel width after the last stage
    pub fn output_dim(&self) -> usize {
        self.embed_dim << self.depths.len().saturating_sub(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.depths.is_empty() || self.depths.len() != self.num_heads.len() {
            return Err(Error::Model(format!(
                "Swin needs one head count per stage, got depths {:?} and heads {:?}",
                self.depths, self.num_heads
            )));
        }
        for (stage, &heads) in self.num_heads.iter().enumerate() {
            let dim = self.embed_dim << stage;
            if heads == 0 || dim % heads != 0 {
                return Err(Error::Model(format!("stage {stage}: width {dim} not divisible by {heads} heads")));
            }
        }
        if self.patch_size.contains(&0) || self.window_size.contains(&0) {
            return Err(Error::Model("patch and window sizes must be positive".into()));
        }
        Ok(())
    }
}

/// Window and shift actually used for a feature map of `size`: dimensions
/// no larger than the window use one window and no shift.
pub fn effective_window(size: [usize; 3], window: [usize; 3], shift: [usize; 3]) -> ([usize; 3], [usize; 3]) {
    let mut use_window = window;
    let mut use_shift = shift;
    for i in 0..3 {
        if size[i] <= window[i] {
            use_window[i] = size[i];
            use_shift[i] = 0;
        }
    }
    (use_window, use_shift)
}

/// Index into the relative position table for every token pair of a window.
///
/// The table is laid out for `table_window`; `window` may be smaller.
pub fn relative_position_index(window: [usize; 3], table_window: [usize; 3]) -> Vec<i64> {
    let coords: Vec<[usize; 3]> = (0..window[0])
        .flat_map(|d| (0..window[1]).flat_map(move |h| (0..window[2]).map(move |w| [d, h, w])))
        .collect();
    let span_h = 2 * table_window[1] - 1;
    let span_w = 2 * table_window[2] - 1;

    let mut index = Vec::with_capacity(coords.len() * coords.len());
    for a in &coords {
        for b in &coords {
            let rel = |i: usize| (a[i] + table_window[i] - 1 - b[i]) as i64;
            index.push(rel(0) * (span_h * span_w) as i64 + rel(1) * span_w as i64 + rel(2));
        }
    }
    index
}

fn region(position: usize, len: usize, window: usize, shift: usize) -> usize {
    if shift == 0 {
        0
    } else if position < len - window {
        0
    } else if position < len - shift {
        1
    } else {
        2
    }
}

/// Attention mask for shifted windows of a padded `[t, h, w]` map, as
/// `[windows, tokens, tokens]` values.
pub fn shifted_window_mask(size: [usize; 3], window: [usize; 3], shift: [usize; 3]) -> Vec<f32> {
    let [t, h, w] = size;
    let (nt, nh, nw) = (t / window[0], h / window[1], w / window[2]);
    let tokens = window.iter().product::<usize>();

    let mut labels = Vec::with_capacity(nt * nh * nw * tokens);
    for wt in 0..nt {
        for wh in 0..nh {
            for ww in 0..nw {
                for dt in 0..window[0] {
                    for dh in 0..window[1] {
                        for dw in 0..window[2] {
                            let rt = region(wt * window[0] + dt, t, window[0], shift[0]);
                            let rh = region(wh * window[1] + dh, h, window[1], shift[1]);
                            let rw = region(ww * window[2] + dw, w, window[2], shift[2]);
                            labels.push(rt * 9 + rh * 3 + rw);
                        }
                    }
                }
            }
        }
    }

    labels
        .chunks(tokens)
        .flat_map(|window_labels| {
            window_labels.iter().flat_map(move |a| {
                window_labels
                    .iter()
                    .map(move |b| if a == b { 0.0 } else { MASK_VALUE })
            })
        })
        .collect()
}

/// `[b, t, h, w, c]` to `[b * windows, tokens, c]`
fn window_partition<B: Backend>(x: Tensor<B, 5>, window: [usize; 3]) -> Tensor<B, 3> {
    let [b, t, h, w, c] = x.dims();
    let [wd, wh, ww] = window;
    let (nt, nh, nw) = (t / wd, h / wh, w / ww);
    x.reshape([b * nt, wd, nh, wh, w * c])
        .permute([0, 2, 1, 3, 4])
        .reshape([b * nt * nh, wd * wh, nw, ww * c])
        .swap_dims(1, 2)
        .reshape([b * nt * nh * nw, wd * wh * ww, c])
}

fn window_reverse<B: Backend>(windows: Tensor<B, 3>, window: [usize; 3], size: [usize; 5]) -> Tensor<B, 5> {
    let [b, t, h, w, c] = size;
    let [wd, wh, ww] = window;
    let (nt, nh, nw) = (t / wd, h / wh, w / ww);
    windows
        .reshape([b * nt * nh, nw, wd * wh, ww * c])
        .swap_dims(1, 2)
        .reshape([b * nt, nh, wd, wh, w * c])
        .permute([0, 2, 1, 3, 4])
        .reshape([b, t, h, w, c])
}

/// Concatenate each 2x2 spatial neighbourhood: `[b, t, h, w, c]` to
/// `[b, t, h/2, w/2, 4c]` with channel groups (h0 w0), (h1 w0), (h0 w1), (h1 w1).
fn merge_2x2<B: Backend>(x: Tensor<B, 5>) -> Tensor<B, 5> {
    let [b, t, h, w, c] = x.dims();
    x.reshape([b * t * (h / 2), 2, w / 2, 2, c])
        .permute([0, 2, 3, 1, 4])
        .reshape([b, t, h / 2, w / 2, 4 * c])
}

/// `[b, c, t, h, w]` to `[b, t/pt, h/ph, w/pw, c*pt*ph*pw]`, features in the
/// `(c, pt, ph, pw)` order of a 3D convolution kernel. Dims must be multiples
/// of the patch.
fn patchify_3d<B: Backend>(clips: Tensor<B, 5>, patch: [usize; 3]) -> Tensor<B, 5> {
    let [b, c, t, h, w] = clips.dims();
    let [pt, ph, pw] = patch;
    let (nt, nh, nw) = (t / pt, h / ph, w / pw);

    clips
        .reshape([b * c * nt, pt, nh, ph, w])
        .permute([0, 2, 1, 3, 4])
        .reshape([b * c * nt * nh, pt * ph, nw, pw])
        .swap_dims(1, 2)
        .reshape([b, c, nt * nh * nw, pt * ph * pw])
        .swap_dims(1, 2)
        .reshape([b, nt, nh, nw, c * pt * ph * pw])
}

/// Cyclic shift along `dim`: `out[i] = x[(i + shift) % len]`
fn roll_back<B: Backend>(x: Tensor<B, 5>, dim: usize, shift: usize) -> Tensor<B, 5> {
    let len = x.dims()[dim];
    if shift == 0 || shift == len {
        return x;
    }
    Tensor::cat(vec![x.clone().narrow(dim, shift, len - shift), x.narrow(dim, 0, shift)], dim)
}

/// Inverse of [`roll_back`]
fn roll_forward<B: Backend>(x: Tensor<B, 5>, dim: usize, shift: usize) -> Tensor<B, 5> {
    let len = x.dims()[dim];
    if shift == 0 || shift == len {
        return x;
    }
    roll_back(x, dim, len - shift)
}

/// Zero-pad `dim` at the end up to `target`
fn pad_end<B: Backend, const D: usize>(x: Tensor<B, D>, dim: usize, target: usize) -> Tensor<B, D> {
    let mut shape = x.dims();
    if shape[dim] >= target {
        return x;
    }
    shape[dim] = target - shape[dim];
    let zeros = Tensor::<B, D>::zeros(shape, &x.device());
    Tensor::cat(vec![x, zeros], dim)
}

fn round_up(value: usize, multiple: usize) -> usize {
    value.div_ceil(multiple) * multiple
}

/// Window attention with a learned relative position bias
#[derive(Module, Debug)]
pub struct WindowAttention3D<B: Backend> {
    pub qkv: Linear<B>,
    pub proj: Linear<B>,
    pub relative_position_bias_table: Param<Tensor<B, 2>>,
    num_heads: usize,
    window_size: Ignored<[usize; 3]>,
}

impl<B: Backend> WindowAttention3D<B> {
    fn new(dim: usize, num_heads: usize, window: [usize; 3], qkv_bias: bool, device: &B::Device) -> Self {
        let table_len = window.iter().map(|w| 2 * w - 1).product::<usize>();
        Self {
            qkv: LinearConfig::new(dim, dim * 3).with_bias(qkv_bias).init(device),
            proj: LinearConfig::new(dim, dim).init(device),
            relative_position_bias_table: Param::from_tensor(Tensor::random(
                [table_len, num_heads],
                Distribution::Normal(0.0, 0.02),
                device,
            )),
            num_heads,
            window_size: Ignored(window),
        }
    }

    /// `[heads, tokens, tokens]` bias for a (possibly clamped) window
    fn position_bias(&self, window: [usize; 3], device: &B::Device) -> Tensor<B, 3> {
        let tokens = window.iter().product::<usize>();
        let index = relative_position_index(window, self.window_size.0);
        let index = Tensor::<B, 1, Int>::from_data(TensorData::new(index, [tokens * tokens]), device);

        self.relative_position_bias_table
            .val()
            .select(0, index)
            .reshape([tokens, tokens, self.num_heads])
            .permute([2, 0, 1])
    }

    /// `windows` is `[batch * num_windows, tokens, c]`; `mask` is
    /// `[num_windows, tokens, tokens]`.
    fn forward(&self, windows: Tensor<B, 3>, window: [usize; 3], mask: Option<Tensor<B, 3>>) -> Tensor<B, 3> {
        let [batch_windows, tokens, _] = windows.dims();
        let heads = self.num_heads;

        let mut bias = self
            .position_bias(window, &windows.device())
            .unsqueeze_dim::<4>(0)
            .repeat_dim(0, batch_windows);
        if let Some(mask) = mask {
            let num_windows = mask.dims()[0];
            let mask = mask
                .unsqueeze_dim::<4>(1)
                .repeat_dim(1, heads)
                .unsqueeze_dim::<5>(0)
                .repeat_dim(0, batch_windows / num_windows)
                .reshape([batch_windows, heads, tokens, tokens]);
            bias = bias + mask;
        }

        multi_head_attention(&self.qkv, &self.proj, heads, windows, Some(bias))
    }
}

impl_named_weights!(WindowAttention3D {
    qkv,
    proj,
    relative_position_bias_table
});

#[derive(Module, Debug)]
pub struct SwinBlock3D<B: Backend> {
    pub norm1: LayerNorm<B>,
    pub attn: WindowAttention3D<B>,
    pub norm2: LayerNorm<B>,
    pub mlp: Mlp<B>,
    window_size: Ignored<[usize; 3]>,
    shift_size: Ignored<[usize; 3]>,
    drop_path: Ignored<f64>,
}

impl<B: Backend> SwinBlock3D<B> {
    pub fn forward(&self, x: Tensor<B, 5>, mode: ForwardMode) -> Tensor<B, 5> {
        let [b, t, h, w, c] = x.dims();
        let (window, shift) = effective_window([t, h, w], self.window_size.0, self.shift_size.0);
        let padded = [
            round_up(t, window[0]),
            round_up(h, window[1]),
            round_up(w, window[2]),
        ];

        let shortcut = x.clone();
        let mut y = self.norm1.forward(x);
        for (axis, &target) in padded.iter().enumerate() {
            y = pad_end(y, axis + 1, target);
        }

        let shifted = shift.iter().any(|&s| s > 0);
        for (axis, &s) in shift.iter().enumerate() {
            y = roll_back(y, axis + 1, s);
        }
        let mask = shifted.then(|| {
            let values = shifted_window_mask(padded, window, shift);
            let num_windows = (0..3).map(|i| padded[i] / window[i]).product::<usize>();
            let tokens = window.iter().product::<usize>();
            Tensor::<B, 3>::from_data(TensorData::new(values, [num_windows, tokens, tokens]), &y.device())
        });

        let windows = self.attn.forward(window_partition(y, window), window, mask);
        let mut y = window_reverse(windows, window, [b, padded[0], padded[1], padded[2], c]);
        for (axis, &s) in shift.iter().enumerate() {
            y = roll_forward(y, axis + 1, s);
        }
        let y = y.narrow(1, 0, t).narrow(2, 0, h).narrow(3, 0, w);

        let rate = self.drop_path.0;
        let x = shortcut + drop_path(y, rate, mode);
        let res = self.mlp.forward(self.norm2.forward(x.clone()), mode);
        x + drop_path(res, rate, mode)
    }
}

impl_named_weights!(SwinBlock3D { norm1, attn, norm2, mlp });

/// Halves height and width, doubles channels
#[derive(Module, Debug)]
pub struct PatchMerging<B: Backend> {
    pub norm: LayerNorm<B>,
    pub reduction: Linear<B>,
}

impl<B: Backend> PatchMerging<B> {
    fn new(dim: usize, device: &B::Device) -> Self {
        Self {
            norm: LayerNormConfig::new(4 * dim).init(device),
            reduction: LinearConfig::new(4 * dim, 2 * dim).with_bias(false).init(device),
        }
    }

    pub fn forward(&self, x: Tensor<B, 5>) -> Tensor<B, 5> {
        let [_, _, h, w, _] = x.dims();
        let x = pad_end(x, 2, round_up(h, 2));
        let x = merge_2x2(pad_end(x, 3, round_up(w, 2)));
        self.reduction.forward(self.norm.forward(x))
    }
}

impl_named_weights!(PatchMerging { norm, reduction });

#[derive(Module, Debug)]
pub struct SwinStage<B: Backend> {
    pub blocks: Vec<SwinBlock3D<B>>,
    pub downsample: Option<PatchMerging<B>>,
}

impl<B: Backend> SwinStage<B> {
    pub fn forward(&self, x: Tensor<B, 5>, mode: ForwardMode) -> Tensor<B, 5> {
        let mut x = x;
        for block in &self.blocks {
            x = block.forward(x, mode);
        }
        match &self.downsample {
            Some(merge) => merge.forward(x),
            None => x,
        }
    }
}

impl_named_weights!(SwinStage { blocks, downsample });

/// 3D patch projection with normalisation, channels-last output
#[derive(Module, Debug)]
pub struct PatchEmbed3D<B: Backend> {
    pub proj: Linear<B>,
    pub norm: LayerNorm<B>,
    patch_size: Ignored<[usize; 3]>,
}

impl<B: Backend> PatchEmbed3D<B> {
    pub fn forward(&self, clips: Tensor<B, 5>) -> Tensor<B, 5> {
        let [pt, ph, pw] = self.patch_size.0;
        let [_, _, t, h, w] = clips.dims();
        let clips = pad_end(clips, 2, round_up(t, pt));
        let clips = pad_end(clips, 3, round_up(h, ph));
        let clips = pad_end(clips, 4, round_up(w, pw));
        let patches = patchify_3d(clips, self.patch_size.0);
        self.norm.forward(self.proj.forward(patches))
    }
}

impl_named_weights!(PatchEmbed3D { proj, norm });

/// Backbone producing the pooled last-stage feature of a clip
#[derive(Module, Debug)]
pub struct SwinTransformer3D<B: Backend> {
    pub patch_embed: PatchEmbed3D<B>,
    pub layers: Vec<SwinStage<B>>,
    pub norm: LayerNorm<B>,
    pos_drop: Dropout,
    num_features: usize,
}

impl<B: Backend> SwinTransformer3D<B> {
    pub fn new(config: &SwinConfig, device: &B::Device) -> Self {
        let total_depth = config.depths.iter().sum();
        let mut rates = drop_path_schedule(config.drop_path_rate, total_depth).into_iter();
        let half_window = config.window_size.map(|w| w / 2);
        let num_stages = config.depths.len();

        let layers = config
            .depths
            .iter()
            .zip(&config.num_heads)
            .enumerate()
            .map(|(stage, (&depth, &heads))| {
                let dim = config.embed_dim << stage;
                let blocks = (0..depth)
                    .map(|i| SwinBlock3D {
                        norm1: LayerNormConfig::new(dim).init(device),
                        attn: WindowAttention3D::new(dim, heads, config.window_size, config.qkv_bias, device),
                        norm2: LayerNormConfig::new(dim).init(device),
                        mlp: Mlp::new(dim, dim * config.mlp_ratio, config.drop_rate, device),
                        window_size: Ignored(config.window_size),
                        shift_size: Ignored(if i % 2 == 0 { [0; 3] } else { half_window }),
                        drop_path: Ignored(rates.next().unwrap_or(0.0)),
                    })
                    .collect();
                SwinStage {
                    blocks,
                    downsample: (stage + 1 < num_stages).then(|| PatchMerging::new(dim, device)),
                }
            })
            .collect();

        let patch_volume = config.patch_size.iter().product::<usize>();
        Self {
            patch_embed: PatchEmbed3D {
                proj: LinearConfig::new(config.in_chans * patch_volume, config.embed_dim).init(device),
                norm: LayerNormConfig::new(config.embed_dim).init(device),
                patch_size: Ignored(config.patch_size),
            },
            layers,
            norm: LayerNormConfig::new(config.output_dim()).init(device),
            pos_drop: DropoutConfig::new(config.drop_rate).init(),
            num_features: config.output_dim(),
        }
    }

    pub fn output_dim(&self) -> usize {
        self.num_features
    }

    /// `[b, c, t, h, w]` to `[b, output_dim]`
    pub fn forward_features(&self, clips: Tensor<B, 5>, mode: ForwardMode) -> Tensor<B, 2> {
        let mut x = train_dropout(&self.pos_drop, self.patch_embed.forward(clips), mode);
        for layer in &self.layers {
            x = layer.forward(x, mode);
        }

        let x = self.norm.forward(x);
        let [b, t, h, w, c] = x.dims();
        x.reshape([b, t * h * w, c]).mean_dim(1).reshape([b, c])
    }
}

impl_named_weights!(SwinTransformer3D { patch_embed, layers, norm });
