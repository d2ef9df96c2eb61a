//! Temporal and spatial clip sampling.
//!
//! Temporal sampling picks `num_frames` frame indices spread over a span of
//! `num_frames * sampling_rate` frames. Spatial sampling resizes the short
//! side and crops a square; the same plan is applied to every frame of a clip.

use image::imageops::FilterType;
use image::DynamicImage;
use rand::Rng;

use action_core::{Error, Result};

/// Where a clip starts inside a video
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemporalPosition {
    /// Uniformly random start (training)
    Random,
    /// Middle of the video
    Center,
    /// Clip `index` of `count` evenly spaced clips
    Uniform { index: usize, count: usize },
}

/// First frame of the clip for a video of `total` frames.
pub fn clip_start<R: Rng>(total: usize, span: usize, position: TemporalPosition, rng: &mut R) -> usize {
    let delta = total.saturating_sub(span);
    match position {
        TemporalPosition::Random => rng.gen_range(0..=delta),
        TemporalPosition::Center => delta / 2,
        TemporalPosition::Uniform { index, count } => {
            if count <= 1 {
                0
            } else {
                delta * index.min(count - 1) / count
            }
        }
    }
}

/// `num_frames` indices linearly spaced over `[start, start + span - 1]`,
/// truncated and clamped into the video.
pub fn temporal_indices(total: usize, num_frames: usize, sampling_rate: usize, start: usize) -> Vec<usize> {
    if total == 0 || num_frames == 0 {
        return Vec::new();
    }
    let span = num_frames * sampling_rate;
    let end = (start + span).saturating_sub(1) as f64;
    let start = start as f64;
    let last = total - 1;

    (0..num_frames)
        .map(|i| {
            let position = if num_frames == 1 {
                start
            } else {
                start + (end - start) * i as f64 / (num_frames - 1) as f64
            };
            (position as usize).min(last)
        })
        .collect()
}

/// Resize, crop and flip parameters shared by all frames of a clip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpatialPlan {
    pub scaled_width: u32,
    pub scaled_height: u32,
    pub crop_x: u32,
    pub crop_y: u32,
    pub crop_size: u32,
    pub flip: bool,
}

fn scaled_dims(width: u32, height: u32, short_side: u32) -> (u32, u32) {
    if width <= height {
        let h = (height as f64 / width as f64 * short_side as f64).floor() as u32;
        (short_side, h.max(short_side))
    } else {
        let w = (width as f64 / height as f64 * short_side as f64).floor() as u32;
        (w.max(short_side), short_side)
    }
}

impl SpatialPlan {
    /// Random short-side scale in `jitter`, random crop, optional random flip.
    pub fn random<R: Rng>(
        width: u32,
        height: u32,
        jitter: [u32; 2],
        crop_size: u32,
        allow_flip: bool,
        rng: &mut R,
    ) -> Result<Self> {
        check_frame(width, height)?;
        let scale = rng.gen_range(jitter[0]..=jitter[1]).max(crop_size);
        let (scaled_width, scaled_height) = scaled_dims(width, height, scale);
        Ok(Self {
            scaled_width,
            scaled_height,
            crop_x: rng.gen_range(0..=scaled_width - crop_size),
            crop_y: rng.gen_range(0..=scaled_height - crop_size),
            crop_size,
            flip: allow_flip && rng.gen_bool(0.5),
        })
    }

    /// Short side resized to `crop_size`, then crop `spatial_index` along the
    /// longer side (0 = start, 1 = centre, 2 = end).
    pub fn uniform(width: u32, height: u32, crop_size: u32, spatial_index: usize) -> Result<Self> {
        check_frame(width, height)?;
        if spatial_index > 2 {
            return Err(Error::InvalidArgument(format!(
                "spatial crop index {spatial_index} out of range 0..=2"
            )));
        }
        let (scaled_width, scaled_height) = scaled_dims(width, height, crop_size);
        let mut crop_x = (scaled_width - crop_size).div_ceil(2);
        let mut crop_y = (scaled_height - crop_size).div_ceil(2);

        if scaled_height > scaled_width {
            match spatial_index {
                0 => crop_y = 0,
                2 => crop_y = scaled_height - crop_size,
                _ => {}
            }
        } else {
            match spatial_index {
                0 => crop_x = 0,
                2 => crop_x = scaled_width - crop_size,
                _ => {}
            }
        }

        Ok(Self {
            scaled_width,
            scaled_height,
            crop_x,
            crop_y,
            crop_size,
            flip: false,
        })
    }

    pub fn apply(&self, frame: &DynamicImage) -> DynamicImage {
        let resized = if frame.width() == self.scaled_width && frame.height() == self.scaled_height {
            frame.clone()
        } else {
            frame.resize_exact(self.scaled_width, self.scaled_height, FilterType::Triangle)
        };
        let cropped = resized.crop_imm(self.crop_x, self.crop_y, self.crop_size, self.crop_size);
        if self.flip {
            cropped.fliph()
        } else {
            cropped
        }
    }
}

fn check_frame(width: u32, height: u32) -> Result<()> {
    if width == 0 || height == 0 {
        return Err(Error::Image(format!("degenerate frame {width}x{height}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn test_uniform_starts_are_spaced() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let starts: Vec<usize> = (0..4)
            .map(|index| clip_start(100, 20, TemporalPosition::Uniform { index, count: 4 }, &mut rng))
            .collect();
        assert_eq!(starts, vec![0, 20, 40, 60]);
    }

    #[test]
    fn test_short_video_starts_at_zero() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        assert_eq!(clip_start(5, 64, TemporalPosition::Random, &mut rng), 0);
        assert_eq!(clip_start(5, 64, TemporalPosition::Center, &mut rng), 0);
    }

    #[test]
    fn test_random_start_in_range() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..50 {
            let start = clip_start(40, 16, TemporalPosition::Random, &mut rng);
            assert!(start <= 24);
        }
    }

    #[test]
    fn test_temporal_indices_linspace() {
        assert_eq!(temporal_indices(100, 4, 4, 10), vec![10, 15, 20, 25]);
    }

    #[test]
    fn test_temporal_indices_clamped() {
        let indices = temporal_indices(3, 4, 2, 0);
        assert_eq!(indices.len(), 4);
        assert!(indices.iter().all(|&i| i <= 2));
        assert_eq!(*indices.last().unwrap(), 2);
    }

    #[test]
    fn test_uniform_crops_landscape() {
        let left = SpatialPlan::uniform(320, 240, 224, 0).unwrap();
        let center = SpatialPlan::uniform(320, 240, 224, 1).unwrap();
        let right = SpatialPlan::uniform(320, 240, 224, 2).unwrap();
        assert_eq!((left.scaled_width, left.scaled_height), (298, 224));
        assert_eq!(left.crop_x, 0);
        assert_eq!(center.crop_x, 37);
        assert_eq!(right.crop_x, 298 - 224);
        assert!(SpatialPlan::uniform(320, 240, 224, 3).is_err());
    }

    #[test]
    fn test_uniform_crops_portrait() {
        let top = SpatialPlan::uniform(240, 320, 224, 0).unwrap();
        let bottom = SpatialPlan::uniform(240, 320, 224, 2).unwrap();
        assert_eq!(top.crop_y, 0);
        assert_eq!(bottom.crop_y, top.scaled_height - 224);
    }

    #[test]
    fn test_plan_apply_shape() {
        let frame = DynamicImage::new_rgb8(40, 30);
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let plan = SpatialPlan::random(40, 30, [20, 24], 16, true, &mut rng).unwrap();
        let out = plan.apply(&frame);
        assert_eq!((out.width(), out.height()), (16, 16));
    }
}
