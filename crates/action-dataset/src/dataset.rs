//! Video clip dataset implementing burn's `Dataset` trait.
//!
//! Frames are decoded lazily in `get`, so a dataset is cheap to clone and
//! share between loader workers.

use std::sync::Arc;

use burn::data::dataset::Dataset;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use action_core::{DataConfig, DataSplit, Error, Result, RunConfig};

use crate::frames::{push_frame_planes, FrameDirectory};
use crate::sampling::{clip_start, temporal_indices, SpatialPlan, TemporalPosition};
use crate::split::{read_split, VideoRecord};

/// How clips are drawn from each video
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClipSampling {
    /// One random clip with random scale, crop and flip
    Train,
    /// One centred clip, centre crop
    SingleView,
    /// `views` evenly spaced clips, each with `crops` spatial crops
    MultiView { views: usize, crops: usize },
}

impl ClipSampling {
    pub fn views_per_video(&self) -> usize {
        match self {
            ClipSampling::Train | ClipSampling::SingleView => 1,
            ClipSampling::MultiView { views, crops } => views * crops,
        }
    }
}

/// Where a clip came from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipMeta {
    pub video_path: String,
    pub temporal_index: usize,
    pub spatial_index: usize,
}

/// One decoded clip
#[derive(Debug, Clone)]
pub struct VideoClip {
    /// `[C, T, H, W]` values in `[0, 1]`
    pub data: Vec<f32>,
    pub shape: [usize; 4],
    pub label: usize,
    /// Index of the source video; shared by every view of that video
    pub sample_index: usize,
    pub meta: ClipMeta,
    /// False when every decode attempt failed; the batcher drops such clips
    pub decoded: bool,
}

impl VideoClip {
    /// Stand-in for an item whose video could not be read.
    pub fn undecoded(label: usize, sample_index: usize, meta: ClipMeta) -> Self {
        Self {
            data: Vec::new(),
            shape: [3, 0, 0, 0],
            label,
            sample_index,
            meta,
            decoded: false,
        }
    }
}

/// Per-clip geometry derived from the `DATA` section
#[derive(Debug, Clone, PartialEq)]
pub struct ClipSettings {
    pub num_frames: usize,
    pub sampling_rate: usize,
    pub train_jitter_scales: [u32; 2],
    pub train_crop_size: u32,
    pub test_crop_size: u32,
    pub random_flip: bool,
    pub frame_extensions: Vec<String>,
    pub decode_retries: usize,
}

impl From<&DataConfig> for ClipSettings {
    fn from(data: &DataConfig) -> Self {
        Self {
            num_frames: data.num_frames,
            sampling_rate: data.sampling_rate,
            train_jitter_scales: data.train_jitter_scales,
            train_crop_size: data.train_crop_size,
            test_crop_size: data.test_crop_size,
            random_flip: data.random_flip,
            frame_extensions: data.frame_extensions.clone(),
            decode_retries: data.decode_retries.max(1),
        }
    }
}

/// Videos of one split, expanded into clips by a [`ClipSampling`]
#[derive(Debug, Clone)]
pub struct VideoDataset {
    records: Arc<Vec<VideoRecord>>,
    settings: ClipSettings,
    sampling: ClipSampling,
    split: DataSplit,
}

impl VideoDataset {
    pub fn new(records: Vec<VideoRecord>, settings: ClipSettings, sampling: ClipSampling, split: DataSplit) -> Self {
        Self {
            records: Arc::new(records),
            settings,
            sampling,
            split,
        }
    }

    /// Read the split file named by `split` under `DATA.PATH_TO_DATA_DIR`.
    pub fn from_split(config: &RunConfig, split: DataSplit, sampling: ClipSampling) -> Result<Self> {
        let data = &config.data;
        let records = read_split(&data.path_to_data_dir, split, &data.path_prefix, &data.path_label_separator)?;

        let num_classes = config.model.num_classes;
        if let Some(bad) = records.iter().find(|r| r.label >= num_classes) {
            return Err(Error::Dataset(format!(
                "{} has label {} but MODEL.NUM_CLASSES is {num_classes}",
                bad.path.display(),
                bad.label
            )));
        }

        Ok(Self::new(records, ClipSettings::from(data), sampling, split))
    }

    pub fn num_videos(&self) -> usize {
        self.records.len()
    }

    pub fn sampling(&self) -> ClipSampling {
        self.sampling
    }

    pub fn split(&self) -> DataSplit {
        self.split
    }

    pub fn records(&self) -> &[VideoRecord] {
        &self.records
    }

    /// Map a flat item index to `(video, temporal index, spatial index)`.
    pub fn locate(&self, index: usize) -> (usize, usize, usize) {
        match self.sampling {
            ClipSampling::Train => (index, 0, 0),
            ClipSampling::SingleView => (index, 0, 1),
            ClipSampling::MultiView { views, crops } => {
                let per_video = views * crops;
                let within = index % per_video;
                (index / per_video, within / crops, within % crops)
            }
        }
    }

    fn temporal_position(&self, temporal_index: usize) -> TemporalPosition {
        match self.sampling {
            ClipSampling::Train => TemporalPosition::Random,
            ClipSampling::SingleView => TemporalPosition::Center,
            ClipSampling::MultiView { views, .. } => TemporalPosition::Uniform {
                index: temporal_index,
                count: views,
            },
        }
    }

    /// Decode the clip `(video, temporal_index, spatial_index)`.
    pub fn load_clip<R: RngCore>(
        &self,
        video: usize,
        temporal_index: usize,
        spatial_index: usize,
        rng: &mut R,
    ) -> Result<VideoClip> {
        let record = self
            .records
            .get(video)
            .ok_or_else(|| Error::InvalidArgument(format!("video index {video} out of range")))?;
        let settings = &self.settings;

        let frames = FrameDirectory::open(&record.path, &settings.frame_extensions)?;
        let span = settings.num_frames * settings.sampling_rate;
        let start = clip_start(frames.len(), span, self.temporal_position(temporal_index), rng);
        let indices = temporal_indices(frames.len(), settings.num_frames, settings.sampling_rate, start);

        let first = frames.load(indices[0])?;
        let plan = match self.sampling {
            ClipSampling::Train => SpatialPlan::random(
                first.width(),
                first.height(),
                settings.train_jitter_scales,
                settings.train_crop_size,
                settings.random_flip,
                rng,
            )?,
            ClipSampling::SingleView | ClipSampling::MultiView { .. } => {
                SpatialPlan::uniform(first.width(), first.height(), settings.test_crop_size, spatial_index)?
            }
        };

        let crop = plan.crop_size as usize;
        let mut planes: [Vec<f32>; 3] = Default::default();
        for plane in planes.iter_mut() {
            plane.reserve(indices.len() * crop * crop);
        }

        push_frame_planes(&plan.apply(&first), &mut planes);
        for &frame_index in &indices[1..] {
            let frame = frames.load(frame_index)?;
            if frame.width() != first.width() || frame.height() != first.height() {
                return Err(Error::Image(format!(
                    "frame {frame_index} of {} is {}x{}, expected {}x{}",
                    record.path.display(),
                    frame.width(),
                    frame.height(),
                    first.width(),
                    first.height()
                )));
            }
            push_frame_planes(&plan.apply(&frame), &mut planes);
        }

        let [r, g, b] = planes;
        let mut data = r;
        data.extend(g);
        data.extend(b);

        Ok(VideoClip {
            data,
            shape: [3, indices.len(), crop, crop],
            label: record.label,
            sample_index: video,
            meta: ClipMeta {
                video_path: record.path.display().to_string(),
                temporal_index,
                spatial_index,
            },
            decoded: true,
        })
    }
}

impl Dataset<VideoClip> for VideoDataset {
    fn get(&self, index: usize) -> Option<VideoClip> {
        if index >= self.len() {
            return None;
        }

        let (requested, temporal_index, spatial_index) = self.locate(index);
        let mut video = requested;
        let mut rng = rand::thread_rng();
        let retries = self.settings.decode_retries;

        for attempt in 0..retries {
            match self.load_clip(video, temporal_index, spatial_index, &mut rng) {
                Ok(clip) => return Some(clip),
                Err(err) => {
                    warn!(
                        "Failed to load video {} (attempt {}/{}): {err}",
                        self.records[video].path.display(),
                        attempt + 1,
                        retries
                    );
                    // multi-view items must stay tied to their video
                    if !matches!(self.sampling, ClipSampling::MultiView { .. })
                        && attempt + 1 >= retries / 2
                        && self.records.len() > 1
                    {
                        video = rng.gen_range(0..self.records.len());
                    }
                }
            }
        }

        // a `None` inside the range would end burn's loader early
        let record = &self.records[requested];
        error!(
            "Giving up on item {index} ({}) after {retries} attempts",
            record.path.display()
        );
        Some(VideoClip::undecoded(
            record.label,
            requested,
            ClipMeta {
                video_path: record.path.display().to_string(),
                temporal_index,
                spatial_index,
            },
        ))
    }

    fn len(&self) -> usize {
        self.records.len() * self.sampling.views_per_video()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgb, RgbImage};
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;
    use std::path::Path;
    use tempfile::TempDir;

    fn write_video(dir: &Path, name: &str, frames: usize, width: u32, height: u32) -> VideoRecord {
        let video_dir = dir.join(name);
        std::fs::create_dir_all(&video_dir).unwrap();
        for i in 0..frames {
            let value = (i * 10) as u8;
            RgbImage::from_pixel(width, height, Rgb([value, value, value]))
                .save(video_dir.join(format!("img_{i:05}.png")))
                .unwrap();
        }
        VideoRecord { path: video_dir, label: 1 }
    }

    fn settings() -> ClipSettings {
        ClipSettings {
            num_frames: 4,
            sampling_rate: 2,
            train_jitter_scales: [16, 20],
            train_crop_size: 16,
            test_crop_size: 16,
            random_flip: true,
            frame_extensions: vec!["png".to_string()],
            decode_retries: 2,
        }
    }

    #[test]
    fn test_multi_view_indexing() {
        let dataset = VideoDataset::new(
            vec![VideoRecord { path: "a".into(), label: 0 }, VideoRecord { path: "b".into(), label: 1 }],
            settings(),
            ClipSampling::MultiView { views: 2, crops: 3 },
            DataSplit::Test,
        );
        assert_eq!(dataset.len(), 12);
        assert_eq!(dataset.locate(0), (0, 0, 0));
        assert_eq!(dataset.locate(4), (0, 1, 1));
        assert_eq!(dataset.locate(6), (1, 0, 0));
        assert_eq!(dataset.locate(11), (1, 1, 2));
    }

    #[test]
    fn test_load_clip_shape_and_order() {
        let dir = TempDir::new().unwrap();
        let record = write_video(dir.path(), "v0", 8, 16, 16);
        let dataset = VideoDataset::new(vec![record], settings(), ClipSampling::SingleView, DataSplit::Val);

        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let clip = dataset.load_clip(0, 0, 1, &mut rng).unwrap();
        assert_eq!(clip.shape, [3, 4, 16, 16]);
        assert_eq!(clip.data.len(), 3 * 4 * 16 * 16);
        assert_eq!(clip.label, 1);
        assert_eq!(clip.sample_index, 0);
        // channel 0, frames 0..4 sample indices [0, 2, 4, 7] of an 8-frame video
        let plane = 16 * 16;
        assert!((clip.data[0] - 0.0).abs() < 1e-6);
        assert!((clip.data[plane] - 20.0 / 255.0).abs() < 1e-3);
        assert!((clip.data[3 * plane] - 70.0 / 255.0).abs() < 1e-3);
    }

    #[test]
    fn test_get_multi_view_tags_video_index() {
        let dir = TempDir::new().unwrap();
        let records = vec![
            write_video(dir.path(), "v0", 4, 20, 16),
            write_video(dir.path(), "v1", 4, 20, 16),
        ];
        let dataset = VideoDataset::new(
            records,
            settings(),
            ClipSampling::MultiView { views: 2, crops: 3 },
            DataSplit::Test,
        );
        let clip = dataset.get(7).unwrap();
        assert_eq!(clip.sample_index, 1);
        assert_eq!(clip.meta.temporal_index, 0);
        assert_eq!(clip.meta.spatial_index, 1);
        assert!(dataset.get(12).is_none());
    }

    #[test]
    fn test_train_clip_random_crop() {
        let dir = TempDir::new().unwrap();
        let record = write_video(dir.path(), "v0", 10, 30, 20);
        let dataset = VideoDataset::new(vec![record], settings(), ClipSampling::Train, DataSplit::Train);
        let clip = dataset.get(0).unwrap();
        assert_eq!(clip.shape, [3, 4, 16, 16]);
    }

    #[test]
    fn test_missing_video_yields_undecoded_clip() {
        let dir = TempDir::new().unwrap();
        let dataset = VideoDataset::new(
            vec![
                VideoRecord { path: "/nonexistent/video".into(), label: 2 },
                write_video(dir.path(), "v1", 4, 20, 16),
            ],
            settings(),
            ClipSampling::MultiView { views: 1, crops: 1 },
            DataSplit::Test,
        );

        let broken = dataset.get(0).unwrap();
        assert!(!broken.decoded);
        assert_eq!(broken.sample_index, 0);
        assert_eq!(broken.label, 2);
        assert_eq!(broken.meta.video_path, "/nonexistent/video");

        let next = dataset.get(1).unwrap();
        assert!(next.decoded);
        assert_eq!(next.sample_index, 1);
    }
}
