//! Frame-directory decoding.
//!
//! Videos are stored as directories of extracted frames; frame order is the
//! lexicographic order of the file names.

use std::path::{Path, PathBuf};

use image::DynamicImage;
use walkdir::WalkDir;

use action_core::{Error, Result};

/// Sorted frame files of one video
#[derive(Debug, Clone)]
pub struct FrameDirectory {
    root: PathBuf,
    frames: Vec<PathBuf>,
}

impl FrameDirectory {
    /// List the frames of `root` whose extension is in `extensions` (case-insensitive).
    pub fn open(root: &Path, extensions: &[String]) -> Result<Self> {
        if !root.is_dir() {
            return Err(Error::NotFound(format!("frame directory not found: {}", root.display())));
        }

        let mut frames: Vec<PathBuf> = WalkDir::new(root)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .map(|entry| entry.into_path())
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| extensions.iter().any(|allowed| allowed.eq_ignore_ascii_case(ext)))
                    .unwrap_or(false)
            })
            .collect();
        frames.sort();

        if frames.is_empty() {
            return Err(Error::Dataset(format!("no frames found in {}", root.display())));
        }

        Ok(Self {
            root: root.to_path_buf(),
            frames,
        })
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn load(&self, index: usize) -> Result<DynamicImage> {
        let path = self.frames.get(index).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "frame {index} out of range for {} ({} frames)",
                self.root.display(),
                self.frames.len()
            ))
        })?;
        image::open(path).map_err(|e| Error::Image(format!("Failed to load frame {}: {e}", path.display())))
    }
}

/// Append an RGB frame to per-channel planes in `[C, T, H, W]` order.
///
/// `planes` holds one buffer per channel; each receives `H * W` values in `[0, 1]`.
pub fn push_frame_planes(frame: &DynamicImage, planes: &mut [Vec<f32>; 3]) {
    let rgb = frame.to_rgb8();
    for pixel in rgb.pixels() {
        for (channel, plane) in planes.iter_mut().enumerate() {
            plane.push(pixel[channel] as f32 / 255.0);
        }
    }
}
