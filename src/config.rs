//! Engine configuration.
//!
//! All thresholds that steer image selection, photometric refinement and
//! filtering live here. Angles are radians, image indices below `tnum` are
//! "target" images (eligible as reference views), and `level` is the pyramid
//! level the whole engine operates at.

use std::f32::consts::PI;

/// Parameters of the patch optimization and filtering engine.
#[derive(Clone, Debug)]
pub struct Config {
    /// Number of worker threads.
    pub cpu: usize,

    /// Number of target images; images with index `< tnum` may serve as
    /// reference views and participate in grids and depth maps.
    /// `0` means "all images are targets" and is resolved at engine init.
    pub tnum: usize,

    /// Maximum number of images used per photometric evaluation.
    pub tau: usize,

    /// Side length of the sampled texture window (pixels, odd).
    pub wsize: usize,

    /// Pyramid level the engine operates at.
    pub level: usize,

    /// Depth-consistency mode: 0 = off, 1 = maintain visibility grids,
    /// 2 = additionally gate accepted patches on gain and neighbor fit.
    pub depth: u8,

    /// Maximum angle between optical axes for two images to be considered
    /// covisible during image collection.
    pub angle_threshold0: f32,

    /// Maximum angle between a patch normal and a viewing ray for the image
    /// to keep seeing the patch.
    pub angle_threshold1: f32,

    /// Minimum parallax: at least one image pair must subtend more than this
    /// angle at the patch.
    pub max_angle_threshold: f32,

    /// Maximum image-index distance for covisibility in ordered sequences;
    /// `-1` disables the constraint.
    pub sequence_threshold: i32,

    /// NCC acceptance threshold for the final image constraint.
    pub ncc_threshold: f32,

    /// Looser NCC threshold applied before refinement.
    pub ncc_threshold_before: f32,

    /// Minimum number of images a stored patch must keep.
    pub min_image_num: usize,

    /// Grid cell size in pixels at `level`.
    pub csize: usize,

    /// Mean quadric-fit residual (in pixel units) above which a patch is
    /// inconsistent with its neighbors.
    pub quad_threshold: f32,

    /// Base factor for the tangent-plane neighbor predicate.
    pub neighbor_threshold: f32,

    /// Depth slack factor for visibility tests against the depth maps.
    pub neighbor_threshold1: f32,

    /// Connected components smaller than this are discarded.
    pub min_patches_grid: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cpu: 4,
            tnum: 0,
            tau: 6,
            wsize: 7,
            level: 1,
            depth: 2,
            angle_threshold0: 60.0 * PI / 180.0,
            angle_threshold1: 60.0 * PI / 180.0,
            max_angle_threshold: 10.0 * PI / 180.0,
            sequence_threshold: -1,
            ncc_threshold: 0.7,
            ncc_threshold_before: 0.4,
            min_image_num: 3,
            csize: 2,
            quad_threshold: 2.5,
            neighbor_threshold: 0.5,
            neighbor_threshold1: 1.0,
            min_patches_grid: 20,
        }
    }
}

impl Config {
    /// Clamp image-dependent fields against the actual number of images.
    pub fn resolve(mut self, num_images: usize) -> Self {
        if self.tnum == 0 || self.tnum > num_images {
            self.tnum = num_images;
        }
        self.tau = self.tau.clamp(2, num_images.max(2));
        self.cpu = self.cpu.max(1);
        self
    }
}
