//! Oriented surface patches.
//!
//! A patch is a small planar element with a homogeneous position, a unit
//! normal, a photometric score and the set of images that see it. `images[0]`
//! is the reference image: it defines the viewing ray for the depth
//! parameterization and the frame the patch axes are built in.

pub mod io;

use nalgebra::{Vector3, Vector4};

/// Identifier of a patch stored in a [`crate::store::PatchStore`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
pub struct PatchId(pub u64);

/// Lifecycle of a patch through the engine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PatchStatus {
    /// Produced by a seed/expansion source, not yet refined.
    Candidate,
    /// Geometry refined, not yet accepted into the store.
    Refined,
    /// Accepted into the store.
    Accepted,
}

/// An oriented surface element.
#[derive(Clone, Debug)]
pub struct Patch {
    /// Position, homogeneous with `w = 1`.
    pub coord: Vector4<f32>,
    /// Unit normal, homogeneous with `w = 0`.
    pub normal: Vector4<f32>,
    /// Photometric score: `1 - robust^-1(incc)`, 1.0 is a perfect fit.
    pub ncc: f32,
    /// Depth step along the reference viewing ray.
    pub dscale: f32,
    /// Angular step for the normal parameterization.
    pub ascale: f32,
    /// Images in which the patch is visible and photoconsistent;
    /// `images[0]` is the reference image.
    pub images: Vec<usize>,
    /// Grid cell per entry of `images`.
    pub grids: Vec<(i32, i32)>,
    /// Images that should see the patch but do not contribute
    /// photometrically.
    pub vimages: Vec<usize>,
    /// Grid cell per entry of `vimages`.
    pub vgrids: Vec<(i32, i32)>,
    /// Cached count of target images in `images`.
    pub timages: usize,
    /// Scratch score used by the filters.
    pub tmp: f32,
    pub status: PatchStatus,
}

impl Patch {
    /// A fresh candidate patch. The image list must name the intended
    /// reference image first.
    pub fn seed(coord: Vector4<f32>, normal: Vector4<f32>, images: Vec<usize>) -> Self {
        Self {
            coord,
            normal,
            ncc: 0.0,
            dscale: 0.0,
            ascale: 0.0,
            images,
            grids: Vec::new(),
            vimages: Vec::new(),
            vgrids: Vec::new(),
            timages: 0,
            tmp: 0.0,
            status: PatchStatus::Candidate,
        }
    }

    /// Photometric support over all images.
    pub fn score(&self, threshold: f32) -> f32 {
        (self.ncc - threshold).max(0.0) * self.images.len() as f32
    }

    /// Photometric support over target images only.
    pub fn score2(&self, threshold: f32) -> f32 {
        (self.ncc - threshold).max(0.0) * self.timages as f32
    }

    pub fn has_image(&self, index: usize) -> bool {
        self.images.contains(&index)
    }

    /// Refresh the cached target-image count.
    pub fn count_targets(&mut self, tnum: usize) {
        self.timages = self.images.iter().filter(|&&i| i < tnum).count();
    }
}

/// The 3-vector part of a homogeneous vector.
#[inline]
pub fn xyz(v: &Vector4<f32>) -> Vector3<f32> {
    Vector3::new(v.x, v.y, v.z)
}

/// Normalize the 3-vector part in place, leaving `w` untouched.
#[inline]
pub fn unitize3(v: &mut Vector4<f32>) {
    let n = xyz(v).norm();
    if n > 0.0 {
        v.x /= n;
        v.y /= n;
        v.z /= n;
    }
}
