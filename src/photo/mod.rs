//! Calibrated photographs and the photo-set queries the engine consumes.
//!
//! A `Photo` couples a 3x4 projection matrix with an image pyramid; the
//! optical center, optical axis and an orthonormal camera frame are derived
//! from the projection at construction. The per-photo `ipscale` links a
//! world-space step at a point to a pixel step at level 0, which is what the
//! optimizer's "fineness" unit is built from.

pub mod pyramid;

use nalgebra::{Matrix3x4, Vector3, Vector4};

use crate::patch::xyz;

pub use pyramid::{Layer, Pyramid};

/// A single calibrated photograph.
#[derive(Clone, Debug)]
pub struct Photo {
    /// Projection matrices per pyramid level (rows 0 and 1 halved per level).
    projections: Vec<Matrix3x4<f32>>,
    /// Optical center, homogeneous (w = 1).
    pub center: Vector4<f32>,
    /// Normalized third projection row; `oaxis . X` is the projective depth.
    pub oaxis: Vector4<f32>,
    /// Camera-frame x axis (unit, orthogonal to `yaxis` and `zaxis`).
    pub xaxis: Vector3<f32>,
    /// Camera-frame y axis.
    pub yaxis: Vector3<f32>,
    /// Viewing direction (rotational part of `oaxis`).
    pub zaxis: Vector3<f32>,
    /// World-to-pixel scale at level 0.
    pub ipscale: f32,
    pyramid: Pyramid,
    mask: Option<Vec<u8>>,
}

impl Photo {
    /// Derive a photo from its level-0 projection matrix and pyramid.
    pub fn from_projection(projection: Matrix3x4<f32>, pyramid: Pyramid) -> Self {
        let m = projection.fixed_view::<3, 3>(0, 0).into_owned();
        let p3 = Vector3::new(projection[(0, 3)], projection[(1, 3)], projection[(2, 3)]);
        let minv = m
            .try_inverse()
            .expect("projection matrix has a singular left 3x3 block");
        let c = -minv * p3;
        let center = Vector4::new(c.x, c.y, c.z, 1.0);

        let mut oaxis = projection.row(2).transpose().into_owned();
        let scale = oaxis.fixed_rows::<3>(0).norm();
        oaxis /= scale;

        let zaxis = Vector3::new(oaxis.x, oaxis.y, oaxis.z);
        let row0 = Vector3::new(projection[(0, 0)], projection[(0, 1)], projection[(0, 2)]);
        let yaxis = zaxis.cross(&row0).normalize();
        let xaxis = yaxis.cross(&zaxis);

        let xaxis4 = Vector4::new(xaxis.x, xaxis.y, xaxis.z, 0.0);
        let yaxis4 = Vector4::new(yaxis.x, yaxis.y, yaxis.z, 0.0);
        let fx = xaxis4.dot(&projection.row(0).transpose());
        let fy = yaxis4.dot(&projection.row(1).transpose());
        let ipscale = fx + fy;

        let mut projections = Vec::with_capacity(pyramid.num_levels());
        let mut p = projection;
        for _ in 0..pyramid.num_levels() {
            projections.push(p);
            for c in 0..4 {
                p[(0, c)] *= 0.5;
                p[(1, c)] *= 0.5;
            }
        }

        Self {
            projections,
            center,
            oaxis,
            xaxis,
            yaxis,
            zaxis,
            ipscale,
            pyramid,
            mask: None,
        }
    }

    /// Install a level-0 validity mask (`0` = excluded).
    pub fn set_mask(&mut self, mask: Vec<u8>) {
        assert_eq!(
            mask.len(),
            self.width(0) * self.height(0),
            "mask size mismatch"
        );
        self.mask = Some(mask);
    }

    pub fn num_levels(&self) -> usize {
        self.pyramid.num_levels()
    }

    pub fn width(&self, level: usize) -> usize {
        self.pyramid.level(level).width()
    }

    pub fn height(&self, level: usize) -> usize {
        self.pyramid.level(level).height()
    }

    /// Project a homogeneous world point to pixel coordinates `(u, v, 1)`.
    /// Points behind the camera map far outside any image.
    pub fn project(&self, coord: &Vector4<f32>, level: usize) -> Vector3<f32> {
        let q = self.projections[level] * coord;
        if q.z <= 0.0 {
            return Vector3::new(-0xffff as f32, -0xffff as f32, -1.0);
        }
        Vector3::new(q.x / q.z, q.y / q.z, 1.0)
    }

    pub fn color(&self, x: f32, y: f32, level: usize) -> [f32; 3] {
        self.pyramid.level(level).color(x, y)
    }

    /// Projective depth of a world point along the optical axis.
    pub fn depth(&self, coord: &Vector4<f32>) -> f32 {
        self.oaxis.dot(coord)
    }

    fn masked_out(&self, coord: &Vector4<f32>, level: usize) -> bool {
        let Some(mask) = &self.mask else {
            return false;
        };
        let icoord = self.project(coord, level);
        let scale = (1usize << level) as f32;
        let x = (icoord.x * scale).round();
        let y = (icoord.y * scale).round();
        if x < 0.0 || y < 0.0 {
            return true;
        }
        let (x, y) = (x as usize, y as usize);
        if x >= self.width(0) || y >= self.height(0) {
            return true;
        }
        mask[y * self.width(0) + x] == 0
    }
}

/// The set of photographs the engine works against.
#[derive(Clone, Debug)]
pub struct PhotoSet {
    photos: Vec<Photo>,
    /// Pairwise optical-center distances.
    pub distances: Vec<Vec<f32>>,
    /// Per-image covisibility candidates; defaults to all other images.
    pub visdata: Vec<Vec<usize>>,
    bounding_images: Vec<usize>,
}

impl PhotoSet {
    pub fn new(photos: Vec<Photo>) -> Self {
        let n = photos.len();
        let mut distances = vec![vec![0.0f32; n]; n];
        for i in 0..n {
            for j in 0..n {
                if i != j {
                    distances[i][j] = xyz(&(photos[i].center - photos[j].center)).norm();
                }
            }
        }
        let visdata = (0..n)
            .map(|i| (0..n).filter(|&j| j != i).collect())
            .collect();
        Self {
            photos,
            distances,
            visdata,
            bounding_images: Vec::new(),
        }
    }

    /// Restrict covisibility to explicit per-image candidate lists.
    pub fn set_visdata(&mut self, visdata: Vec<Vec<usize>>) {
        assert_eq!(visdata.len(), self.photos.len(), "visdata size mismatch");
        self.visdata = visdata;
    }

    /// Require every patch to project inside the listed images.
    pub fn set_bounding_images(&mut self, images: Vec<usize>) {
        self.bounding_images = images;
    }

    pub fn len(&self) -> usize {
        self.photos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.photos.is_empty()
    }

    pub fn photo(&self, index: usize) -> &Photo {
        &self.photos[index]
    }

    pub fn photo_mut(&mut self, index: usize) -> &mut Photo {
        &mut self.photos[index]
    }

    pub fn project(&self, index: usize, coord: &Vector4<f32>, level: usize) -> Vector3<f32> {
        self.photos[index].project(coord, level)
    }

    pub fn color(&self, index: usize, x: f32, y: f32, level: usize) -> [f32; 3] {
        self.photos[index].color(x, y, level)
    }

    pub fn width(&self, index: usize, level: usize) -> usize {
        self.photos[index].width(level)
    }

    pub fn height(&self, index: usize, level: usize) -> usize {
        self.photos[index].height(level)
    }

    pub fn depth(&self, index: usize, coord: &Vector4<f32>) -> f32 {
        self.photos[index].depth(coord)
    }

    /// World-space size of one pixel of image `index` at `coord` and `level`,
    /// the "fineness" unit of the optimizer.
    pub fn pixel_unit(&self, index: usize, coord: &Vector4<f32>, level: usize) -> f32 {
        let photo = &self.photos[index];
        let fz = xyz(&(*coord - photo.center)).norm();
        if photo.ipscale == 0.0 {
            return 1.0;
        }
        2.0 * fz * (1usize << level) as f32 / photo.ipscale
    }

    /// True unless some target image's installed mask excludes the point.
    pub fn mask(&self, coord: &Vector4<f32>, level: usize, tnum: usize) -> bool {
        !self.photos[..tnum.min(self.photos.len())]
            .iter()
            .any(|p| p.masked_out(coord, level))
    }

    /// Edge/feature test for image `index`; true when no edge mask is
    /// installed.
    pub fn edge(&self, coord: &Vector4<f32>, index: usize, level: usize) -> bool {
        !self.photos[index].masked_out(coord, level)
    }

    /// True when the point projects inside every configured bounding image.
    pub fn inside_bounding_images(&self, coord: &Vector4<f32>) -> bool {
        self.bounding_images.iter().all(|&i| {
            let icoord = self.project(i, coord, 0);
            icoord.x >= 0.0
                && icoord.y >= 0.0
                && icoord.x < (self.width(i, 0) - 1) as f32
                && icoord.y < (self.height(i, 0) - 1) as f32
        })
    }

    /// Parallax check: at least one image pair must subtend an angle inside
    /// `(min_angle, max_angle)` at `coord`. The image-count threshold is
    /// accepted for interface compatibility but does not enter the test.
    pub fn check_angles(
        &self,
        coord: &Vector4<f32>,
        images: &[usize],
        min_angle: f32,
        max_angle: f32,
        _min_images: usize,
    ) -> bool {
        let rays: Vec<Vector3<f32>> = images
            .iter()
            .map(|&i| xyz(&(self.photos[i].center - *coord)).normalize())
            .collect();
        let mut count = 0;
        for i in 0..rays.len() {
            for j in i + 1..rays.len() {
                let angle = rays[i].dot(&rays[j]).clamp(-1.0, 1.0).acos();
                if min_angle < angle && angle < max_angle {
                    count += 1;
                }
            }
        }
        count >= 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn center_and_axis_recovered_from_projection() {
        let pos = Vector3::new(0.0, 0.0, 4.0);
        let photo = testutil::render_plane_photo(pos, 64, 64, 3, &|_, _| [0.5, 0.5, 0.5]);
        assert!((xyz(&photo.center) - pos).norm() < 1e-4);
        // The camera looks at the origin from +z, so the optical axis points
        // along -z and the depth of the origin is the distance to the camera.
        assert!((photo.zaxis - Vector3::new(0.0, 0.0, -1.0)).norm() < 1e-4);
        let depth = photo.depth(&Vector4::new(0.0, 0.0, 0.0, 1.0));
        assert!((depth - 4.0).abs() < 1e-3);
        assert!((photo.yaxis.dot(&photo.zaxis)).abs() < 1e-5);
        assert!((photo.xaxis.norm() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn projection_levels_halve_pixel_coordinates() {
        let photo =
            testutil::render_plane_photo(Vector3::new(0.5, 0.3, 4.0), 64, 64, 3, &|_, _| {
                [0.0, 0.0, 0.0]
            });
        let x = Vector4::new(0.1, -0.2, 0.0, 1.0);
        let p0 = photo.project(&x, 0);
        let p1 = photo.project(&x, 1);
        assert!((p0.x / 2.0 - p1.x).abs() < 1e-4);
        assert!((p0.y / 2.0 - p1.y).abs() < 1e-4);
    }

    #[test]
    fn pixel_unit_matches_projected_displacement() {
        let photos = testutil::plane_scene(3, 64, 64, 4, 7);
        let coord = Vector4::new(0.0, 0.0, 0.0, 1.0);
        let unit = photos.pixel_unit(0, &coord, 1);
        // Stepping one unit sideways in world space should move the
        // projection by roughly one pixel at level 1.
        let photo = photos.photo(0);
        let step = Vector4::new(
            photo.xaxis.x * unit,
            photo.xaxis.y * unit,
            photo.xaxis.z * unit,
            0.0,
        );
        let moved = (photo.project(&(coord + step), 1) - photo.project(&coord, 1)).norm();
        assert!((moved - 1.0).abs() < 0.2, "moved {moved}");
    }

    #[test]
    fn check_angles_requires_parallax_window() {
        let photos = testutil::plane_scene(3, 64, 64, 3, 11);
        let coord = Vector4::new(0.0, 0.0, 0.0, 1.0);
        let all: Vec<usize> = (0..photos.len()).collect();
        assert!(photos.check_angles(&coord, &all, 0.05, 1.2, 3));
        // No pair can subtend more than ~180 degrees of parallax.
        assert!(!photos.check_angles(&coord, &all, 3.0, 3.1, 3));
        // A single image has no pairs at all.
        assert!(!photos.check_angles(&coord, &all[..1], 0.05, 1.2, 3));
    }

    #[test]
    fn mask_only_consults_target_images() {
        let mut photos = (*testutil::plane_scene(3, 64, 64, 3, 11)).clone();
        // Fully mask out the last image.
        let masked = photos.len() - 1;
        let (w, h) = (photos.width(masked, 0), photos.height(masked, 0));
        photos.photo_mut(masked).set_mask(vec![0u8; w * h]);

        let coord = Vector4::new(0.0, 0.0, 0.0, 1.0);
        // As a target image the mask excludes the point; as a non-target
        // image it is ignored.
        assert!(!photos.mask(&coord, 1, photos.len()));
        assert!(photos.mask(&coord, 1, masked));
    }
}
