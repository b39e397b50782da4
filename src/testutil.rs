//! Synthetic plane scenes shared by the unit tests.
//!
//! Cameras sit on an arc above the textured plane `z = 0`, all looking at
//! the origin, and render it analytically through the plane homography, so
//! every view is photometrically consistent by construction.

use std::sync::Arc;

use nalgebra::{Matrix3, Matrix3x4, Vector3, Vector4};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::config::Config;
use crate::patch::Patch;
use crate::photo::{Photo, PhotoSet, Pyramid};

pub(crate) fn test_config(num_images: usize) -> Config {
    Config {
        cpu: 2,
        level: 1,
        ..Config::default()
    }
    .resolve(num_images)
}

/// Smooth random texture over the plane: a coarse value-noise lattice plus
/// low-frequency waves, per channel.
pub(crate) fn plane_texture(seed: u64) -> impl Fn(f32, f32) -> [f32; 3] {
    const N: usize = 9;
    let mut rng = StdRng::seed_from_u64(seed);
    let lattice: Vec<f32> = (0..N * N).map(|_| rng.gen::<f32>()).collect();

    move |x: f32, y: f32| {
        let u = ((x + 2.0) / 4.0 * (N - 1) as f32).clamp(0.0, (N - 1) as f32 - 1e-3);
        let v = ((y + 2.0) / 4.0 * (N - 1) as f32).clamp(0.0, (N - 1) as f32 - 1e-3);
        let (i, j) = (u as usize, v as usize);
        let (fu, fv) = (u - i as f32, v - j as f32);
        let bump = lattice[j * N + i] * (1.0 - fu) * (1.0 - fv)
            + lattice[j * N + i + 1] * fu * (1.0 - fv)
            + lattice[(j + 1) * N + i] * (1.0 - fu) * fv
            + lattice[(j + 1) * N + i + 1] * fu * fv;

        let wave = 0.2 * (7.0 * x).sin() * (5.0 * y).cos() + 0.15 * (4.0 * x + 3.0 * y).sin();
        let base = 0.45 + 0.3 * bump + wave;
        [
            base,
            0.8 * base + 0.1 + 0.05 * (3.0 * x).sin(),
            0.6 * base + 0.2 + 0.05 * (2.0 * y).cos(),
        ]
    }
}

/// Pinhole projection of a camera at `position` looking at the origin.
pub(crate) fn look_at_projection(
    position: Vector3<f32>,
    focal: f32,
    width: usize,
    height: usize,
) -> Matrix3x4<f32> {
    let zc = (-position).normalize();
    let up = Vector3::new(0.0, 1.0, 0.0);
    let xc = up.cross(&zc).normalize();
    let yc = zc.cross(&xc);

    let r = Matrix3::from_rows(&[xc.transpose(), yc.transpose(), zc.transpose()]);
    let t = -r * position;
    let mut ext = Matrix3x4::zeros();
    ext.fixed_view_mut::<3, 3>(0, 0).copy_from(&r);
    ext.set_column(3, &t);

    let k = Matrix3::new(
        focal,
        0.0,
        width as f32 / 2.0,
        0.0,
        focal,
        height as f32 / 2.0,
        0.0,
        0.0,
        1.0,
    );
    k * ext
}

/// Render the plane `z = 0` into a photo through the plane homography.
pub(crate) fn render_plane_photo(
    position: Vector3<f32>,
    width: usize,
    height: usize,
    levels: usize,
    tex: &dyn Fn(f32, f32) -> [f32; 3],
) -> Photo {
    let focal = 1.2 * width as f32;
    let projection = look_at_projection(position, focal, width, height);

    let h = Matrix3::from_columns(&[
        projection.column(0).into_owned(),
        projection.column(1).into_owned(),
        projection.column(3).into_owned(),
    ]);
    let hinv = h.try_inverse().expect("camera lies in the plane");

    let mut data = Vec::with_capacity(3 * width * height);
    for y in 0..height {
        for x in 0..width {
            let q = hinv * Vector3::new(x as f32, y as f32, 1.0);
            data.extend_from_slice(&tex(q.x / q.z, q.y / q.z));
        }
    }
    Photo::from_projection(projection, Pyramid::from_base(width, height, data, levels))
}

pub(crate) fn camera_positions(ncams: usize) -> Vec<Vector3<f32>> {
    let radius = 4.0;
    (0..ncams)
        .map(|i| {
            let theta = if ncams == 1 {
                0.0
            } else {
                (i as f32 / (ncams - 1) as f32 - 0.5) * (56.0f32).to_radians()
            };
            Vector3::new(
                radius * theta.sin(),
                0.4 * (i % 2) as f32,
                radius * theta.cos(),
            )
        })
        .collect()
}

pub(crate) fn plane_scene(
    ncams: usize,
    width: usize,
    height: usize,
    levels: usize,
    seed: u64,
) -> Arc<PhotoSet> {
    let tex = plane_texture(seed);
    let photos = camera_positions(ncams)
        .into_iter()
        .map(|p| render_plane_photo(p, width, height, levels, &tex))
        .collect();
    Arc::new(PhotoSet::new(photos))
}

/// Same scene, but camera `black` sees a uniform black image.
pub(crate) fn plane_scene_with_black(
    ncams: usize,
    width: usize,
    height: usize,
    levels: usize,
    seed: u64,
    black: usize,
) -> Arc<PhotoSet> {
    let tex = plane_texture(seed);
    let photos = camera_positions(ncams)
        .into_iter()
        .enumerate()
        .map(|(i, p)| {
            if i == black {
                render_plane_photo(p, width, height, levels, &|_, _| [0.0, 0.0, 0.0])
            } else {
                render_plane_photo(p, width, height, levels, &tex)
            }
        })
        .collect();
    Arc::new(PhotoSet::new(photos))
}

/// A ground-truth patch on the plane at `(x, y, 0)`, seeing every camera.
pub(crate) fn plane_patch(photos: &PhotoSet, x: f32, y: f32) -> Patch {
    let mut patch = Patch::seed(
        Vector4::new(x, y, 0.0, 1.0),
        Vector4::new(0.0, 0.0, 1.0, 0.0),
        (0..photos.len()).collect(),
    );
    patch.ncc = 0.9;
    patch
}
