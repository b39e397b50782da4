//! Demo driver: reconstruct a synthetic textured plane.
//!
//! Builds a ring of calibrated cameras around the plane `z = 0`, seeds a
//! grid of perturbed candidate patches, runs the optimize and filter
//! phases, and optionally writes the surviving patches to a `.patch` file:
//!
//! ```text
//! rust-pmvs [output.patch]
//! ```

use std::fs::File;
use std::io::BufWriter;

use anyhow::Result;
use nalgebra::{Matrix3, Matrix3x4, Vector3, Vector4};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::info;

use rust_pmvs::config::Config;
use rust_pmvs::patch::{io as patch_io, xyz, Patch};
use rust_pmvs::photo::{Photo, PhotoSet, Pyramid};
use rust_pmvs::system::Engine;

const NUM_CAMERAS: usize = 7;
const IMAGE_SIZE: usize = 240;
const PYRAMID_LEVELS: usize = 4;
const SEED_SPACING: f32 = 0.08;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let output = std::env::args().nth(1);

    let photos = std::sync::Arc::new(build_scene());
    info!(cameras = photos.len(), size = IMAGE_SIZE, "scene ready");

    let cfg = Config {
        cpu: std::thread::available_parallelism().map_or(4, |n| n.get()),
        level: 1,
        ..Config::default()
    };
    let mut engine = Engine::new(photos.clone(), cfg);

    let candidates = seed_candidates(&photos, &engine);
    let stats = engine.optimize(candidates);
    info!(
        accepted = stats.accepted,
        candidates = stats.candidates,
        "optimization finished"
    );

    engine.run_filter();

    let store = engine.store();
    let mut mean_ncc = 0.0f32;
    for (_, patch) in store.patches() {
        mean_ncc += patch.ncc;
    }
    if store.len() > 0 {
        mean_ncc /= store.len() as f32;
    }
    info!(patches = store.len(), mean_ncc, "reconstruction done");

    if let Some(path) = output {
        let patches: Vec<&Patch> = store.patches().map(|(_, p)| p).collect();
        patch_io::write_patches(BufWriter::new(File::create(&path)?), &patches)?;
        info!(path = %path, count = patches.len(), "patch file written");
    }
    Ok(())
}

/// Cameras on an arc at radius 4 looking at the origin, each rendering the
/// procedurally textured plane `z = 0` through its plane homography.
fn build_scene() -> PhotoSet {
    let tex = plane_texture(42);
    let mut photos = Vec::with_capacity(NUM_CAMERAS);
    for i in 0..NUM_CAMERAS {
        let theta = (i as f32 / (NUM_CAMERAS - 1) as f32 - 0.5) * (54.0f32).to_radians();
        let position = Vector3::new(
            4.0 * theta.sin(),
            0.5 * (i % 2) as f32,
            4.0 * theta.cos(),
        );
        photos.push(render_plane(position, &tex));
    }
    PhotoSet::new(photos)
}

fn plane_texture(seed: u64) -> impl Fn(f32, f32) -> [f32; 3] {
    const N: usize = 11;
    let mut rng = StdRng::seed_from_u64(seed);
    let lattice: Vec<f32> = (0..N * N).map(|_| rng.gen::<f32>()).collect();

    move |x: f32, y: f32| {
        let u = ((x + 2.5) / 5.0 * (N - 1) as f32).clamp(0.0, (N - 1) as f32 - 1e-3);
        let v = ((y + 2.5) / 5.0 * (N - 1) as f32).clamp(0.0, (N - 1) as f32 - 1e-3);
        let (i, j) = (u as usize, v as usize);
        let (fu, fv) = (u - i as f32, v - j as f32);
        let bump = lattice[j * N + i] * (1.0 - fu) * (1.0 - fv)
            + lattice[j * N + i + 1] * fu * (1.0 - fv)
            + lattice[(j + 1) * N + i] * (1.0 - fu) * fv
            + lattice[(j + 1) * N + i + 1] * fu * fv;

        let wave = 0.2 * (6.0 * x).sin() * (5.0 * y).cos() + 0.12 * (3.0 * x + 4.0 * y).sin();
        let base = 0.45 + 0.3 * bump + wave;
        [
            base,
            0.85 * base + 0.08 + 0.04 * (3.0 * x).sin(),
            0.65 * base + 0.18 + 0.04 * (2.0 * y).cos(),
        ]
    }
}

fn render_plane(position: Vector3<f32>, tex: &dyn Fn(f32, f32) -> [f32; 3]) -> Photo {
    let size = IMAGE_SIZE;
    let focal = 1.2 * size as f32;

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
        size as f32 / 2.0,
        0.0,
        focal,
        size as f32 / 2.0,
        0.0,
        0.0,
        1.0,
    );
    let projection = k * ext;

    let h = Matrix3::from_columns(&[
        projection.column(0).into_owned(),
        projection.column(1).into_owned(),
        projection.column(3).into_owned(),
    ]);
    let hinv = h.try_inverse().expect("camera lies in the plane");

    let mut data = Vec::with_capacity(3 * size * size);
    for y in 0..size {
        for x in 0..size {
            let q = hinv * Vector3::new(x as f32, y as f32, 1.0);
            data.extend_from_slice(&tex(q.x / q.z, q.y / q.z));
        }
    }
    Photo::from_projection(projection, Pyramid::from_base(size, size, data, PYRAMID_LEVELS))
}

/// A grid of candidates over the plane, perturbed in depth and normal, each
/// referenced to its closest camera with a covisibility-collected image
/// set.
fn seed_candidates(photos: &PhotoSet, engine: &Engine) -> Vec<Patch> {
    let mut rng = StdRng::seed_from_u64(7);
    let mut candidates = Vec::new();
    let steps = (1.0 / SEED_SPACING) as i32;

    for gy in -steps..=steps {
        for gx in -steps..=steps {
            let x = gx as f32 * SEED_SPACING;
            let y = gy as f32 * SEED_SPACING;
            let coord = Vector4::new(x, y, rng.gen_range(-0.02..0.02), 1.0);

            let reference = (0..photos.len())
                .min_by(|&a, &b| {
                    let da = xyz(&(photos.photo(a).center - coord)).norm();
                    let db = xyz(&(photos.photo(b).center - coord)).norm();
                    da.total_cmp(&db)
                })
                .unwrap_or(0);

            let mut images = vec![reference];
            images.extend(engine.optimizer().collect_images(reference));

            let tilt_x = rng.gen_range(-0.1..0.1);
            let tilt_y = rng.gen_range(-0.1..0.1);
            let normal3 = Vector3::new(tilt_x, tilt_y, 1.0).normalize();
            let normal = Vector4::new(normal3.x, normal3.y, normal3.z, 0.0);

            candidates.push(Patch::seed(coord, normal, images));
        }
    }
    candidates
}
