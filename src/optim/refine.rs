//! Levenberg–Marquardt refinement of patch geometry.
//!
//! A patch is encoded into three scalars: a depth displacement along the
//! reference viewing ray (in units of `dscale`) and two normal angles in the
//! reference camera frame (in units of `ascale`). The residual is the mean
//! robust NCC dissimilarity of the reprojected texture windows, replicated
//! into a 3-vector so the solver sees a square system; the Jacobian is a
//! forward numerical difference, as in the original single-precision
//! formulation.

use std::cell::RefCell;
use std::f64::consts::FRAC_PI_2;

use levenberg_marquardt::{LeastSquaresProblem, LevenbergMarquardt};
use nalgebra::{storage::Owned, Matrix3, Vector3, Vector4, U3};

use crate::patch::{unitize3, Patch, PatchStatus};

use super::{normalize_tex, robust_incc, tex_dot, unrobust_incc, Optimizer, WorkerScratch};

/// Residual value for configurations that cannot be evaluated.
const INCC_CAP: f64 = 2.0;

/// Encode `(coord, normal)` into solver parameters against the scratch
/// frame.
pub(crate) fn encode(
    optim: &Optimizer,
    scratch: &WorkerScratch,
    coord: &Vector4<f32>,
    normal: &Vector4<f32>,
) -> Vector3<f64> {
    let p0 = ((coord - scratch.center).dot(&scratch.ray) / scratch.dscale) as f64;

    let photo = optim.photos().photo(scratch.indexes[0]);
    let n3 = crate::patch::xyz(normal);
    let fx = photo.xaxis.dot(&n3) as f64;
    let fy = photo.yaxis.dot(&n3) as f64;
    let fz = photo.zaxis.dot(&n3) as f64;

    let angle2 = fy.clamp(-1.0, 1.0).asin();
    let cosb = angle2.cos();
    let angle1 = if cosb == 0.0 {
        0.0
    } else {
        let sina = fx / cosb;
        let cosa = -fz / cosb;
        let a = cosa.clamp(-1.0, 1.0).acos();
        if sina < 0.0 {
            -a
        } else {
            a
        }
    };

    let ascale = scratch.ascale as f64;
    Vector3::new(p0, angle1 / ascale, angle2 / ascale)
}

/// Decode solver parameters back into `(coord, normal)`.
pub(crate) fn decode(
    optim: &Optimizer,
    scratch: &WorkerScratch,
    params: &Vector3<f64>,
) -> (Vector4<f32>, Vector4<f32>) {
    let coord = scratch.center + scratch.ray * (scratch.dscale * params[0] as f32);

    let ascale = scratch.ascale as f64;
    let angle1 = params[1] * ascale;
    let angle2 = params[2] * ascale;
    let fx = (angle1.sin() * angle2.cos()) as f32;
    let fy = angle2.sin() as f32;
    let fz = (-angle1.cos() * angle2.cos()) as f32;

    let photo = optim.photos().photo(scratch.indexes[0]);
    let n3 = photo.xaxis * fx + photo.yaxis * fy + photo.zaxis * fz;
    (coord, Vector4::new(n3.x, n3.y, n3.z, 0.0))
}

/// The photometric objective at `params`.
pub(crate) fn evaluate_residual(
    optim: &Optimizer,
    scratch: &mut WorkerScratch,
    params: &Vector3<f64>,
) -> f64 {
    let cfg = optim.config();
    let ascale = scratch.ascale as f64;
    let angle1 = params[1] * ascale;
    let angle2 = params[2] * ascale;
    if angle1 <= -FRAC_PI_2 || FRAC_PI_2 <= angle1 || angle2 <= -FRAC_PI_2 || FRAC_PI_2 <= angle2 {
        return INCC_CAP;
    }

    let (coord, normal) = decode(optim, scratch, params);
    let (pxaxis, pyaxis) = optim.patch_axes(scratch.indexes[0], &coord, &normal);

    let size = cfg.tau.min(scratch.indexes.len());
    let minimum = cfg.min_image_num.min(size);
    for i in 0..size {
        let image = scratch.indexes[i];
        let mut tex = std::mem::take(&mut scratch.texs[i]);
        if optim.grab_tex(&coord, &pxaxis, &pyaxis, &normal, image, &mut tex) {
            normalize_tex(&mut tex);
        }
        scratch.texs[i] = tex;
    }

    if scratch.texs[0].is_empty() {
        return INCC_CAP;
    }

    let mut ans = 0.0f64;
    let mut denom = 0usize;
    for i in 1..size {
        if scratch.texs[i].is_empty() {
            continue;
        }
        ans += robust_incc(1.0 - tex_dot(&scratch.texs[0], &scratch.texs[i])) as f64;
        denom += 1;
    }

    if denom == 0 || denom + 1 < minimum {
        INCC_CAP
    } else {
        ans / denom as f64
    }
}

/// The 3-parameter least-squares problem handed to the solver. The worker's
/// scratch slot travels inside so the residual can reuse its texture
/// buffers.
struct RefineProblem<'a> {
    optim: &'a Optimizer,
    scratch: RefCell<&'a mut WorkerScratch>,
    params: Vector3<f64>,
}

impl RefineProblem<'_> {
    fn evaluate(&self, params: &Vector3<f64>) -> f64 {
        evaluate_residual(self.optim, &mut self.scratch.borrow_mut(), params)
    }
}

impl LeastSquaresProblem<f64, U3, U3> for RefineProblem<'_> {
    type ResidualStorage = Owned<f64, U3>;
    type JacobianStorage = Owned<f64, U3, U3>;
    type ParameterStorage = Owned<f64, U3>;

    fn set_params(&mut self, params: &Vector3<f64>) {
        self.params = *params;
    }

    fn params(&self) -> Vector3<f64> {
        self.params
    }

    fn residuals(&self) -> Option<Vector3<f64>> {
        Some(Vector3::repeat(self.evaluate(&self.params)))
    }

    fn jacobian(&self) -> Option<Matrix3<f64>> {
        let step = (f32::EPSILON as f64).sqrt();
        let base = self.evaluate(&self.params);

        let mut jacobian = Matrix3::zeros();
        for j in 0..3 {
            let mut h = step * self.params[j].abs();
            if h == 0.0 {
                h = step;
            }
            let mut forward = self.params;
            forward[j] += h;
            let df = (self.evaluate(&forward) - base) / h;
            for i in 0..3 {
                jacobian[(i, j)] = df;
            }
        }
        Some(jacobian)
    }
}

impl Optimizer {
    /// Refine the patch geometry in place. Returns false when the solver
    /// fails to converge; on success `ncc` holds the weighted photometric
    /// score of the refined geometry.
    pub fn refine(&self, patch: &mut Patch, scratch: &mut WorkerScratch) -> bool {
        scratch.center = patch.coord;
        let mut ray = patch.coord - self.photos().photo(patch.images[0]).center;
        unitize3(&mut ray);
        scratch.ray = ray;
        scratch.indexes.clear();
        scratch.indexes.extend_from_slice(&patch.images);
        scratch.dscale = patch.dscale;
        scratch.ascale = std::f32::consts::PI / 48.0;

        self.set_weights(patch, scratch);

        let params = encode(self, scratch, &patch.coord, &patch.normal);
        let problem = RefineProblem {
            optim: self,
            scratch: RefCell::new(scratch),
            params,
        };
        let (problem, report) = LevenbergMarquardt::new()
            .with_ftol(1.0e-7)
            .with_xtol(1.0e-7)
            .with_patience(100)
            .minimize(problem);
        if !report.termination.was_successful() {
            return false;
        }

        let scratch = problem.scratch.into_inner();
        let (coord, normal) = decode(self, scratch, &problem.params);
        patch.coord = coord;
        patch.normal = normal;

        let score = self.compute_incc(&patch.coord, &patch.normal, &patch.images, scratch, true);
        patch.ncc = 1.0 - unrobust_incc(score);
        patch.status = PatchStatus::Refined;
        true
    }
}
