//! Photometric patch optimization.
//!
//! The optimizer selects and constrains the image set of a patch, samples
//! normal-aligned texture windows across those images, and refines the
//! patch's depth and orientation against the mean normalized
//! cross-correlation dissimilarity (see [`refine`]).
//!
//! Dissimilarities run through the influence function `x / (1 + 3x)` so a
//! single bad view cannot dominate the score.

pub mod refine;

use std::sync::Arc;

use nalgebra::{Vector3, Vector4};

use crate::config::Config;
use crate::filter::Filter;
use crate::patch::{unitize3, xyz, Patch};
use crate::photo::PhotoSet;
use crate::store::{PatchStore, INVALID_UNIT};

/// Influence function damping large dissimilarities.
#[inline]
pub fn robust_incc(x: f32) -> f32 {
    x / (1.0 + 3.0 * x)
}

/// Inverse of [`robust_incc`].
#[inline]
pub fn unrobust_incc(x: f32) -> f32 {
    x / (1.0 - 3.0 * x)
}

/// Per-worker scratch buffers, allocated once and lent to one worker for the
/// duration of a task.
pub struct WorkerScratch {
    /// Patch position at refinement start.
    pub center: Vector4<f32>,
    /// Unit ray from the reference camera through `center`.
    pub ray: Vector4<f32>,
    /// Image set being refined; `indexes[0]` is the reference image.
    pub indexes: Vec<usize>,
    pub dscale: f32,
    pub ascale: f32,
    /// One texture window per image, `3 * wsize * wsize` floats when filled.
    pub texs: Vec<Vec<f32>>,
    /// NCC weights per image.
    pub weights: Vec<f32>,
}

impl WorkerScratch {
    pub fn new(cfg: &Config, num_images: usize) -> Self {
        let tex_len = 3 * cfg.wsize * cfg.wsize;
        let texs = (0..num_images)
            .map(|i| Vec::with_capacity(if i < cfg.tau { tex_len } else { 0 }))
            .collect();
        Self {
            center: Vector4::zeros(),
            ray: Vector4::zeros(),
            indexes: Vec::new(),
            dscale: 0.0,
            ascale: 0.0,
            texs,
            weights: Vec::with_capacity(num_images),
        }
    }
}

/// Subtract the per-channel mean and divide by the standard deviation across
/// all channels. A zero-variance window carries no photometric information
/// and is cleared so it drops out of every score.
pub fn normalize_tex(tex: &mut Vec<f32>) {
    if tex.is_empty() {
        return;
    }
    let pixels = tex.len() / 3;
    let mut mean = [0.0f32; 3];
    for px in tex.chunks_exact(3) {
        for ch in 0..3 {
            mean[ch] += px[ch];
        }
    }
    for m in &mut mean {
        *m /= pixels as f32;
    }

    let mut var = 0.0f32;
    for px in tex.chunks_exact(3) {
        for ch in 0..3 {
            let d = px[ch] - mean[ch];
            var += d * d;
        }
    }
    let sigma = (var / tex.len() as f32).sqrt();
    if sigma == 0.0 {
        tex.clear();
        return;
    }
    for (i, v) in tex.iter_mut().enumerate() {
        *v = (*v - mean[i % 3]) / sigma;
    }
}

/// Length-normalized inner product; equals the NCC for normalized textures.
pub fn tex_dot(tex0: &[f32], tex1: &[f32]) -> f32 {
    let size = tex0.len();
    let mut ans = 0.0f32;
    for i in 0..size {
        ans += tex0[i] * tex1[i];
    }
    ans / size as f32
}

/// Refines patch geometry against multi-view NCC.
pub struct Optimizer {
    photos: Arc<PhotoSet>,
    cfg: Config,
}

impl Optimizer {
    pub fn new(photos: Arc<PhotoSet>, cfg: Config) -> Self {
        for i in 0..photos.len() {
            assert!(
                photos.photo(i).num_levels() > cfg.level + 2,
                "photo {i} pyramid too shallow for level {}",
                cfg.level
            );
        }
        Self { photos, cfg }
    }

    pub fn photos(&self) -> &PhotoSet {
        &self.photos
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    /// Make one scratch slot per worker.
    pub fn make_scratch(&self) -> Vec<WorkerScratch> {
        (0..self.cfg.cpu)
            .map(|_| WorkerScratch::new(&self.cfg, self.photos.len()))
            .collect()
    }

    // ------------------------------------------------------------------
    // Image selection
    // ------------------------------------------------------------------

    /// Covisible images of `index`, closest first, at most `tau`.
    pub fn collect_images(&self, index: usize) -> Vec<usize> {
        let athreshold = self.cfg.angle_threshold0.cos();
        let axis0 = self.photos.photo(index).zaxis;

        let mut candidates: Vec<(f32, usize)> = Vec::new();
        for &cand in &self.photos.visdata[index] {
            if self.cfg.sequence_threshold != -1
                && (index as i64 - cand as i64).abs() > self.cfg.sequence_threshold as i64
            {
                continue;
            }
            if axis0.dot(&self.photos.photo(cand).zaxis) < athreshold {
                continue;
            }
            candidates.push((self.photos.distances[index][cand], cand));
        }
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0));
        candidates
            .into_iter()
            .take(self.cfg.tau)
            .map(|(_, i)| i)
            .collect()
    }

    /// Re-inflate the image set from the reference image's covisibility
    /// list, keeping images that see the patch from the front and inside
    /// their bounds.
    pub fn add_images(&self, patch: &mut Patch) {
        let level = self.cfg.level;
        let mut used = vec![false; self.photos.len()];
        for &i in &patch.images {
            used[i] = true;
        }

        let athreshold = self.cfg.angle_threshold0.cos();
        for &image in &self.photos.visdata[patch.images[0]] {
            if used[image] {
                continue;
            }
            let icoord = self.photos.project(image, &patch.coord, level);
            if icoord.x < 0.0
                || (self.photos.width(image, level) - 1) as f32 <= icoord.x
                || icoord.y < 0.0
                || (self.photos.height(image, level) - 1) as f32 <= icoord.y
            {
                continue;
            }
            if !self.photos.edge(&patch.coord, image, level) {
                continue;
            }
            let mut ray = self.photos.photo(image).center - patch.coord;
            unitize3(&mut ray);
            if ray.dot(&patch.normal) >= athreshold {
                patch.images.push(image);
                used[image] = true;
            }
        }
    }

    /// Keep the reference image plus every image whose dissimilarity against
    /// the reference texture beats `1 - ncc_threshold`.
    pub fn constrain_images(
        &self,
        patch: &mut Patch,
        ncc_threshold: f32,
        scratch: &mut WorkerScratch,
    ) {
        let inccs =
            self.inccs_against_ref(&patch.coord, &patch.normal, &patch.images, scratch, false);
        let mut newimages = vec![patch.images[0]];
        for i in 1..patch.images.len() {
            if inccs[i] < 1.0 - ncc_threshold {
                newimages.push(patch.images[i]);
            }
        }
        patch.images = newimages;
    }

    /// Swap the target image with the smallest summed pairwise dissimilarity
    /// into the reference slot. Clears the image set when no target remains.
    pub fn set_ref_image(&self, patch: &mut Patch, scratch: &mut WorkerScratch) {
        let targets: Vec<usize> = patch
            .images
            .iter()
            .copied()
            .filter(|&i| i < self.cfg.tnum)
            .collect();
        if targets.is_empty() {
            patch.images.clear();
            return;
        }

        let inccs = self.incc_matrix(&patch.coord, &patch.normal, &targets, scratch, true);
        let mut refindex = 0;
        let mut refncc = f32::MAX;
        for (i, row) in inccs.iter().enumerate() {
            let sum: f32 = row.iter().sum();
            if sum < refncc {
                refncc = sum;
                refindex = i;
            }
        }

        let refimage = targets[refindex];
        if let Some(pos) = patch.images.iter().position(|&i| i == refimage) {
            patch.images.swap(0, pos);
        }
    }

    /// Greedy fineness ordering with an angular-diversity penalty: after
    /// each pick, images angularly close to it get their cost inflated.
    /// The reference image is pinned first.
    pub fn sort_images(&self, patch: &mut Patch) {
        let threshold = 1.0 - (10.0f32).to_radians().cos();
        let (mut indexes, mut units, mut rays) = self.compute_units_filtered(patch);

        patch.images.clear();
        if indexes.len() < 2 {
            return;
        }
        units[0] = 0.0;

        while !indexes.is_empty() {
            let mut k = 0;
            for j in 1..units.len() {
                if units[j] < units[k] {
                    k = j;
                }
            }
            patch.images.push(indexes[k]);

            let ray_k = rays[k];
            let mut indexes2 = Vec::with_capacity(indexes.len() - 1);
            let mut units2 = Vec::with_capacity(indexes.len() - 1);
            let mut rays2 = Vec::with_capacity(indexes.len() - 1);
            for j in 0..rays.len() {
                if j == k {
                    continue;
                }
                let ftmp = (1.0 - ray_k.dot(&rays[j])).clamp(threshold / 2.0, threshold);
                indexes2.push(indexes[j]);
                units2.push(units[j] * (threshold / ftmp));
                rays2.push(rays[j]);
            }
            indexes = indexes2;
            units = units2;
            rays = rays2;
        }
    }

    /// Drop images that view the patch at more than `angle_threshold1` from
    /// the normal; a failing reference clears the whole set.
    pub fn filter_images_by_angle(&self, patch: &mut Patch) {
        let cos_t = self.cfg.angle_threshold1.cos();
        let mut newindexes = Vec::with_capacity(patch.images.len());
        for (k, &image) in patch.images.iter().enumerate() {
            let mut ray = self.photos.photo(image).center - patch.coord;
            unitize3(&mut ray);
            if ray.dot(&patch.normal) < cos_t {
                if k == 0 {
                    patch.images.clear();
                    return;
                }
            } else {
                newindexes.push(image);
            }
        }
        patch.images = newindexes;
    }

    // ------------------------------------------------------------------
    // Pre/post-processing
    // ------------------------------------------------------------------

    /// Prepare a candidate for refinement. Returns false to reject.
    pub fn preprocess(
        &self,
        patch: &mut Patch,
        store: &PatchStore,
        scratch: &mut WorkerScratch,
    ) -> bool {
        if patch.images.is_empty() {
            return false;
        }
        self.add_images(patch);
        self.constrain_images(patch, self.cfg.ncc_threshold_before, scratch);
        self.sort_images(patch);

        if !patch.images.is_empty() {
            store.set_scales(patch, &self.photos);
        }
        if patch.images.len() < self.cfg.min_image_num {
            return false;
        }
        if !self.photos.check_angles(
            &patch.coord,
            &patch.images,
            self.cfg.max_angle_threshold,
            self.cfg.angle_threshold1,
            self.cfg.min_image_num,
        ) {
            patch.images.clear();
            return false;
        }
        true
    }

    /// Validate a refined patch for acceptance. Returns false to reject.
    pub fn postprocess(
        &self,
        patch: &mut Patch,
        store: &PatchStore,
        filter: &Filter,
        scratch: &mut WorkerScratch,
    ) -> bool {
        if patch.images.len() < self.cfg.min_image_num {
            return false;
        }
        if !self.photos.mask(&patch.coord, self.cfg.level, self.cfg.tnum)
            || !self.photos.inside_bounding_images(&patch.coord)
        {
            return false;
        }

        self.add_images(patch);
        self.constrain_images(patch, self.cfg.ncc_threshold, scratch);
        self.filter_images_by_angle(patch);
        if patch.images.len() < self.cfg.min_image_num {
            return false;
        }

        store.set_grids(patch, &self.photos);
        self.set_ref_image(patch, scratch);
        if patch.images.is_empty() {
            return false;
        }
        self.constrain_images(patch, self.cfg.ncc_threshold, scratch);
        if patch.images.len() < self.cfg.min_image_num {
            return false;
        }
        store.set_grids(patch, &self.photos);

        patch.count_targets(self.cfg.tnum);
        patch.tmp = patch.score2(self.cfg.ncc_threshold);

        if self.cfg.depth >= 1 {
            store.set_vimages_vgrids(patch, &self.photos);
            if self.cfg.depth >= 2 && !self.check(patch, store, filter) {
                return false;
            }
        }
        true
    }

    /// Depth-mode acceptance gate: positive gain, and for well-supported
    /// patches a consistent quadric fit with the neighbors.
    pub fn check(&self, patch: &mut Patch, store: &PatchStore, filter: &Filter) -> bool {
        let gain = filter.compute_gain(patch, store);
        patch.tmp = gain;
        if gain < 0.0 {
            patch.images.clear();
            return false;
        }

        let neighbors = store.find_neighbors(patch, None, 4.0, 2, false, &self.photos);
        if neighbors.len() > 6 {
            let nb: Vec<&Patch> = neighbors.iter().filter_map(|&id| store.get(id)).collect();
            if !filter.quad_consistent(patch, &nb) {
                patch.images.clear();
                return false;
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Units, axes and weights
    // ------------------------------------------------------------------

    /// Fineness per image of the patch, aligned with `patch.images`.
    /// Images viewing the patch from behind get an effectively infinite
    /// unit.
    pub fn compute_units(&self, patch: &Patch) -> Vec<f32> {
        let mut units = Vec::with_capacity(patch.images.len());
        for &image in &patch.images {
            let mut ray = self.photos.photo(image).center - patch.coord;
            unitize3(&mut ray);
            let denom = ray.dot(&patch.normal);
            let unit = self.photos.pixel_unit(image, &patch.coord, self.cfg.level);
            units.push(if denom > 0.0 { unit / denom } else { INVALID_UNIT });
        }
        units
    }

    /// Fineness restricted to front-facing images, with their viewing rays.
    fn compute_units_filtered(&self, patch: &Patch) -> (Vec<usize>, Vec<f32>, Vec<Vector3<f32>>) {
        let mut indexes = Vec::new();
        let mut units = Vec::new();
        let mut rays = Vec::new();
        for &image in &patch.images {
            let mut ray = self.photos.photo(image).center - patch.coord;
            unitize3(&mut ray);
            let dot = ray.dot(&patch.normal);
            if dot <= 0.0 {
                continue;
            }
            indexes.push(image);
            units.push(self.photos.pixel_unit(image, &patch.coord, self.cfg.level) / dot);
            rays.push(xyz(&ray));
        }
        (indexes, units, rays)
    }

    /// NCC weights: images finer than the reference saturate at 1.
    pub fn set_weights(&self, patch: &Patch, scratch: &mut WorkerScratch) {
        let units = self.compute_units(patch);
        scratch.weights.clear();
        scratch
            .weights
            .extend(units.iter().map(|&u| (units[0] / u).min(1.0)));
        scratch.weights[0] = 1.0;
    }

    /// Patch-plane axes scaled so one axis step projects to one pixel in
    /// image `index` at the working level.
    pub fn patch_axes(
        &self,
        index: usize,
        coord: &Vector4<f32>,
        normal: &Vector4<f32>,
    ) -> (Vector4<f32>, Vector4<f32>) {
        let level = self.cfg.level;
        let pscale = self.photos.pixel_unit(index, coord, level);
        let photo = self.photos.photo(index);

        let normal3 = xyz(normal);
        let mut yaxis3 = normal3.cross(&photo.xaxis);
        if yaxis3.norm() < 1.0e-8 {
            yaxis3 = normal3.cross(&photo.yaxis);
        }
        let yaxis3 = yaxis3.normalize();
        let xaxis3 = yaxis3.cross(&normal3);

        let mut pxaxis = Vector4::new(xaxis3.x, xaxis3.y, xaxis3.z, 0.0) * pscale;
        let mut pyaxis = Vector4::new(yaxis3.x, yaxis3.y, yaxis3.z, 0.0) * pscale;

        let center = self.photos.project(index, coord, level);
        let xdis = (self.photos.project(index, &(coord + pxaxis), level) - center).norm();
        let ydis = (self.photos.project(index, &(coord + pyaxis), level) - center).norm();
        if xdis != 0.0 {
            pxaxis /= xdis;
        }
        if ydis != 0.0 {
            pyaxis /= ydis;
        }
        (pxaxis, pyaxis)
    }

    // ------------------------------------------------------------------
    // Texture sampling and NCC
    // ------------------------------------------------------------------

    /// The transformed window must stay 3 pixels inside the image.
    fn grab_safe(
        &self,
        image: usize,
        size: usize,
        center: &Vector3<f32>,
        dx: &Vector3<f32>,
        dy: &Vector3<f32>,
        level: usize,
    ) -> bool {
        let margin = (size / 2) as f32;

        let tl = center - dx * margin - dy * margin;
        let tr = center + dx * margin - dy * margin;
        let bl = center - dx * margin + dy * margin;
        let br = center + dx * margin + dy * margin;

        let minx = tl.x.min(tr.x).min(bl.x).min(br.x);
        let maxx = tl.x.max(tr.x).max(bl.x).max(br.x);
        let miny = tl.y.min(tr.y).min(bl.y).min(br.y);
        let maxy = tl.y.max(tr.y).max(bl.y).max(br.y);

        let margin2 = 3.0;
        minx >= margin2
            && maxx < (self.photos.width(image, level) - 1) as f32 - margin2
            && miny >= margin2
            && maxy < (self.photos.height(image, level) - 1) as f32 - margin2
    }

    /// Sample a `wsize x wsize` RGB window of image `image` around the
    /// patch, picking the pyramid level that best matches the projected
    /// footprint. Returns false (and leaves `tex` empty) when the view is
    /// too oblique or the window leaves the image.
    pub fn grab_tex(
        &self,
        coord: &Vector4<f32>,
        pxaxis: &Vector4<f32>,
        pyaxis: &Vector4<f32>,
        pzaxis: &Vector4<f32>,
        image: usize,
        tex: &mut Vec<f32>,
    ) -> bool {
        tex.clear();
        let size = self.cfg.wsize;
        let level = self.cfg.level;

        let mut ray = self.photos.photo(image).center - coord;
        unitize3(&mut ray);
        if ray.dot(pzaxis).max(0.0) < self.cfg.angle_threshold1.cos() {
            return false;
        }

        let margin = size / 2;
        let mut center = self.photos.project(image, coord, level);
        let mut dx = self.photos.project(image, &(coord + pxaxis), level) - center;
        let mut dy = self.photos.project(image, &(coord + pyaxis), level) - center;

        let ratio = (dx.norm() + dy.norm()) / 2.0;
        let leveldif = ((ratio.ln() / std::f32::consts::LN_2 + 0.5).floor() as i32)
            .clamp(-(level as i32), 2);

        let scale = (2.0f32).powi(leveldif);
        let newlevel = (level as i32 + leveldif) as usize;
        center /= scale;
        dx /= scale;
        dy /= scale;

        if !self.grab_safe(image, size, &center, &dx, &dy, newlevel) {
            return false;
        }

        let mut left = center - dx * margin as f32 - dy * margin as f32;
        tex.reserve(3 * size * size);
        for _y in 0..size {
            let mut sample = left;
            left += dy;
            for _x in 0..size {
                let color = self.photos.color(image, sample.x, sample.y, newlevel);
                tex.extend_from_slice(&color);
                sample += dx;
            }
        }
        true
    }

    /// Weighted mean robust dissimilarity of the image set against the
    /// reference texture; 2.0 when it cannot be evaluated.
    pub fn compute_incc(
        &self,
        coord: &Vector4<f32>,
        normal: &Vector4<f32>,
        indexes: &[usize],
        scratch: &mut WorkerScratch,
        robust: bool,
    ) -> f32 {
        if indexes.len() < 2 {
            return 2.0;
        }
        let (pxaxis, pyaxis) = self.patch_axes(indexes[0], coord, normal);

        let size = self.cfg.tau.min(indexes.len());
        for i in 0..size {
            let mut tex = std::mem::take(&mut scratch.texs[i]);
            if self.grab_tex(coord, &pxaxis, &pyaxis, normal, indexes[i], &mut tex) {
                normalize_tex(&mut tex);
            }
            scratch.texs[i] = tex;
        }
        if scratch.texs[0].is_empty() {
            return 2.0;
        }

        let mut score = 0.0f32;
        let mut totalweight = 0.0f32;
        for i in 1..size {
            if scratch.texs[i].is_empty() {
                continue;
            }
            let incc = 1.0 - tex_dot(&scratch.texs[0], &scratch.texs[i]);
            let w = scratch.weights[i];
            totalweight += w;
            score += if robust { robust_incc(incc) } else { incc } * w;
        }

        if totalweight == 0.0 {
            2.0
        } else {
            score / totalweight
        }
    }

    /// Dissimilarity of every image against the reference texture.
    pub fn inccs_against_ref(
        &self,
        coord: &Vector4<f32>,
        normal: &Vector4<f32>,
        indexes: &[usize],
        scratch: &mut WorkerScratch,
        robust: bool,
    ) -> Vec<f32> {
        let (pxaxis, pyaxis) = self.patch_axes(indexes[0], coord, normal);
        for (i, &image) in indexes.iter().enumerate() {
            let mut tex = std::mem::take(&mut scratch.texs[i]);
            if self.grab_tex(coord, &pxaxis, &pyaxis, normal, image, &mut tex) {
                normalize_tex(&mut tex);
            }
            scratch.texs[i] = tex;
        }

        if scratch.texs[0].is_empty() {
            return vec![2.0; indexes.len()];
        }

        let mut inccs = Vec::with_capacity(indexes.len());
        for i in 0..indexes.len() {
            if i == 0 {
                inccs.push(0.0);
            } else if !scratch.texs[i].is_empty() {
                let incc = 1.0 - tex_dot(&scratch.texs[0], &scratch.texs[i]);
                inccs.push(if robust { robust_incc(incc) } else { incc });
            } else {
                inccs.push(2.0);
            }
        }
        inccs
    }

    /// Symmetric pairwise dissimilarity matrix of the image set.
    pub fn incc_matrix(
        &self,
        coord: &Vector4<f32>,
        normal: &Vector4<f32>,
        indexes: &[usize],
        scratch: &mut WorkerScratch,
        robust: bool,
    ) -> Vec<Vec<f32>> {
        let (pxaxis, pyaxis) = self.patch_axes(indexes[0], coord, normal);
        for (i, &image) in indexes.iter().enumerate() {
            let mut tex = std::mem::take(&mut scratch.texs[i]);
            if self.grab_tex(coord, &pxaxis, &pyaxis, normal, image, &mut tex) {
                normalize_tex(&mut tex);
            }
            scratch.texs[i] = tex;
        }

        let n = indexes.len();
        let mut inccs = vec![vec![0.0f32; n]; n];
        for i in 0..n {
            for j in i + 1..n {
                let v = if !scratch.texs[i].is_empty() && !scratch.texs[j].is_empty() {
                    let incc = 1.0 - tex_dot(&scratch.texs[i], &scratch.texs[j]);
                    if robust {
                        robust_incc(incc)
                    } else {
                        incc
                    }
                } else {
                    2.0
                };
                inccs[i][j] = v;
                inccs[j][i] = v;
            }
        }
        inccs
    }
}
