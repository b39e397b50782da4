//! Patch-cloud filtering.
//!
//! Four passes remove patches that survived refinement but are inconsistent
//! with the rest of the cloud: negative-gain patches (outside filter),
//! depth-map occluded patches (exact filter), patches unsupported by a local
//! quadric fit of their neighbors (neighbor filter), and small isolated
//! components (group filter). Every pass decides from a snapshot of the
//! store and applies removals at the end, so the result does not depend on
//! worker scheduling.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use nalgebra::{DMatrix, DVector, Vector3, Vector4};
use tracing::{debug, info};

use crate::config::Config;
use crate::patch::{xyz, Patch, PatchId};
use crate::photo::PhotoSet;
use crate::store::PatchStore;
use crate::system::parallel_map;

pub struct Filter {
    photos: Arc<PhotoSet>,
    cfg: Config,
}

impl Filter {
    pub fn new(photos: Arc<PhotoSet>, cfg: Config) -> Self {
        Self { photos, cfg }
    }

    /// Run the full filtering pipeline, refreshing depth maps and
    /// visibility images between passes.
    pub fn run(&self, store: &mut PatchStore) {
        let start = Instant::now();
        let before = store.len();

        store.refresh_visibility(&self.photos);
        let outside = self.filter_outside(store);

        store.refresh_visibility(&self.photos);
        let exact = self.filter_exact(store);

        store.refresh_visibility(&self.photos);
        let neighbor = self.filter_neighbor(store, 1);

        store.refresh_visibility(&self.photos);
        let groups = self.filter_small_groups(store);

        store.refresh_visibility(&self.photos);
        info!(
            before,
            after = store.len(),
            outside,
            exact,
            neighbor,
            groups,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "filter pipeline done"
        );
    }

    /// How much unique photometric evidence the patch contributes: its own
    /// target support minus, per image cell, the strongest co-located
    /// competitor that is not a neighbor. Visibility-only images press only
    /// with competitors behind the patch.
    pub fn compute_gain(&self, patch: &Patch, store: &PatchStore) -> f32 {
        let threshold = self.cfg.ncc_threshold;
        let mut gain = patch.score2(threshold);

        for (k, &image) in patch.images.iter().enumerate() {
            if image >= self.cfg.tnum {
                continue;
            }
            let mut maxpressure = 0.0f32;
            for &qid in store.pgrid(image, patch.grids[k]) {
                let Some(q) = store.get(qid) else { continue };
                if !store.is_neighbor(patch, q, 2.0, &self.photos) {
                    maxpressure = maxpressure.max(q.ncc - threshold);
                }
            }
            gain -= maxpressure;
        }

        for (k, &image) in patch.vimages.iter().enumerate() {
            if image >= self.cfg.tnum {
                continue;
            }
            let pdepth = self.photos.depth(image, &patch.coord);
            let mut maxpressure = 0.0f32;
            for &qid in store.pgrid(image, patch.vgrids[k]) {
                let Some(q) = store.get(qid) else { continue };
                let bdepth = self.photos.depth(image, &q.coord);
                if pdepth < bdepth && !store.is_neighbor(patch, q, 2.0, &self.photos) {
                    maxpressure = maxpressure.max(q.ncc - threshold);
                }
            }
            gain -= maxpressure;
        }
        gain
    }

    /// Remove patches whose gain is negative.
    fn filter_outside(&self, store: &mut PatchStore) -> usize {
        let ids = store.collect_ids();
        let gains: Vec<f32> = {
            let store = &*store;
            parallel_map(self.cfg.cpu, &ids, |_, &id| {
                let patch = store.get(id).expect("snapshot id vanished mid-pass");
                self.compute_gain(patch, store)
            })
        };

        let mut removed = 0;
        for (i, &id) in ids.iter().enumerate() {
            if gains[i] < 0.0 {
                store.remove_patch(id);
                removed += 1;
            }
        }
        debug!(removed, remaining = store.len(), "outside filter");
        removed
    }

    /// Remove or prune patches occluded by the depth maps. A patch loses an
    /// image when the depth-map winner of its cell is a different,
    /// photometrically valid patch in front of it by more than the winner's
    /// depth step; losing the reference image or dropping below the image
    /// minimum removes the patch.
    fn filter_exact(&self, store: &mut PatchStore) -> usize {
        store.update_depth_maps(&self.photos);

        let ids = store.collect_ids();
        let images: Vec<usize> = (0..self.cfg.tnum).collect();
        let occluded_per_image: Vec<Vec<PatchId>> = {
            let store = &*store;
            let ids = &ids;
            parallel_map(self.cfg.cpu, &images, |_, &image| {
                let mut occluded = Vec::new();
                for &id in ids {
                    let patch = store.get(id).expect("snapshot id vanished mid-pass");
                    let Some(pos) = patch.images.iter().position(|&i| i == image) else {
                        continue;
                    };
                    let Some((wid, wdepth)) = store.depth_entry(image, patch.grids[pos]) else {
                        continue;
                    };
                    if wid == id {
                        continue;
                    }
                    let Some(winner) = store.get(wid) else { continue };
                    let depth = self.photos.depth(image, &patch.coord);
                    if depth > wdepth + winner.dscale
                        && winner.score2(self.cfg.ncc_threshold) > 0.0
                    {
                        occluded.push(id);
                    }
                }
                occluded
            })
        };

        let mut occlusions: HashMap<PatchId, HashSet<usize>> = HashMap::new();
        for (&image, list) in images.iter().zip(&occluded_per_image) {
            for &id in list {
                occlusions.entry(id).or_default().insert(image);
            }
        }

        let mut removed = 0;
        for (id, bad) in occlusions {
            let Some(patch) = store.get(id) else { continue };
            let remaining = patch.images.len() - bad.len();
            if bad.contains(&patch.images[0]) || remaining < self.cfg.min_image_num {
                store.remove_patch(id);
                removed += 1;
            } else {
                let mut pruned = patch.clone();
                pruned.images.retain(|i| !bad.contains(i));
                store.replace_patch(id, pruned, &self.photos);
            }
        }
        debug!(removed, remaining = store.len(), "exact filter");
        removed
    }

    /// Remove patches with too few neighbors or a failed quadric fit,
    /// repeating up to `times` passes or until a pass removes nothing.
    fn filter_neighbor(&self, store: &mut PatchStore, times: usize) -> usize {
        let mut total = 0;
        for _ in 0..times {
            let ids = store.collect_ids();
            let rejects: Vec<bool> = {
                let store = &*store;
                parallel_map(self.cfg.cpu, &ids, |_, &id| {
                    let patch = store.get(id).expect("snapshot id vanished mid-pass");
                    let neighbors =
                        store.find_neighbors(patch, Some(id), 4.0, 2, true, &self.photos);
                    if neighbors.len() < 6 {
                        return true;
                    }
                    let resolved: Vec<&Patch> =
                        neighbors.iter().filter_map(|&n| store.get(n)).collect();
                    !self.quad_consistent(patch, &resolved)
                })
            };

            let mut removed = 0;
            for (i, &id) in ids.iter().enumerate() {
                if rejects[i] {
                    store.remove_patch(id);
                    removed += 1;
                }
            }
            total += removed;
            if removed == 0 {
                break;
            }
        }
        debug!(removed = total, remaining = store.len(), "neighbor filter");
        total
    }

    /// Fit `fz = c0*fx^2 + c1*fy^2 + c2*fx*fy` to the neighbors in the
    /// patch's tangent frame; the patch is consistent when the mean
    /// residual, in pixel units, stays below the quadric threshold.
    pub fn quad_consistent(&self, patch: &Patch, neighbors: &[&Patch]) -> bool {
        if neighbors.is_empty() {
            return true;
        }
        let level = self.cfg.level;
        let (xdir, ydir) = tangent_axes(&patch.normal);
        let h = 2.0
            * self.cfg.csize as f32
            * self
                .photos
                .pixel_unit(patch.images[0], &patch.coord, level);

        let n = neighbors.len();
        let mut a = DMatrix::<f32>::zeros(n, 3);
        let mut b = DVector::<f32>::zeros(n);
        let mut samples = Vec::with_capacity(n);
        for (k, nb) in neighbors.iter().enumerate() {
            let diff = nb.coord - patch.coord;
            let fx = xyz(&diff).dot(&xdir) / h;
            let fy = xyz(&diff).dot(&ydir) / h;
            let fz = diff.dot(&patch.normal);
            a[(k, 0)] = fx * fx;
            a[(k, 1)] = fy * fy;
            a[(k, 2)] = fx * fy;
            b[k] = fz;
            samples.push((fx, fy, fz));
        }

        let coeffs = a
            .svd(true, true)
            .solve(&b, 1.0e-6)
            .unwrap_or_else(|_| DVector::zeros(3));

        let inum = self.cfg.tau.min(patch.images.len());
        let mut unit = 0.0f32;
        for &image in &patch.images[..inum] {
            unit += self.photos.pixel_unit(image, &patch.coord, level);
        }
        unit /= inum as f32;

        let mut residual = 0.0f32;
        for (fx, fy, fz) in samples {
            let fit = coeffs[0] * fx * fx + coeffs[1] * fy * fy + coeffs[2] * fx * fy;
            residual += (fz - fit).abs() / unit;
        }
        residual /= n as f32;

        residual < self.cfg.quad_threshold
    }

    /// Flood-fill connected components over shared grid cells and drop the
    /// ones below the minimum size.
    fn filter_small_groups(&self, store: &mut PatchStore) -> usize {
        let ids = store.collect_ids();
        let index: HashMap<PatchId, usize> =
            ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
        let mut label = vec![usize::MAX; ids.len()];
        let mut sizes = Vec::new();

        for seed in 0..ids.len() {
            if label[seed] != usize::MAX {
                continue;
            }
            let component = sizes.len();
            let mut count = 0usize;
            let mut queue = vec![seed];
            label[seed] = component;
            while let Some(cur) = queue.pop() {
                count += 1;
                let patch = store.get(ids[cur]).expect("snapshot id vanished mid-pass");
                let cells = patch
                    .images
                    .iter()
                    .zip(&patch.grids)
                    .chain(patch.vimages.iter().zip(&patch.vgrids));
                for (&image, &cell) in cells {
                    for &qid in store.pgrid(image, cell) {
                        let Some(&qidx) = index.get(&qid) else { continue };
                        if label[qidx] != usize::MAX {
                            continue;
                        }
                        let Some(q) = store.get(qid) else { continue };
                        if store.is_neighbor(patch, q, 2.0, &self.photos) {
                            label[qidx] = component;
                            queue.push(qidx);
                        }
                    }
                }
            }
            sizes.push(count);
        }

        let mut removed = 0;
        for (i, &id) in ids.iter().enumerate() {
            if sizes[label[i]] < self.cfg.min_patches_grid {
                store.remove_patch(id);
                removed += 1;
            }
        }
        debug!(
            removed,
            components = sizes.len(),
            remaining = store.len(),
            "small-group filter"
        );
        removed
    }
}

/// Orthonormal tangent axes of a normal.
fn tangent_axes(normal: &Vector4<f32>) -> (Vector3<f32>, Vector3<f32>) {
    let n3 = xyz(normal);
    let seed = if n3.x.abs() > 0.9 {
        Vector3::y()
    } else {
        Vector3::x()
    };
    let ydir = n3.cross(&seed).normalize();
    let xdir = ydir.cross(&n3);
    (xdir, ydir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use nalgebra::Vector4;

    fn setup(min_patches_grid: usize) -> (Filter, PatchStore, Arc<PhotoSet>) {
        let photos = testutil::plane_scene(5, 96, 96, 4, 13);
        let mut cfg = testutil::test_config(photos.len());
        cfg.min_patches_grid = min_patches_grid;
        let filter = Filter::new(photos.clone(), cfg.clone());
        let store = PatchStore::new(cfg, &photos);
        (filter, store, photos)
    }

    /// Neighbors of the origin patch on a plane tilted by `tilt` radians
    /// around the x axis, arranged on a 3x3 grid without the center.
    fn ring_neighbors(photos: &PhotoSet, tilt: f32, spacing: f32) -> (Patch, Vec<Patch>) {
        let normal3 = Vector3::new(0.0, -tilt.sin(), tilt.cos());
        let xdir = Vector3::new(1.0, 0.0, 0.0);
        let ydir = normal3.cross(&xdir);

        let mut center = testutil::plane_patch(photos, 0.0, 0.0);
        center.normal = Vector4::new(normal3.x, normal3.y, normal3.z, 0.0);

        let mut neighbors = Vec::new();
        for dy in -1i32..=1 {
            for dx in -1i32..=1 {
                if dx == 0 && dy == 0 {
                    continue;
                }
                let offset = xdir * (dx as f32 * spacing) + ydir * (dy as f32 * spacing);
                let mut nb = center.clone();
                nb.coord = center.coord + Vector4::new(offset.x, offset.y, offset.z, 0.0);
                neighbors.push(nb);
            }
        }
        (center, neighbors)
    }

    #[test]
    fn quad_accepts_coplanar_and_rejects_displaced() {
        let (filter, _store, photos) = setup(20);
        let (mut center, neighbors) = ring_neighbors(&photos, 0.35, 0.05);
        // Depth step of a narrow-baseline view of this patch.
        center.dscale = 6.0 * photos.pixel_unit(0, &center.coord, 1);

        let refs: Vec<&Patch> = neighbors.iter().collect();
        assert!(filter.quad_consistent(&center, &refs));

        let mut displaced = center.clone();
        displaced.coord += center.normal * (3.0 * center.dscale);
        assert!(!filter.quad_consistent(&displaced, &refs));
    }

    #[test]
    fn gain_rewards_unique_evidence_and_punishes_competition() {
        let (filter, mut store, photos) = setup(20);

        let mut lonely = testutil::plane_patch(&photos, 0.0, 0.0);
        lonely.ncc = 0.9;
        let lonely_id = store.add_patch(lonely, &photos);
        let lonely_ref = store.get(lonely_id).unwrap();
        assert!(filter.compute_gain(lonely_ref, &store) > 0.0);

        // A barely-passing patch squeezed by a strong non-neighbor
        // competitor on its reference line of sight loses.
        let mut weak = testutil::plane_patch(&photos, 0.5, 0.0);
        weak.ncc = 0.72;
        let mut strong = weak.clone();
        strong.ncc = 0.95;
        let ray = xyz(&(photos.photo(0).center - weak.coord)).normalize();
        strong.coord += Vector4::new(ray.x, ray.y, ray.z, 0.0);
        let weak_id = store.add_patch(weak, &photos);
        store.add_patch(strong, &photos);

        let weak_ref = store.get(weak_id).unwrap();
        assert!(filter.compute_gain(weak_ref, &store) < 0.0);
    }

    #[test]
    fn outside_filter_removes_negative_gain_patches() {
        let (filter, mut store, photos) = setup(20);

        let mut good = testutil::plane_patch(&photos, 0.0, 0.0);
        good.ncc = 0.9;
        let good_id = store.add_patch(good, &photos);

        let mut weak = testutil::plane_patch(&photos, 0.5, 0.0);
        weak.ncc = 0.72;
        let mut strong = weak.clone();
        strong.ncc = 0.95;
        let ray = xyz(&(photos.photo(0).center - weak.coord)).normalize();
        strong.coord += Vector4::new(ray.x, ray.y, ray.z, 0.0);
        let weak_id = store.add_patch(weak, &photos);
        let strong_id = store.add_patch(strong, &photos);

        filter.filter_outside(&mut store);
        assert!(store.get(good_id).is_some());
        assert!(store.get(strong_id).is_some());
        assert!(store.get(weak_id).is_none());
    }

    #[test]
    fn exact_filter_removes_occluded_patches() {
        let (filter, mut store, photos) = setup(20);

        let mut front = testutil::plane_patch(&photos, 0.0, 0.0);
        front.ncc = 0.9;
        front.dscale = 0.05;
        let front_id = store.add_patch(front, &photos);

        // Behind the front patch along the optical axis of its reference
        // image; its own reference cell is occluded.
        let mut behind = testutil::plane_patch(&photos, 0.0, 0.0);
        behind.ncc = 0.85;
        behind.dscale = 0.05;
        let toward_cam = xyz(&(photos.photo(0).center - behind.coord)).normalize();
        behind.coord -= Vector4::new(toward_cam.x, toward_cam.y, toward_cam.z, 0.0) * 0.5;
        let behind_id = store.add_patch(behind, &photos);

        filter.filter_exact(&mut store);
        assert!(store.get(front_id).is_some());
        assert!(store.get(behind_id).is_none());
    }

    #[test]
    fn neighbor_filter_keeps_supported_plane() {
        let (filter, mut store, photos) = setup(20);

        // A 3x3 block of coplanar patches supports itself.
        let mut ids = Vec::new();
        for dy in -1i32..=1 {
            for dx in -1i32..=1 {
                let p = testutil::plane_patch(&photos, dx as f32 * 0.05, dy as f32 * 0.05);
                ids.push(store.add_patch(p, &photos));
            }
        }
        // One patch floating far off the plane has no support.
        let mut floater = testutil::plane_patch(&photos, 0.0, 0.6);
        floater.coord.z += 1.0;
        let floater_id = store.add_patch(floater, &photos);

        filter.filter_neighbor(&mut store, 1);
        for id in ids {
            assert!(store.get(id).is_some());
        }
        assert!(store.get(floater_id).is_none());
    }

    #[test]
    fn small_groups_below_minimum_are_removed() {
        let (filter, mut store, photos) = setup(3);

        // An isolated pair: below the minimum component size of 3.
        let pair_a = store.add_patch(testutil::plane_patch(&photos, -0.8, -0.8), &photos);
        let pair_b = store.add_patch(testutil::plane_patch(&photos, -0.8, -0.8), &photos);

        // A cluster of four survives.
        let mut cluster = Vec::new();
        for _ in 0..4 {
            let p = testutil::plane_patch(&photos, 0.5, 0.5);
            cluster.push(store.add_patch(p, &photos));
        }

        filter.filter_small_groups(&mut store);
        assert!(store.get(pair_a).is_none());
        assert!(store.get(pair_b).is_none());
        for id in cluster {
            assert!(store.get(id).is_some());
        }
    }

    #[test]
    fn filtering_is_monotonic() {
        let (filter, mut store, photos) = setup(2);
        for dy in -2i32..=2 {
            for dx in -2i32..=2 {
                let mut p = testutil::plane_patch(&photos, dx as f32 * 0.05, dy as f32 * 0.05);
                p.dscale = 0.05;
                store.add_patch(p, &photos);
            }
        }
        let before: std::collections::HashSet<PatchId> =
            store.collect_ids().into_iter().collect();
        filter.run(&mut store);
        let after: std::collections::HashSet<PatchId> =
            store.collect_ids().into_iter().collect();
        assert!(after.is_subset(&before));
    }
}
