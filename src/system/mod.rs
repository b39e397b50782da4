//! Worker pool and engine façade.
//!
//! Work is split by a shared atomic counter: each worker claims the next
//! item index and processes it with its own scratch slot, so the hot path
//! needs no locking. Results travel over a channel and are reassembled in
//! item order. The store stays read-only while a pass runs; accepted
//! patches are inserted in a single-threaded finalization step.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{RwLock, RwLockReadGuard};
use tracing::info;

use crate::config::Config;
use crate::filter::Filter;
use crate::optim::{Optimizer, WorkerScratch};
use crate::patch::Patch;
use crate::photo::PhotoSet;
use crate::store::PatchStore;

/// Map `f` over `items` on up to `cpu` worker threads, preserving item
/// order in the result.
pub fn parallel_map<T, R, F>(cpu: usize, items: &[T], f: F) -> Vec<R>
where
    T: Sync,
    R: Send,
    F: Fn(usize, &T) -> R + Sync,
{
    if items.is_empty() {
        return Vec::new();
    }

    let next = AtomicUsize::new(0);
    let (tx, rx) = crossbeam_channel::unbounded();
    std::thread::scope(|s| {
        for _ in 0..cpu.clamp(1, items.len()) {
            let tx = tx.clone();
            let next = &next;
            let f = &f;
            s.spawn(move || loop {
                let i = next.fetch_add(1, Ordering::SeqCst);
                if i >= items.len() {
                    break;
                }
                let _ = tx.send((i, f(i, &items[i])));
            });
        }
    });
    drop(tx);

    let mut slots: Vec<Option<R>> = (0..items.len()).map(|_| None).collect();
    for (i, r) in rx.try_iter() {
        slots[i] = Some(r);
    }
    slots
        .into_iter()
        .map(|s| s.expect("worker dropped a result"))
        .collect()
}

/// Outcome of one optimization pass.
#[derive(Clone, Copy, Debug)]
pub struct OptimizeStats {
    pub candidates: usize,
    pub accepted: usize,
}

/// Owns the collaborators and sequences optimize and filter phases over the
/// shared patch store.
pub struct Engine {
    cfg: Config,
    photos: Arc<PhotoSet>,
    optimizer: Optimizer,
    filter: Filter,
    store: RwLock<PatchStore>,
    scratch: Vec<WorkerScratch>,
}

impl Engine {
    pub fn new(photos: Arc<PhotoSet>, cfg: Config) -> Self {
        let cfg = cfg.resolve(photos.len());
        let optimizer = Optimizer::new(photos.clone(), cfg.clone());
        let filter = Filter::new(photos.clone(), cfg.clone());
        let store = RwLock::new(PatchStore::new(cfg.clone(), &photos));
        let scratch = optimizer.make_scratch();
        Self {
            cfg,
            photos,
            optimizer,
            filter,
            store,
            scratch,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn optimizer(&self) -> &Optimizer {
        &self.optimizer
    }

    pub fn store(&self) -> RwLockReadGuard<'_, PatchStore> {
        self.store.read()
    }

    /// Refine candidate patches on the worker pool and accept the survivors
    /// into the store.
    pub fn optimize(&mut self, candidates: Vec<Patch>) -> OptimizeStats {
        let start = Instant::now();
        let next = AtomicUsize::new(0);
        let (tx, rx) = crossbeam_channel::unbounded();

        let store = self.store.read();
        let optimizer = &self.optimizer;
        let filter = &self.filter;
        let candidates_ref = &candidates;
        std::thread::scope(|s| {
            for scratch in self.scratch.iter_mut() {
                let tx = tx.clone();
                let next = &next;
                let store = &*store;
                s.spawn(move || loop {
                    let i = next.fetch_add(1, Ordering::SeqCst);
                    if i >= candidates_ref.len() {
                        break;
                    }
                    let mut patch = candidates_ref[i].clone();
                    if !optimizer.preprocess(&mut patch, store, scratch) {
                        continue;
                    }
                    if !optimizer.refine(&mut patch, scratch) {
                        continue;
                    }
                    if !optimizer.postprocess(&mut patch, store, filter, scratch) {
                        continue;
                    }
                    let _ = tx.send(patch);
                });
            }
        });
        drop(tx);
        drop(store);

        let accepted: Vec<Patch> = rx.try_iter().collect();
        let stats = OptimizeStats {
            candidates: candidates.len(),
            accepted: accepted.len(),
        };

        let mut store = self.store.write();
        for patch in accepted {
            store.add_patch(patch, &self.photos);
        }
        if self.cfg.depth >= 1 {
            store.refresh_visibility(&self.photos);
        }
        info!(
            candidates = stats.candidates,
            accepted = stats.accepted,
            stored = store.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "optimization pass done"
        );
        stats
    }

    /// Run the filtering pipeline over the store.
    pub fn run_filter(&self) {
        let mut store = self.store.write();
        self.filter.run(&mut store);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::xyz;
    use crate::testutil;
    use rand::{rngs::StdRng, Rng, SeedableRng};

    #[test]
    fn parallel_map_preserves_order() {
        let items: Vec<usize> = (0..137).collect();
        let out = parallel_map(4, &items, |i, &v| {
            assert_eq!(i, v);
            v * v
        });
        for (i, v) in out.iter().enumerate() {
            assert_eq!(*v, i * i);
        }
    }

    #[test]
    fn optimize_accepts_and_upholds_invariants() {
        let photos = testutil::plane_scene(5, 96, 96, 4, 17);
        let cfg = testutil::test_config(photos.len());
        let mut engine = Engine::new(photos.clone(), cfg.clone());

        // Seed a grid of slightly perturbed candidates on the plane.
        let mut rng = StdRng::seed_from_u64(5);
        let mut candidates = Vec::new();
        for dy in -2i32..=2 {
            for dx in -2i32..=2 {
                let mut p =
                    testutil::plane_patch(&photos, dx as f32 * 0.12, dy as f32 * 0.12);
                p.coord.z += rng.gen_range(-0.01..0.01);
                candidates.push(p);
            }
        }

        let stats = engine.optimize(candidates);
        assert!(
            stats.accepted > stats.candidates / 2,
            "accepted {}/{}",
            stats.accepted,
            stats.candidates
        );

        let store = engine.store();
        let cos_t = cfg.angle_threshold1.cos();
        for (_, patch) in store.patches() {
            assert!(patch.images.len() >= cfg.min_image_num);
            assert!(patch.images[0] < cfg.tnum);
            let mut dedup = patch.images.clone();
            dedup.sort_unstable();
            dedup.dedup();
            assert_eq!(dedup.len(), patch.images.len(), "duplicate images");
            assert!((xyz(&patch.normal).norm() - 1.0).abs() < 1e-3);
            assert!(patch.dscale > 0.0 && patch.ascale > 0.0);

            for &image in &patch.images {
                let icoord = photos.project(image, &patch.coord, cfg.level);
                assert!(icoord.x >= 3.0 && icoord.y >= 3.0);
                assert!(icoord.x < (photos.width(image, cfg.level) - 4) as f32);
                assert!(icoord.y < (photos.height(image, cfg.level) - 4) as f32);

                let ray = xyz(&(photos.photo(image).center - patch.coord)).normalize();
                assert!(ray.dot(&xyz(&patch.normal)) >= cos_t - 1e-3);
            }
        }
    }

    #[test]
    fn filter_after_optimize_is_monotonic() {
        let photos = testutil::plane_scene(5, 96, 96, 4, 17);
        let mut cfg = testutil::test_config(photos.len());
        cfg.min_patches_grid = 2;
        let mut engine = Engine::new(photos.clone(), cfg);

        let mut candidates = Vec::new();
        for dy in -2i32..=2 {
            for dx in -2i32..=2 {
                candidates.push(testutil::plane_patch(
                    &photos,
                    dx as f32 * 0.12,
                    dy as f32 * 0.12,
                ));
            }
        }
        engine.optimize(candidates);
        let before = engine.store().len();
        engine.run_filter();
        assert!(engine.store().len() <= before);
    }
}
