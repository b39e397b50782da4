//! The shared pool of accepted patches.
//!
//! Patches are owned by the store and addressed by [`PatchId`]. Every image
//! carries a coarse grid (`csize` pixels per cell at the working level) that
//! indexes the patches projecting into each cell; target images additionally
//! carry a depth map holding the closest patch per cell. The grids drive
//! neighbor queries, the gain computation and the occlusion filters.

use std::collections::{HashMap, HashSet};

use nalgebra::Vector3;

use crate::config::Config;
use crate::patch::{unitize3, xyz, Patch, PatchId, PatchStatus};
use crate::photo::PhotoSet;

/// Two patch normals more than this far apart are never neighbors.
const NEIGHBOR_MAX_NORMAL_ANGLE: f32 = 120.0 * std::f32::consts::PI / 180.0;

/// Fineness stand-in for images that view a patch from behind.
pub(crate) const INVALID_UNIT: f32 = 1.0e9;

pub struct PatchStore {
    cfg: Config,
    gwidths: Vec<usize>,
    gheights: Vec<usize>,
    /// Per image, per cell: patches whose projection lands in the cell.
    pgrids: Vec<Vec<Vec<PatchId>>>,
    /// Same, for visibility-only images.
    vgrids: Vec<Vec<Vec<PatchId>>>,
    /// Per target image, per cell: the closest patch and its depth.
    dpgrids: Vec<Vec<Option<(PatchId, f32)>>>,
    patches: HashMap<PatchId, Patch>,
    next_id: u64,
}

impl PatchStore {
    pub fn new(cfg: Config, photos: &PhotoSet) -> Self {
        let num = photos.len();
        let mut gwidths = Vec::with_capacity(num);
        let mut gheights = Vec::with_capacity(num);
        for i in 0..num {
            gwidths.push(photos.width(i, cfg.level) / cfg.csize + 1);
            gheights.push(photos.height(i, cfg.level) / cfg.csize + 1);
        }
        let pgrids = (0..num)
            .map(|i| vec![Vec::new(); gwidths[i] * gheights[i]])
            .collect();
        let vgrids = (0..num)
            .map(|i| vec![Vec::new(); gwidths[i] * gheights[i]])
            .collect();
        let dpgrids = (0..cfg.tnum)
            .map(|i| vec![None; gwidths[i] * gheights[i]])
            .collect();
        Self {
            cfg,
            gwidths,
            gheights,
            pgrids,
            vgrids,
            dpgrids,
            patches: HashMap::new(),
            next_id: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn get(&self, id: PatchId) -> Option<&Patch> {
        self.patches.get(&id)
    }

    pub fn patches(&self) -> impl Iterator<Item = (PatchId, &Patch)> {
        self.patches.iter().map(|(&id, p)| (id, p))
    }

    /// All ids in ascending order, a stable snapshot for a filter pass.
    pub fn collect_ids(&self) -> Vec<PatchId> {
        let mut ids: Vec<PatchId> = self.patches.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn grid_width(&self, image: usize) -> usize {
        self.gwidths[image]
    }

    pub fn grid_height(&self, image: usize) -> usize {
        self.gheights[image]
    }

    /// Grid cell of a projected point, or `None` when it falls off the grid.
    pub fn cell(&self, image: usize, icoord: &Vector3<f32>) -> Option<(i32, i32)> {
        if icoord.x < 0.0 || icoord.y < 0.0 {
            return None;
        }
        let ix = ((icoord.x + 0.5).floor() as i32) / self.cfg.csize as i32;
        let iy = ((icoord.y + 0.5).floor() as i32) / self.cfg.csize as i32;
        if ix < 0 || iy < 0 || ix as usize >= self.gwidths[image] || iy as usize >= self.gheights[image]
        {
            return None;
        }
        Some((ix, iy))
    }

    fn cell_index(&self, image: usize, cell: (i32, i32)) -> Option<usize> {
        let (ix, iy) = cell;
        if ix < 0 || iy < 0 || ix as usize >= self.gwidths[image] || iy as usize >= self.gheights[image]
        {
            return None;
        }
        Some(iy as usize * self.gwidths[image] + ix as usize)
    }

    /// Patches indexed in a cell of an image grid; empty when off-grid.
    pub fn pgrid(&self, image: usize, cell: (i32, i32)) -> &[PatchId] {
        match self.cell_index(image, cell) {
            Some(i) => &self.pgrids[image][i],
            None => &[],
        }
    }

    pub fn vgrid(&self, image: usize, cell: (i32, i32)) -> &[PatchId] {
        match self.cell_index(image, cell) {
            Some(i) => &self.vgrids[image][i],
            None => &[],
        }
    }

    /// The closest stored patch rasterized into a depth-map cell.
    pub fn depth_entry(&self, image: usize, cell: (i32, i32)) -> Option<(PatchId, f32)> {
        let index = self.cell_index(image, cell)?;
        self.dpgrids[image][index]
    }

    /// Recompute the patch-local cell list from its image projections.
    pub fn set_grids(&self, patch: &mut Patch, photos: &PhotoSet) {
        patch.grids.clear();
        for &image in &patch.images {
            let icoord = photos.project(image, &patch.coord, self.cfg.level);
            let ix = ((icoord.x + 0.5).floor() as i32) / self.cfg.csize as i32;
            let iy = ((icoord.y + 0.5).floor() as i32) / self.cfg.csize as i32;
            patch.grids.push((ix, iy));
        }
    }

    /// Initialize `dscale` and `ascale` so one depth step moves the worst
    /// non-reference projection by about one pixel.
    pub fn set_scales(&self, patch: &mut Patch, photos: &PhotoSet) {
        let level = self.cfg.level;
        let unit = photos.pixel_unit(patch.images[0], &patch.coord, level);
        let unit2 = 2.0 * unit;
        let mut ray = patch.coord - photos.photo(patch.images[0]).center;
        unitize3(&mut ray);

        let inum = self.cfg.tau.min(patch.images.len());
        let mut maxdiff = 0.0f32;
        for i in 1..inum {
            let image = patch.images[i];
            let p0 = photos.project(image, &patch.coord, level);
            let p1 = photos.project(image, &(patch.coord - ray * unit2), level);
            maxdiff = maxdiff.max((p1 - p0).norm());
        }

        patch.dscale = if maxdiff > 0.0 { unit2 / maxdiff } else { unit2 };
        patch.ascale = (patch.dscale / (unit * self.cfg.wsize as f32 / 2.0)).atan();
    }

    /// Append every target image that should see the patch (by the depth
    /// maps) to `vimages`/`vgrids`.
    pub fn set_vimages_vgrids(&self, patch: &mut Patch, photos: &PhotoSet) {
        let mut used = vec![false; self.cfg.tnum];
        for &image in patch.images.iter().filter(|&&i| i < self.cfg.tnum) {
            used[image] = true;
        }
        for &image in &patch.vimages {
            used[image] = true;
        }

        for image in 0..self.cfg.tnum {
            if used[image] {
                continue;
            }
            let icoord = photos.project(image, &patch.coord, self.cfg.level);
            let Some(cell) = self.cell(image, &icoord) else {
                continue;
            };
            if self.is_visible(patch, image, cell, photos) {
                patch.vimages.push(image);
                patch.vgrids.push(cell);
            }
        }
    }

    /// Depth-map visibility: an empty cell has no occlusion evidence; an
    /// occupied cell must not be in front of the patch by more than the
    /// depth slack.
    fn is_visible(&self, patch: &Patch, image: usize, cell: (i32, i32), photos: &PhotoSet) -> bool {
        let Some((_, front_depth)) = self.depth_entry(image, cell) else {
            return true;
        };
        let depth = photos.depth(image, &patch.coord);
        let hunit = self.cfg.csize as f32
            * photos.pixel_unit(image, &patch.coord, self.cfg.level)
            * self.cfg.neighbor_threshold1;
        depth < front_depth + hunit
    }

    /// Insert a patch, registering it in the image and visibility grids.
    pub fn add_patch(&mut self, mut patch: Patch, photos: &PhotoSet) -> PatchId {
        let id = PatchId(self.next_id);
        self.next_id += 1;

        if patch.grids.len() != patch.images.len() {
            self.set_grids(&mut patch, photos);
        }
        patch.count_targets(self.cfg.tnum);
        patch.status = PatchStatus::Accepted;

        for (k, &image) in patch.images.iter().enumerate() {
            if let Some(index) = self.cell_index(image, patch.grids[k]) {
                self.pgrids[image][index].push(id);
            }
        }
        for (k, &image) in patch.vimages.iter().enumerate() {
            if let Some(index) = self.cell_index(image, patch.vgrids[k]) {
                self.vgrids[image][index].push(id);
            }
        }
        self.patches.insert(id, patch);
        id
    }

    /// Remove a patch, detaching it from every grid and depth map.
    pub fn remove_patch(&mut self, id: PatchId) -> Option<Patch> {
        let patch = self.patches.remove(&id)?;
        for (k, &image) in patch.images.iter().enumerate() {
            if let Some(index) = self.cell_index(image, patch.grids[k]) {
                self.pgrids[image][index].retain(|&p| p != id);
            }
        }
        for (k, &image) in patch.vimages.iter().enumerate() {
            if let Some(index) = self.cell_index(image, patch.vgrids[k]) {
                self.vgrids[image][index].retain(|&p| p != id);
            }
        }
        for grid in &mut self.dpgrids {
            for entry in grid.iter_mut() {
                if entry.map(|(p, _)| p) == Some(id) {
                    *entry = None;
                }
            }
        }
        Some(patch)
    }

    /// Replace a stored patch (e.g. after an image-list prune), refreshing
    /// its grid registrations.
    pub fn replace_patch(&mut self, id: PatchId, mut patch: Patch, photos: &PhotoSet) {
        let Some(old) = self.patches.remove(&id) else {
            return;
        };
        for (k, &image) in old.images.iter().enumerate() {
            if let Some(index) = self.cell_index(image, old.grids[k]) {
                self.pgrids[image][index].retain(|&p| p != id);
            }
        }
        for (k, &image) in old.vimages.iter().enumerate() {
            if let Some(index) = self.cell_index(image, old.vgrids[k]) {
                self.vgrids[image][index].retain(|&p| p != id);
            }
        }

        self.set_grids(&mut patch, photos);
        patch.count_targets(self.cfg.tnum);
        for (k, &image) in patch.images.iter().enumerate() {
            if let Some(index) = self.cell_index(image, patch.grids[k]) {
                self.pgrids[image][index].push(id);
            }
        }
        for (k, &image) in patch.vimages.iter().enumerate() {
            if let Some(index) = self.cell_index(image, patch.vgrids[k]) {
                self.vgrids[image][index].push(id);
            }
        }
        self.patches.insert(id, patch);
    }

    /// Rasterize all patches into the per-target-image depth maps; the
    /// closest patch wins each cell.
    pub fn update_depth_maps(&mut self, photos: &PhotoSet) {
        for grid in &mut self.dpgrids {
            for entry in grid.iter_mut() {
                *entry = None;
            }
        }
        for (&id, patch) in &self.patches {
            for image in 0..self.cfg.tnum {
                let icoord = photos.project(image, &patch.coord, self.cfg.level);
                let Some(cell) = self.cell(image, &icoord) else {
                    continue;
                };
                let Some(index) = self.cell_index(image, cell) else {
                    continue;
                };
                let depth = photos.depth(image, &patch.coord);
                match self.dpgrids[image][index] {
                    Some((_, best)) if best <= depth => {}
                    _ => self.dpgrids[image][index] = Some((id, depth)),
                }
            }
        }
    }

    /// Rebuild depth maps and recompute every patch's visibility images.
    pub fn refresh_visibility(&mut self, photos: &PhotoSet) {
        self.update_depth_maps(photos);
        for grid in &mut self.vgrids {
            for cell in grid.iter_mut() {
                cell.clear();
            }
        }
        for id in self.collect_ids() {
            let mut patch = match self.patches.remove(&id) {
                Some(p) => p,
                None => continue,
            };
            patch.vimages.clear();
            patch.vgrids.clear();
            self.set_vimages_vgrids(&mut patch, photos);
            for (k, &image) in patch.vimages.iter().enumerate() {
                if let Some(index) = self.cell_index(image, patch.vgrids[k]) {
                    self.vgrids[image][index].push(id);
                }
            }
            self.patches.insert(id, patch);
        }
    }

    /// Tangent-plane neighbor predicate; `threshold` is the allowed multiple
    /// of the joint pixel unit.
    pub fn is_neighbor(&self, lhs: &Patch, rhs: &Patch, threshold: f32, photos: &PhotoSet) -> bool {
        if xyz(&lhs.normal).dot(&xyz(&rhs.normal)) < NEIGHBOR_MAX_NORMAL_ANGLE.cos() {
            return false;
        }
        let level = self.cfg.level;
        let hunit = self.cfg.csize as f32
            * 0.5
            * (photos.pixel_unit(lhs.images[0], &lhs.coord, level)
                + photos.pixel_unit(rhs.images[0], &rhs.coord, level));
        let diff = rhs.coord - lhs.coord;
        let dist = 0.5 * (lhs.normal.dot(&diff).abs() + rhs.normal.dot(&diff).abs());
        dist < hunit * threshold
    }

    /// Collect neighbor patches through the image grids: cells within
    /// `margin` of the patch's cells over its images (and `vimages` unless
    /// `skip_vis`), filtered by the neighbor predicate scaled by `scale`.
    pub fn find_neighbors(
        &self,
        patch: &Patch,
        exclude: Option<PatchId>,
        scale: f32,
        margin: i32,
        skip_vis: bool,
        photos: &PhotoSet,
    ) -> Vec<PatchId> {
        let threshold = self.cfg.neighbor_threshold * scale;
        let mut seen: HashSet<PatchId> = HashSet::new();
        let mut out = Vec::new();

        let mut lists: Vec<(usize, (i32, i32))> = patch
            .images
            .iter()
            .zip(&patch.grids)
            .map(|(&i, &c)| (i, c))
            .collect();
        if !skip_vis {
            lists.extend(patch.vimages.iter().zip(&patch.vgrids).map(|(&i, &c)| (i, c)));
        }

        for (image, (cx, cy)) in lists {
            for dy in -margin..=margin {
                for dx in -margin..=margin {
                    for &id in self.pgrid(image, (cx + dx, cy + dy)) {
                        if Some(id) == exclude || !seen.insert(id) {
                            continue;
                        }
                        let Some(other) = self.patches.get(&id) else {
                            continue;
                        };
                        if self.is_neighbor(patch, other, threshold, photos) {
                            out.push(id);
                        }
                    }
                }
            }
        }
        out.sort();
        out
    }
}
