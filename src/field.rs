//! Ghost-padded 3-D fields and the per-rank U/V store.
//!
//! A [`Field`] holds `(sx+2)(sy+2)(sz+2)` doubles, x fastest. Index 0 and
//! `size+1` along each axis are ghost cells owned by the halo exchange; the
//! interior runs from 1 to `size`. Callers address cells by coordinates only.

use rand::Rng;

use crate::decomposition::LocalDomain;
use crate::settings::Settings;

#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    size: [usize; 3],
    data: Vec<f64>,
}

impl Field {
    /// A zero-filled field for an interior of `size` cells.
    pub fn zeros(size: [usize; 3]) -> Self {
        let len = size.iter().map(|s| s + 2).product();
        Self {
            size,
            data: vec![0.0; len],
        }
    }

    /// Interior extents, ghosts excluded.
    pub fn size(&self) -> [usize; 3] {
        self.size
    }

    pub(crate) fn stride_y(&self) -> usize {
        self.size[0] + 2
    }

    pub(crate) fn stride_z(&self) -> usize {
        (self.size[0] + 2) * (self.size[1] + 2)
    }

    /// Flat offset of padded local coordinates.
    ///
    /// # Panics
    ///
    /// If a coordinate lies past the ghost layer.
    #[inline]
    pub(crate) fn index(&self, x: usize, y: usize, z: usize) -> usize {
        assert!(
            x < self.size[0] + 2 && y < self.size[1] + 2 && z < self.size[2] + 2,
            "({x}, {y}, {z}) is outside a padded field of interior {:?}",
            self.size
        );
        x + y * self.stride_y() + z * self.stride_z()
    }

    /// Value at padded local coordinates; panics outside the padded extent.
    #[inline]
    pub fn get(&self, x: usize, y: usize, z: usize) -> f64 {
        self.data[self.index(x, y, z)]
    }

    #[inline]
    pub fn set(&mut self, x: usize, y: usize, z: usize, value: f64) {
        let i = self.index(x, y, z);
        self.data[i] = value;
    }

    /// Value at a global cell, if `domain` owns it.
    pub fn get_global(&self, domain: &LocalDomain, g: [usize; 3]) -> Option<f64> {
        domain.global_to_local(g).map(|[x, y, z]| self.get(x, y, z))
    }

    /// Sets a global cell; returns false if `domain` does not own it.
    pub fn set_global(&mut self, domain: &LocalDomain, g: [usize; 3], value: f64) -> bool {
        match domain.global_to_local(g) {
            Some([x, y, z]) => {
                self.set(x, y, z, value);
                true
            }
            None => false,
        }
    }

    /// Sets every interior cell to `value`; ghosts are left alone.
    pub fn fill(&mut self, value: f64) {
        self.for_each_interior_mut(|_, v| *v = value);
    }

    /// Visits interior cells x fastest with their padded coordinates.
    pub fn for_each_interior(&self, mut f: impl FnMut([usize; 3], f64)) {
        let [sx, sy, sz] = self.size;
        for z in 1..=sz {
            for y in 1..=sy {
                let row = self.index(0, y, z);
                for x in 1..=sx {
                    f([x, y, z], self.data[row + x]);
                }
            }
        }
    }

    pub fn for_each_interior_mut(&mut self, mut f: impl FnMut([usize; 3], &mut f64)) {
        let [sx, sy, sz] = self.size;
        for z in 1..=sz {
            for y in 1..=sy {
                let row = self.index(0, y, z);
                for x in 1..=sx {
                    f([x, y, z], &mut self.data[row + x]);
                }
            }
        }
    }

    pub fn interior_sum(&self) -> f64 {
        let mut sum = 0.0;
        self.for_each_interior(|_, v| sum += v);
        sum
    }

    pub fn interior_min_max(&self) -> (f64, f64) {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        self.for_each_interior(|_, v| {
            min = min.min(v);
            max = max.max(v);
        });
        (min, max)
    }

    pub(crate) fn data(&self) -> &[f64] {
        &self.data
    }

    pub(crate) fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }
}

/// U and V of one rank, each with a "next" buffer for the stencil sweep.
#[derive(Debug, Clone)]
pub struct FieldStore {
    domain: LocalDomain,
    pub u: Field,
    pub v: Field,
    pub(crate) u_next: Field,
    pub(crate) v_next: Field,
}

impl FieldStore {
    /// Zero-filled buffers sized for `domain`.
    pub fn new(domain: LocalDomain) -> Self {
        Self {
            domain,
            u: Field::zeros(domain.size),
            v: Field::zeros(domain.size),
            u_next: Field::zeros(domain.size),
            v_next: Field::zeros(domain.size),
        }
    }

    pub fn domain(&self) -> &LocalDomain {
        &self.domain
    }

    /// Bounds `[start, end)` of the perturbed sub-cube along every axis.
    pub fn perturbation_bounds(global: usize) -> (usize, usize) {
        let side = (global / 2).max(1);
        let start = global / 4;
        (start, start + side)
    }

    /// Writes the initial condition.
    ///
    /// Every interior cell starts at U=1, V=0. Cells of the centered sub-cube
    /// get `U = 1 - noise*ξ`, `V = noise*η` with ξ, η uniform in [0, 1).
    pub fn seed<R: Rng>(&mut self, settings: &Settings, rng: &mut R) {
        self.u.fill(1.0);
        self.v.fill(0.0);

        let (start, end) = Self::perturbation_bounds(self.domain.global);
        let lo = self.domain.offset.map(|o| o.max(start));
        let hi: [usize; 3] =
            std::array::from_fn(|a| (self.domain.offset[a] + self.domain.size[a]).min(end));
        if (0..3).any(|a| lo[a] >= hi[a]) {
            return;
        }

        for gz in lo[2]..hi[2] {
            for gy in lo[1]..hi[1] {
                for gx in lo[0]..hi[0] {
                    let g = [gx, gy, gz];
                    let xi: f64 = rng.gen();
                    let eta: f64 = rng.gen();
                    self.u.set_global(&self.domain, g, 1.0 - settings.noise * xi);
                    self.v.set_global(&self.domain, g, settings.noise * eta);
                }
            }
        }
    }

    /// Replaces the current fields, e.g. after a restore.
    pub fn replace(&mut self, u: Field, v: Field) {
        debug_assert_eq!(u.size(), self.domain.size);
        debug_assert_eq!(v.size(), self.domain.size);
        self.u = u;
        self.v = v;
    }

    /// Makes "next" the current state.
    pub(crate) fn swap(&mut self) {
        std::mem::swap(&mut self.u, &mut self.u_next);
        std::mem::swap(&mut self.v, &mut self.v_next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decomposition::local_extents;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn flat_index_is_x_fastest_with_ghost_padding() {
        let f = Field::zeros([3, 4, 5]);
        assert_eq!(f.data().len(), 5 * 6 * 7);
        assert_eq!(f.index(0, 0, 0), 0);
        assert_eq!(f.index(1, 0, 0), 1);
        assert_eq!(f.index(0, 1, 0), 5);
        assert_eq!(f.index(0, 0, 1), 30);
        assert_eq!(f.index(4, 5, 6), 4 + 5 * 5 + 6 * 30);
    }

    #[test]
    fn global_access_respects_ownership() {
        let domain = local_extents(8, [1, 0, 0], [2, 1, 1]).unwrap();
        let mut f = Field::zeros(domain.size);
        assert!(f.set_global(&domain, [4, 2, 3], 9.0));
        assert!(!f.set_global(&domain, [3, 2, 3], 9.0));
        assert_eq!(f.get(1, 3, 4), 9.0);
        assert_eq!(f.get_global(&domain, [4, 2, 3]), Some(9.0));
        assert_eq!(f.get_global(&domain, [0, 0, 0]), None);
    }

    #[test]
    fn fill_leaves_ghosts_untouched() {
        let mut f = Field::zeros([2, 2, 2]);
        f.fill(3.0);
        assert_eq!(f.interior_sum(), 24.0);
        assert_eq!(f.get(0, 1, 1), 0.0);
        assert_eq!(f.get(3, 3, 3), 0.0);
        assert_eq!(f.interior_min_max(), (3.0, 3.0));
    }

    #[test]
    fn zero_noise_seeds_uniform_baseline() {
        let settings = Settings {
            l: 8,
            noise: 0.0,
            ..Settings::default()
        };
        let mut store = FieldStore::new(LocalDomain::whole(8));
        store.seed(&settings, &mut StdRng::seed_from_u64(1));
        assert_eq!(store.u.interior_min_max(), (1.0, 1.0));
        assert_eq!(store.v.interior_min_max(), (0.0, 0.0));
    }

    #[test]
    fn perturbation_stays_inside_the_central_cube() {
        let settings = Settings {
            l: 8,
            noise: 0.5,
            ..Settings::default()
        };
        let domain = LocalDomain::whole(8);
        let mut store = FieldStore::new(domain);
        store.seed(&settings, &mut StdRng::seed_from_u64(7));
        let (start, end) = FieldStore::perturbation_bounds(8);
        assert_eq!((start, end), (2, 6));

        let mut perturbed = 0;
        store.v.for_each_interior(|l, v| {
            let g = domain.local_to_global(l).unwrap();
            let inside = g.iter().all(|&c| c >= start && c < end);
            if !inside {
                assert_eq!(v, 0.0);
                assert_eq!(store.u.get(l[0], l[1], l[2]), 1.0);
            } else {
                assert!((0.0..0.5).contains(&v));
                let u = store.u.get(l[0], l[1], l[2]);
                assert!(u > 0.5 && u <= 1.0);
                perturbed += 1;
            }
        });
        assert_eq!(perturbed, 4 * 4 * 4);
    }

    #[test]
    fn ranks_outside_the_cube_keep_the_baseline() {
        let settings = Settings {
            l: 16,
            noise: 1.0,
            ..Settings::default()
        };
        // The corner block [0,4)³ never meets the cube [4,12)³.
        let domain = local_extents(16, [0, 0, 0], [4, 4, 4]).unwrap();
        let mut store = FieldStore::new(domain);
        store.seed(&settings, &mut StdRng::seed_from_u64(3));
        assert_eq!(store.u.interior_min_max(), (1.0, 1.0));
        assert_eq!(store.v.interior_min_max(), (0.0, 0.0));
    }

    #[test]
    fn same_seed_same_field() {
        let settings = Settings {
            l: 6,
            noise: 0.2,
            ..Settings::default()
        };
        let mut a = FieldStore::new(LocalDomain::whole(6));
        let mut b = FieldStore::new(LocalDomain::whole(6));
        a.seed(&settings, &mut StdRng::seed_from_u64(42));
        b.seed(&settings, &mut StdRng::seed_from_u64(42));
        assert_eq!(a.u, b.u);
        assert_eq!(a.v, b.v);
    }

    #[test]
    #[should_panic(expected = "outside a padded field")]
    fn reads_past_the_ghost_layer_panic() {
        let field = Field::zeros([3, 2, 2]);
        // x = 5 would alias (0, 1, 0) without the check.
        field.get(5, 0, 0);
    }

    #[test]
    #[should_panic(expected = "outside a padded field")]
    fn writes_past_the_ghost_layer_panic() {
        let mut field = Field::zeros([3, 2, 2]);
        field.set(0, 4, 0, 1.0);
    }
}
