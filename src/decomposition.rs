//! Cartesian domain decomposition of the L³ grid over a 3-D process grid.
//!
//! Ranks are laid out x-fastest: `rank = px + py*npx + pz*npx*npy`. Each axis
//! of length L is split as evenly as possible over that axis' process count,
//! the remainder going to the lowest coordinates.

use crate::error::{Error, Result};
use crate::settings::Boundary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Name of the face plane normal to this axis.
    pub fn plane(self) -> &'static str {
        match self {
            Axis::X => "YZ",
            Axis::Y => "XZ",
            Axis::Z => "XY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Minus,
    Plus,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Minus => Side::Plus,
            Side::Plus => Side::Minus,
        }
    }
}

/// One of the six faces of a subdomain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Face {
    pub axis: Axis,
    pub side: Side,
}

impl Face {
    pub const ALL: [Face; 6] = [
        Face::new(Axis::X, Side::Minus),
        Face::new(Axis::X, Side::Plus),
        Face::new(Axis::Y, Side::Minus),
        Face::new(Axis::Y, Side::Plus),
        Face::new(Axis::Z, Side::Minus),
        Face::new(Axis::Z, Side::Plus),
    ];

    pub const fn new(axis: Axis, side: Side) -> Self {
        Self { axis, side }
    }

    fn slot(self) -> usize {
        self.axis as usize * 2 + self.side as usize
    }

    pub fn name(self) -> &'static str {
        match (self.axis, self.side) {
            (Axis::X, Side::Minus) => "west",
            (Axis::X, Side::Plus) => "east",
            (Axis::Y, Side::Minus) => "down",
            (Axis::Y, Side::Plus) => "up",
            (Axis::Z, Side::Minus) => "south",
            (Axis::Z, Side::Plus) => "north",
        }
    }
}

/// Neighbor rank across each face; `None` where a non-periodic domain ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Neighbors([Option<usize>; 6]);

impl Neighbors {
    pub fn get(&self, face: Face) -> Option<usize> {
        self.0[face.slot()]
    }

    fn set(&mut self, face: Face, rank: Option<usize>) {
        self.0[face.slot()] = rank;
    }

    pub fn iter(&self) -> impl Iterator<Item = (Face, Option<usize>)> + '_ {
        Face::ALL.iter().map(move |&face| (face, self.get(face)))
    }
}

/// Where this rank sits in the process grid and who surrounds it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessTopology {
    pub procs: usize,
    pub rank: usize,
    pub dims: [usize; 3],
    pub coords: [usize; 3],
    pub neighbors: Neighbors,
}

impl ProcessTopology {
    /// Decodes `rank` into grid coordinates and derives its six neighbors.
    pub fn assign(rank: usize, dims: [usize; 3], boundary: Boundary) -> Result<Self> {
        let procs = dims.iter().product::<usize>();
        if dims.contains(&0) {
            return Err(Error::config(format!("Process grid {dims:?} has an empty axis")));
        }
        if rank >= procs {
            return Err(Error::InvalidRank(rank));
        }
        let coords = [
            rank % dims[0],
            (rank / dims[0]) % dims[1],
            rank / (dims[0] * dims[1]),
        ];

        let mut neighbors = Neighbors::default();
        for face in Face::ALL {
            let a = face.axis.index();
            let n = dims[a];
            let c = coords[a];
            let target = match (face.side, boundary) {
                (Side::Minus, Boundary::Periodic) => Some((c + n - 1) % n),
                (Side::Plus, Boundary::Periodic) => Some((c + 1) % n),
                (Side::Minus, Boundary::ZeroFlux) => c.checked_sub(1),
                (Side::Plus, Boundary::ZeroFlux) => Some(c + 1).filter(|&p| p < n),
            };
            let rank = target.map(|p| {
                let mut at = coords;
                at[a] = p;
                rank_of(at, dims)
            });
            neighbors.set(face, rank);
        }

        Ok(Self {
            procs,
            rank,
            dims,
            coords,
            neighbors,
        })
    }
}

fn rank_of(coords: [usize; 3], dims: [usize; 3]) -> usize {
    coords[0] + coords[1] * dims[0] + coords[2] * dims[0] * dims[1]
}

/// The block of the global grid one rank owns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalDomain {
    /// Global edge length L.
    pub global: usize,
    pub size: [usize; 3],
    pub offset: [usize; 3],
}

impl LocalDomain {
    /// A domain covering the whole grid, as owned by a single rank.
    pub fn whole(global: usize) -> Self {
        Self {
            global,
            size: [global; 3],
            offset: [0; 3],
        }
    }

    pub fn cells(&self) -> usize {
        self.size.iter().product()
    }

    /// Extents including the ghost layer on both sides.
    pub fn padded(&self) -> [usize; 3] {
        self.size.map(|s| s + 2)
    }

    pub fn contains_global(&self, g: [usize; 3]) -> bool {
        (0..3).all(|a| g[a] >= self.offset[a] && g[a] < self.offset[a] + self.size[a])
    }

    /// Global cell to padded local coordinates (interior starts at 1).
    pub fn global_to_local(&self, g: [usize; 3]) -> Option<[usize; 3]> {
        if !self.contains_global(g) {
            return None;
        }
        Some([
            g[0] - self.offset[0] + 1,
            g[1] - self.offset[1] + 1,
            g[2] - self.offset[2] + 1,
        ])
    }

    /// Padded local interior coordinates to global cell.
    pub fn local_to_global(&self, l: [usize; 3]) -> Option<[usize; 3]> {
        if (0..3).any(|a| l[a] == 0 || l[a] > self.size[a]) {
            return None;
        }
        Some([
            l[0] - 1 + self.offset[0],
            l[1] - 1 + self.offset[1],
            l[2] - 1 + self.offset[2],
        ])
    }
}

/// Splits `l` cells over `n` processes and returns (size, offset) of `coord`.
fn split_axis(l: usize, n: usize, coord: usize) -> (usize, usize) {
    let base = l / n;
    let rem = l % n;
    let size = base + usize::from(coord < rem);
    let offset = coord * base + coord.min(rem);
    (size, offset)
}

/// Extent and offset of the subdomain at `coords` in a `dims` process grid.
pub fn local_extents(l: usize, coords: [usize; 3], dims: [usize; 3]) -> Result<LocalDomain> {
    let mut size = [0; 3];
    let mut offset = [0; 3];
    for a in 0..3 {
        if dims[a] == 0 || l < dims[a] {
            return Err(Error::config(format!(
                "Cannot split L={l} across {} processes along axis {a}",
                dims[a]
            )));
        }
        if coords[a] >= dims[a] {
            return Err(Error::config(format!(
                "Coordinate {coords:?} outside process grid {dims:?}"
            )));
        }
        (size[a], offset[a]) = split_axis(l, dims[a], coords[a]);
    }
    Ok(LocalDomain {
        global: l,
        size,
        offset,
    })
}

fn divisors(n: usize) -> impl Iterator<Item = usize> {
    (1..=n).filter(move |d| n % d == 0)
}

/// Balanced 3-D factorization of `procs`.
///
/// Minimizes the ratio between the largest and smallest axis; ties go to the
/// non-increasing shape.
pub fn factorize(procs: usize) -> Result<[usize; 3]> {
    factorize_with(procs, [0, 0, 0])
}

/// Like [`factorize`], but non-zero entries of `requested` are fixed.
pub fn factorize_with(procs: usize, requested: [usize; 3]) -> Result<[usize; 3]> {
    if procs == 0 {
        return Err(Error::config("Number of processes must be positive"));
    }
    let fixed: usize = requested.iter().filter(|&&d| d > 0).product();
    if requested.iter().all(|&d| d > 0) {
        if fixed != procs {
            return Err(Error::config(format!(
                "Process grid {requested:?} does not match {procs} processes"
            )));
        }
        return Ok(requested);
    }
    if procs % fixed != 0 {
        return Err(Error::config(format!(
            "Process grid {requested:?} cannot be completed for {procs} processes"
        )));
    }

    let mut best: Option<([usize; 3], (u64, u64))> = None;
    for a in divisors(procs) {
        for b in divisors(procs / a) {
            let c = procs / a / b;
            let dims = [a, b, c];
            if (0..3).any(|i| requested[i] > 0 && requested[i] != dims[i]) {
                continue;
            }
            let max = *dims.iter().max().unwrap_or(&1) as u64;
            let min = *dims.iter().min().unwrap_or(&1) as u64;
            let better = match best {
                None => true,
                // Compare max/min ratios exactly by cross-multiplying.
                Some((prev, (pmax, pmin))) => {
                    let lhs = max * pmin;
                    let rhs = pmax * min;
                    lhs < rhs || (lhs == rhs && rank_shape(dims) > rank_shape(prev))
                }
            };
            if better {
                best = Some((dims, (max, min)));
            }
        }
    }
    best.map(|(dims, _)| dims)
        .ok_or_else(|| Error::config(format!("No process grid for {procs} processes")))
}

/// Tie-break key: non-increasing shapes first, then lexicographically largest.
fn rank_shape(dims: [usize; 3]) -> (bool, [usize; 3]) {
    (dims[0] >= dims[1] && dims[1] >= dims[2], dims)
}

/// The full decomposition of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decomposition {
    pub global: usize,
    pub dims: [usize; 3],
    pub boundary: Boundary,
}

impl Decomposition {
    /// Chooses (or validates) the process grid for `procs` ranks.
    pub fn new(
        global: usize,
        procs: usize,
        requested: [usize; 3],
        boundary: Boundary,
    ) -> Result<Self> {
        let dims = factorize_with(procs, requested)?;
        for (a, &n) in dims.iter().enumerate() {
            if global < n {
                return Err(Error::config(format!(
                    "Axis {a} of length {global} is shorter than its {n} processes"
                )));
            }
        }
        Ok(Self {
            global,
            dims,
            boundary,
        })
    }

    pub fn procs(&self) -> usize {
        self.dims.iter().product()
    }

    pub fn topology(&self, rank: usize) -> Result<ProcessTopology> {
        ProcessTopology::assign(rank, self.dims, self.boundary)
    }

    pub fn local_domain(&self, rank: usize) -> Result<LocalDomain> {
        let topology = self.topology(rank)?;
        local_extents(self.global, topology.coords, self.dims)
    }

    /// Every rank's subdomain, indexed by rank.
    pub fn domains(&self) -> Result<Vec<LocalDomain>> {
        (0..self.procs()).map(|r| self.local_domain(r)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn factorize_prefers_balanced_shapes() {
        assert_eq!(factorize(1).unwrap(), [1, 1, 1]);
        assert_eq!(factorize(2).unwrap(), [2, 1, 1]);
        assert_eq!(factorize(8).unwrap(), [2, 2, 2]);
        assert_eq!(factorize(12).unwrap(), [3, 2, 2]);
        assert_eq!(factorize(27).unwrap(), [3, 3, 3]);
        assert_eq!(factorize(7).unwrap(), [7, 1, 1]);
    }

    #[test]
    fn explicit_shape_is_used_verbatim() {
        assert_eq!(factorize_with(8, [8, 1, 1]).unwrap(), [8, 1, 1]);
        assert_eq!(factorize_with(6, [1, 2, 3]).unwrap(), [1, 2, 3]);
    }

    #[test]
    fn explicit_shape_must_match_process_count() {
        assert!(matches!(
            factorize_with(8, [2, 2, 1]),
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(matches!(
            factorize_with(8, [3, 0, 0]),
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(matches!(factorize(0), Err(Error::InvalidConfiguration(_))));
    }

    #[test]
    fn partially_fixed_shape_completes_free_axes() {
        assert_eq!(factorize_with(8, [0, 0, 1]).unwrap(), [4, 2, 1]);
        assert_eq!(factorize_with(12, [3, 0, 0]).unwrap(), [3, 2, 2]);
    }

    #[test]
    fn remainder_goes_to_lowest_coordinates() {
        let sizes: Vec<_> = (0..3).map(|c| split_axis(10, 3, c)).collect();
        assert_eq!(sizes, vec![(4, 0), (3, 4), (3, 7)]);
    }

    #[test]
    fn local_extents_per_axis() {
        let d = local_extents(10, [2, 0, 1], [3, 1, 2]).unwrap();
        assert_eq!(d.size, [3, 10, 5]);
        assert_eq!(d.offset, [7, 0, 5]);
        assert_eq!(d.padded(), [5, 12, 7]);
    }

    #[test]
    fn axis_shorter_than_process_count_is_rejected() {
        assert!(matches!(
            local_extents(2, [0, 0, 0], [3, 1, 1]),
            Err(Error::InvalidConfiguration(_))
        ));
        assert!(matches!(
            Decomposition::new(2, 8, [8, 1, 1], Boundary::Periodic),
            Err(Error::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn rank_decodes_x_fastest() {
        let t = ProcessTopology::assign(5, [2, 3, 2], Boundary::Periodic).unwrap();
        assert_eq!(t.coords, [1, 2, 0]);
        assert_eq!(t.procs, 12);
        assert_eq!(rank_of(t.coords, t.dims), 5);
    }

    #[test]
    fn periodic_neighbors_wrap() {
        let t = ProcessTopology::assign(0, [2, 2, 2], Boundary::Periodic).unwrap();
        let n = t.neighbors;
        assert_eq!(n.get(Face::new(Axis::X, Side::Minus)), Some(1));
        assert_eq!(n.get(Face::new(Axis::X, Side::Plus)), Some(1));
        assert_eq!(n.get(Face::new(Axis::Y, Side::Minus)), Some(2));
        assert_eq!(n.get(Face::new(Axis::Z, Side::Plus)), Some(4));

        let single = ProcessTopology::assign(0, [1, 1, 1], Boundary::Periodic).unwrap();
        assert!(single.neighbors.iter().all(|(_, r)| r == Some(0)));
    }

    #[test]
    fn zero_flux_boundaries_have_no_neighbor() {
        let t = ProcessTopology::assign(0, [3, 1, 1], Boundary::ZeroFlux).unwrap();
        assert_eq!(t.neighbors.get(Face::new(Axis::X, Side::Minus)), None);
        assert_eq!(t.neighbors.get(Face::new(Axis::X, Side::Plus)), Some(1));
        assert_eq!(t.neighbors.get(Face::new(Axis::Y, Side::Plus)), None);

        let middle = ProcessTopology::assign(1, [3, 1, 1], Boundary::ZeroFlux).unwrap();
        assert_eq!(middle.neighbors.get(Face::new(Axis::X, Side::Minus)), Some(0));
        assert_eq!(middle.neighbors.get(Face::new(Axis::X, Side::Plus)), Some(2));
    }

    #[test]
    fn global_local_translation_accounts_for_ghosts() {
        let d = local_extents(10, [1, 0, 0], [2, 1, 1]).unwrap();
        assert_eq!(d.offset, [5, 0, 0]);
        assert_eq!(d.global_to_local([5, 0, 9]), Some([1, 1, 10]));
        assert_eq!(d.global_to_local([4, 0, 0]), None);
        assert_eq!(d.local_to_global([1, 1, 10]), Some([5, 0, 9]));
        assert_eq!(d.local_to_global([0, 1, 1]), None);
        assert_eq!(d.local_to_global([6, 1, 1]), None);
    }

    #[test]
    fn neighbors_agree_pairwise() {
        let decomposition = Decomposition::new(12, 12, [0, 0, 0], Boundary::Periodic).unwrap();
        for rank in 0..decomposition.procs() {
            let t = decomposition.topology(rank).unwrap();
            for (face, neighbor) in t.neighbors.iter() {
                let other = decomposition.topology(neighbor.unwrap()).unwrap();
                let back = Face::new(face.axis, face.side.opposite());
                assert_eq!(other.neighbors.get(back), Some(rank));
            }
        }
    }
}
