//! Domain decomposition of the global grid over the process topology.
//!
//! Every rank derives the same global picture from `(grid, topology)` alone, so
//! no communication is needed to know where any other rank's data lives.

use crate::error::{PicError, PicResult};
use crate::layout::SubarrayLayout;
use serde::{Deserialize, Serialize};

pub const AXES: [char; 3] = ['x', 'y', 'z'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalGrid {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
}

impl GlobalGrid {
    pub fn new(nx: usize, ny: usize, nz: usize) -> Self {
        Self { nx, ny, nz }
    }

    pub fn dims(&self) -> [usize; 3] {
        [self.nx, self.ny, self.nz]
    }

    pub fn cells(&self) -> usize {
        self.nx * self.ny * self.nz
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessTopology {
    pub px: usize,
    pub py: usize,
    pub pz: usize,
}

impl ProcessTopology {
    pub fn new(px: usize, py: usize, pz: usize) -> Self {
        Self { px, py, pz }
    }

    pub fn dims(&self) -> [usize; 3] {
        [self.px, self.py, self.pz]
    }

    pub fn ranks(&self) -> usize {
        self.px * self.py * self.pz
    }

    /// x-fastest linear rank -> Cartesian coordinate.
    pub fn coords_of(&self, rank: usize) -> [usize; 3] {
        [
            rank % self.px,
            (rank / self.px) % self.py,
            rank / (self.px * self.py),
        ]
    }

    pub fn rank_of(&self, coords: [usize; 3]) -> usize {
        coords[0] + self.px * (coords[1] + self.py * coords[2])
    }
}

/// How cells are spread when `n` is not a multiple of `p`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decomposition {
    /// Refuse grids that do not divide evenly.
    Uniform,
    /// The first `n % p` ranks along an axis take one extra cell.
    #[default]
    Remainder,
}

/// `(start, size)` of task `my_n` out of `ntasks` over `global_cells`.
pub fn local_extent(global_cells: usize, ntasks: usize, my_n: usize) -> PicResult<(usize, usize)> {
    if my_n >= ntasks {
        return Err(PicError::config(format!(
            "task {my_n} outside of {ntasks} tasks"
        )));
    }
    let n_per_task = global_cells / ntasks;
    let remainder = global_cells % ntasks;
    if my_n < remainder {
        Ok((my_n * (n_per_task + 1), n_per_task + 1))
    } else {
        Ok((my_n * n_per_task + remainder, n_per_task))
    }
}

/// Where one rank sits in the global grid.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainDescriptor {
    grid: GlobalGrid,
    topology: ProcessTopology,
    rank: usize,
    coords: [usize; 3],
    start: [usize; 3],
    cells: [usize; 3],
    ghost_width: usize,
}

impl DomainDescriptor {
    pub fn new(
        grid: GlobalGrid,
        topology: ProcessTopology,
        rank: usize,
        decomposition: Decomposition,
        ghost_width: usize,
    ) -> PicResult<Self> {
        let n = grid.dims();
        let p = topology.dims();
        for axis in 0..3 {
            let a = AXES[axis];
            if n[axis] == 0 {
                return Err(PicError::config(format!("n{a} must be positive")));
            }
            if p[axis] == 0 {
                return Err(PicError::config(format!("p{a} must be positive")));
            }
            if p[axis] > n[axis] {
                return Err(PicError::config(format!(
                    "cannot split n{a}={} cells across p{a}={} ranks",
                    n[axis], p[axis]
                )));
            }
            if decomposition == Decomposition::Uniform && n[axis] % p[axis] != 0 {
                return Err(PicError::config(format!(
                    "n{a}={} is not divisible by p{a}={} under a uniform decomposition",
                    n[axis], p[axis]
                )));
            }
        }
        if rank >= topology.ranks() {
            return Err(PicError::config(format!(
                "rank {rank} outside of a {}x{}x{} process grid",
                p[0], p[1], p[2]
            )));
        }

        let coords = topology.coords_of(rank);
        let mut start = [0; 3];
        let mut cells = [0; 3];
        for axis in 0..3 {
            let (s, c) = local_extent(n[axis], p[axis], coords[axis])?;
            start[axis] = s;
            cells[axis] = c;
        }
        Ok(Self {
            grid,
            topology,
            rank,
            coords,
            start,
            cells,
            ghost_width,
        })
    }

    /// Fails unless the communicator holds exactly one rank per subdomain.
    pub fn check_comm_size(&self, comm_size: usize) -> PicResult<()> {
        if comm_size != self.topology.ranks() {
            return Err(PicError::config(format!(
                "communicator has {comm_size} ranks but the topology needs {}",
                self.topology.ranks()
            )));
        }
        Ok(())
    }

    pub fn grid(&self) -> GlobalGrid {
        self.grid
    }

    pub fn topology(&self) -> ProcessTopology {
        self.topology
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    /// `{ix, iy, iz}`.
    pub fn coords(&self) -> [usize; 3] {
        self.coords
    }

    /// `{tx, ty, tz}`: owned cells without ghosts.
    pub fn local_cells(&self) -> [usize; 3] {
        self.cells
    }

    /// First owned cell in global indices.
    pub fn offset(&self) -> [usize; 3] {
        self.start
    }

    pub fn ghost_width(&self) -> usize {
        self.ghost_width
    }

    pub fn spans_multiple_ranks(&self, axis: usize) -> bool {
        self.topology.dims()[axis] > 1
    }

    pub fn is_lower_boundary(&self, axis: usize) -> bool {
        self.coords[axis] == 0
    }

    pub fn has_lower_neighbor(&self, axis: usize) -> bool {
        self.coords[axis] > 0
    }

    pub fn has_upper_neighbor(&self, axis: usize) -> bool {
        self.coords[axis] + 1 < self.topology.dims()[axis]
    }

    pub fn lower_ghost(&self) -> [usize; 3] {
        let mut g = [0; 3];
        for (axis, g) in g.iter_mut().enumerate() {
            if self.has_lower_neighbor(axis) {
                *g = self.ghost_width;
            }
        }
        g
    }

    pub fn upper_ghost(&self) -> [usize; 3] {
        let mut g = [0; 3];
        for (axis, g) in g.iter_mut().enumerate() {
            if self.has_upper_neighbor(axis) {
                *g = self.ghost_width;
            }
        }
        g
    }

    /// Owned cells plus ghost layers on the sides shared with a neighbor.
    pub fn ghosted_shape(&self) -> [usize; 3] {
        let lo = self.lower_ghost();
        let hi = self.upper_ghost();
        [
            self.cells[0] + lo[0] + hi[0],
            self.cells[1] + lo[1] + hi[1],
            self.cells[2] + lo[2] + hi[2],
        ]
    }

    pub fn layout(&self) -> PicResult<SubarrayLayout> {
        SubarrayLayout::build(
            self.grid.dims(),
            self.ghosted_shape(),
            self.start,
            self.lower_ghost(),
        )
    }
}
