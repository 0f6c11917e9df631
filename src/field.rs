//! Ghost-padded 3D sample arrays and the two grid-consistency transforms:
//! ghost shifting and node-centering along one axis.

use crate::domain::DomainDescriptor;
use crate::layout::{Real, SubarrayLayout};
use ndarray::{s, Array3, ArrayView3, ArrayViewMut1, Axis, ShapeBuilder, Zip};

/// Fortran-ordered field samples of one component on one rank.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldArray<T> {
    data: Array3<T>,
    lower_ghost: [usize; 3],
    owned: [usize; 3],
}

impl<T: Real> FieldArray<T> {
    pub fn zeros(layout: &SubarrayLayout, owned: [usize; 3]) -> Self {
        let [lx, ly, lz] = layout.local();
        Self {
            data: Array3::zeros((lx, ly, lz).f()),
            lower_ghost: layout.lower_ghost(),
            owned,
        }
    }

    pub fn for_domain(domain: &DomainDescriptor, layout: &SubarrayLayout) -> Self {
        Self::zeros(layout, domain.local_cells())
    }

    pub fn data(&self) -> &Array3<T> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array3<T> {
        &mut self.data
    }

    pub fn shape(&self) -> [usize; 3] {
        let d = self.data.dim();
        [d.0, d.1, d.2]
    }

    /// Ghost layers still sitting in front of the owned cells.
    pub fn lower_ghost(&self) -> [usize; 3] {
        self.lower_ghost
    }

    pub fn is_shifted(&self) -> bool {
        self.lower_ghost == [0, 0, 0]
    }

    /// Owned cells only, wherever the ghost state currently puts them.
    pub fn owned(&self) -> ArrayView3<'_, T> {
        let [gx, gy, gz] = self.lower_ghost;
        let [nx, ny, nz] = self.owned;
        self.data
            .slice(s![gx..gx + nx, gy..gy + ny, gz..gz + nz])
    }

    /// A fresh read refills the whole ghosted buffer.
    pub(crate) fn restore_ghosts(&mut self, lower_ghost: [usize; 3]) {
        self.lower_ghost = lower_ghost;
    }

    pub fn fill(&mut self, value: T) {
        self.data.fill(value);
    }

    /// Drops the lower ghost layer along every axis that has one, in x, y, z
    /// order, by moving `[g:n)` onto `[0:n-g)`. The tail keeps stale copies.
    pub fn shift(&mut self) {
        for axis in 0..3 {
            let g = self.lower_ghost[axis];
            let n = self.data.len_of(Axis(axis));
            if g == 0 || n <= g {
                continue;
            }
            for mut lane in self.data.lanes_mut(Axis(axis)) {
                for k in 0..n - g {
                    lane[k] = lane[k + g];
                }
            }
            self.lower_ghost[axis] = 0;
        }
    }

    /// Moves samples sitting half a cell above the nodes along `axis` onto the nodes.
    pub fn center_along(&mut self, axis: usize, stencil: AxisStencil) {
        if stencil == AxisStencil::Unchanged {
            return;
        }
        for mut lane in self.data.lanes_mut(Axis(axis)) {
            stencil.apply(&mut lane);
        }
    }
}

/// Boundary situation of one rank along one axis, which decides which samples
/// are valid inputs for node-centering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisStencil {
    /// A lower neighbor exists: average with the sample below, reading the ghost.
    Interior,
    /// Global lower boundary with several local cells: average the interior,
    /// extrapolate the first node linearly.
    LowerBoundary,
    /// Global lower boundary with a single local cell while the axis is split
    /// over several ranks: the only partner sample is the neighbor's ghost copy.
    Degenerate,
    /// Single cell, single rank: the axis is collapsed and already on the node.
    Unchanged,
}

impl AxisStencil {
    pub fn classify(domain: &DomainDescriptor, axis: usize) -> Self {
        if domain.has_lower_neighbor(axis) {
            AxisStencil::Interior
        } else if domain.local_cells()[axis] > 1 {
            AxisStencil::LowerBoundary
        } else if domain.spans_multiple_ranks(axis) {
            AxisStencil::Degenerate
        } else {
            AxisStencil::Unchanged
        }
    }

    fn apply<T: Real>(self, lane: &mut ArrayViewMut1<'_, T>) {
        let n = lane.len();
        let half = T::lit(0.5);
        match self {
            AxisStencil::Interior => {
                // top-down so lane[k - 1] is still the raw sample
                for k in (1..n).rev() {
                    lane[k] = half * (lane[k] + lane[k - 1]);
                }
            }
            AxisStencil::LowerBoundary => {
                if n < 2 {
                    return;
                }
                let first = T::lit(1.5) * lane[0] - half * lane[1];
                for k in (1..n).rev() {
                    lane[k] = half * (lane[k] + lane[k - 1]);
                }
                lane[0] = first;
            }
            AxisStencil::Degenerate => {
                if n < 2 {
                    return;
                }
                let own = lane[0];
                let neighbor = lane[1];
                for k in (2..n).rev() {
                    lane[k] = half * (lane[k] + lane[k - 1]);
                }
                lane[1] = half * (neighbor + own);
                lane[0] = T::lit(1.5) * own - half * neighbor;
            }
            AxisStencil::Unchanged => {}
        }
    }
}

/// `|B|` over every cell of the buffers, ghosts included.
pub fn magnitude_into<T: Real>(
    out: &mut FieldArray<T>,
    x: &FieldArray<T>,
    y: &FieldArray<T>,
    z: &FieldArray<T>,
) {
    Zip::from(&mut out.data)
        .and(&x.data)
        .and(&y.data)
        .and(&z.data)
        .par_for_each(|m, &a, &b, &c| *m = (a * a + b * b + c * c).sqrt());
    out.lower_ghost = x.lower_ghost;
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array1;

    fn layout(local: [usize; 3], offset: [usize; 3], ghost: [usize; 3]) -> SubarrayLayout {
        SubarrayLayout::build([16, 16, 16], local, offset, ghost).unwrap()
    }

    fn apply(stencil: AxisStencil, values: &[f64]) -> Vec<f64> {
        let mut a = Array1::from(values.to_vec());
        stencil.apply(&mut a.view_mut());
        a.to_vec()
    }

    #[test]
    fn interior_averages_with_the_ghost() {
        // samples at x+1/2 of f(x) = 2x, ghost first
        assert_eq!(apply(AxisStencil::Interior, &[7.0, 9.0, 11.0, 13.0]), vec![7.0, 8.0, 10.0, 12.0]);
    }

    #[test]
    fn lower_boundary_extrapolates_the_first_node() {
        assert_eq!(apply(AxisStencil::LowerBoundary, &[1.0, 3.0, 5.0]), vec![0.0, 2.0, 4.0]);
    }

    #[test]
    fn degenerate_uses_the_neighbor_sample() {
        assert_eq!(apply(AxisStencil::Degenerate, &[1.0, 3.0]), vec![0.0, 2.0]);
        assert_eq!(apply(AxisStencil::Degenerate, &[5.0]), vec![5.0]);
    }

    #[test]
    fn unchanged_is_a_no_op() {
        let l = layout([1, 1, 1], [0, 0, 0], [0, 0, 0]);
        let mut f = FieldArray::<f64>::zeros(&l, [1, 1, 1]);
        f.fill(3.0);
        f.center_along(0, AxisStencil::Unchanged);
        assert_eq!(f.data()[[0, 0, 0]], 3.0);
    }

    #[test]
    fn shift_only_moves_axes_with_a_lower_ghost() {
        let l = layout([4, 3, 1], [5, 0, 0], [1, 0, 0]);
        let mut f = FieldArray::<f32>::zeros(&l, [3, 2, 1]);
        for ((i, j, _), v) in f.data_mut().indexed_iter_mut() {
            *v = (10 * i + j) as f32;
        }
        let before_owned = f.owned().to_owned();
        f.shift();
        assert!(f.is_shifted());
        assert_eq!(f.owned(), before_owned);
        // y had no lower ghost: untouched
        assert_eq!(f.data()[[0, 2, 0]], 12.0);
        assert_eq!(f.data()[[2, 1, 0]], 31.0);
        // tail keeps a stale copy
        assert_eq!(f.data()[[3, 0, 0]], 30.0);
    }

    #[test]
    fn shift_without_lower_ghosts_changes_nothing() {
        let l = layout([4, 4, 4], [0, 0, 0], [0, 0, 0]);
        let mut f = FieldArray::<f64>::zeros(&l, [3, 3, 3]);
        for (n, v) in f.data_mut().iter_mut().enumerate() {
            *v = n as f64;
        }
        let before = f.clone();
        f.shift();
        assert_eq!(f, before);
    }

    #[test]
    fn magnitude_covers_ghosts() {
        let l = layout([2, 2, 2], [1, 1, 1], [1, 1, 1]);
        let mut bx = FieldArray::<f64>::zeros(&l, [1, 1, 1]);
        let mut by = bx.clone();
        let bz = bx.clone();
        bx.fill(3.0);
        by.fill(4.0);
        let mut m = bx.clone();
        m.fill(0.0);
        magnitude_into(&mut m, &bx, &by, &bz);
        assert!(m.data().iter().all(|&v| v == 5.0));
    }
}
