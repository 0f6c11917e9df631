//! Typed subarray layout: how a rank's ghosted buffer maps into the flat,
//! Fortran-ordered (x fastest) global array stored on disk.

use crate::error::{PicError, PicResult};
use bytemuck::Pod;
use num_traits::Float;
use std::fmt::{Debug, Display};

/// Sample type stored in field files.
pub trait Real: Float + Pod + Default + Debug + Display + Send + Sync + 'static {
    fn type_name() -> &'static str;
    fn lit(v: f64) -> Self;
    fn as_f64(self) -> f64;
}

impl Real for f32 {
    fn type_name() -> &'static str {
        "f32"
    }
    fn lit(v: f64) -> Self {
        v as f32
    }
    fn as_f64(self) -> f64 {
        self as f64
    }
}

impl Real for f64 {
    fn type_name() -> &'static str {
        "f64"
    }
    fn lit(v: f64) -> Self {
        v
    }
    fn as_f64(self) -> f64 {
        self
    }
}

/// One contiguous x-run: `len` elements starting at `file_elem` in the global
/// array and at `buf_elem` in the local buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub file_elem: usize,
    pub buf_elem: usize,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubarrayLayout {
    global: [usize; 3],
    local: [usize; 3],
    offset: [usize; 3],
    lower_ghost: [usize; 3],
}

impl SubarrayLayout {
    /// `local` is the ghosted buffer shape, `offset` the first owned cell and
    /// `lower_ghost` the ghost layers in front of it (0 at a lower boundary).
    pub fn build(
        global: [usize; 3],
        local: [usize; 3],
        offset: [usize; 3],
        lower_ghost: [usize; 3],
    ) -> PicResult<Self> {
        for axis in 0..3 {
            if local[axis] == 0 || global[axis] == 0 {
                return Err(PicError::config(format!(
                    "empty layout along axis {axis}: local {:?}, global {:?}",
                    local, global
                )));
            }
            if lower_ghost[axis] > offset[axis] {
                return Err(PicError::config(format!(
                    "lower ghost {} reaches before the grid at offset {} (axis {axis})",
                    lower_ghost[axis], offset[axis]
                )));
            }
            if offset[axis] - lower_ghost[axis] + local[axis] > global[axis] {
                return Err(PicError::config(format!(
                    "subarray {:?}+{:?} exceeds global grid {:?} along axis {axis}",
                    offset, local, global
                )));
            }
        }
        Ok(Self {
            global,
            local,
            offset,
            lower_ghost,
        })
    }

    pub fn global(&self) -> [usize; 3] {
        self.global
    }

    /// Ghosted buffer shape.
    pub fn local(&self) -> [usize; 3] {
        self.local
    }

    pub fn offset(&self) -> [usize; 3] {
        self.offset
    }

    pub fn lower_ghost(&self) -> [usize; 3] {
        self.lower_ghost
    }

    /// First global cell covered by the buffer, ghosts included.
    pub fn start(&self) -> [usize; 3] {
        [
            self.offset[0] - self.lower_ghost[0],
            self.offset[1] - self.lower_ghost[1],
            self.offset[2] - self.lower_ghost[2],
        ]
    }

    pub fn local_len(&self) -> usize {
        self.local.iter().product()
    }

    pub fn global_len(&self) -> usize {
        self.global.iter().product()
    }

    /// Bytes taken by one full global snapshot of a `T` field.
    pub fn global_bytes<T: Real>(&self) -> u64 {
        (self.global_len() * std::mem::size_of::<T>()) as u64
    }

    pub fn runs(&self) -> impl Iterator<Item = Run> + '_ {
        let [gx, gy, _] = self.global;
        let [lx, ly, lz] = self.local;
        let [sx, sy, sz] = self.start();
        (0..lz).flat_map(move |z| {
            (0..ly).map(move |y| Run {
                file_elem: sx + gx * ((sy + y) + gy * (sz + z)),
                buf_elem: lx * (y + ly * z),
                len: lx,
            })
        })
    }

    /// Same runs in bytes, displaced by `disp`.
    pub fn byte_runs<T: Real>(&self, disp: u64) -> impl Iterator<Item = (u64, std::ops::Range<usize>)> + '_ {
        let size = std::mem::size_of::<T>();
        self.runs().map(move |r| {
            (
                disp + (r.file_elem * size) as u64,
                r.buf_elem..r.buf_elem + r.len,
            )
        })
    }
}
