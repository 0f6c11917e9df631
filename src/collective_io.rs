//! Collective reads and writes of ghosted subarrays in shared flat files.
//!
//! Each rank owns one `CollectiveIo`. Reads and writes end on a communicator
//! barrier, and a rank whose local part failed still reaches that barrier
//! before reporting, so the rest of the group is never left waiting.
//!
//! Open files live in a path -> handle registry: opening a path that is already
//! open hands back the existing handle instead of opening the file again.

use crate::comm::Communicator;
use crate::error::{PicError, PicResult};
use crate::layout::{Real, SubarrayLayout};
use bytemuck::{cast_slice, cast_slice_mut};
use log::{debug, trace};
use memmap2::{Mmap, MmapOptions};
use ndarray::Array3;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    /// Read and write; the file is created if missing and never truncated.
    ReadWrite,
}

/// Opaque reference to an open file in a `CollectiveIo` registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(usize);

#[derive(Debug)]
enum Backing {
    Mapped(Mmap),
    Writable(File),
}

#[derive(Debug)]
struct OpenFile {
    path: PathBuf,
    mode: AccessMode,
    backing: Backing,
}

impl OpenFile {
    fn len(&self) -> PicResult<u64> {
        match &self.backing {
            Backing::Mapped(m) => Ok(m.len() as u64),
            Backing::Writable(f) => Ok(f.metadata()?.len()),
        }
    }
}

#[derive(Debug)]
pub struct CollectiveIo<C: Communicator> {
    comm: C,
    files: HashMap<Handle, OpenFile>,
    by_path: HashMap<PathBuf, Handle>,
    next_id: usize,
    open_calls: usize,
}

impl<C: Communicator> CollectiveIo<C> {
    pub fn new(comm: C) -> Self {
        Self {
            comm,
            files: HashMap::new(),
            by_path: HashMap::new(),
            next_id: 0,
            open_calls: 0,
        }
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    /// Number of files actually opened so far (reuses excluded).
    pub fn open_calls(&self) -> usize {
        self.open_calls
    }

    pub fn is_open(&self, handle: Handle) -> bool {
        self.files.contains_key(&handle)
    }

    /// Files currently held open.
    pub fn open_files(&self) -> usize {
        self.files.len()
    }

    pub fn handle_for(&self, path: &Path) -> Option<Handle> {
        self.by_path.get(path).copied()
    }

    pub fn path_of(&self, handle: Handle) -> Option<&Path> {
        self.files.get(&handle).map(|f| f.path.as_path())
    }

    pub fn open(&mut self, path: impl AsRef<Path>, mode: AccessMode) -> PicResult<Handle> {
        let path = path.as_ref();
        if let Some(&handle) = self.by_path.get(path) {
            if let Some(file) = self.files.get(&handle) {
                if mode == AccessMode::ReadWrite && file.mode == AccessMode::ReadOnly {
                    return Err(PicError::HandleState {
                        path: path.to_path_buf(),
                        reason: "already open read-only, cannot reuse for writing".to_string(),
                    });
                }
                trace!("reusing open handle for '{}'", path.display());
                return Ok(handle);
            }
        }

        let backing = match mode {
            AccessMode::ReadOnly => {
                let meta = std::fs::metadata(path).map_err(|_| PicError::missing(path, "", None))?;
                if meta.len() == 0 {
                    return Err(PicError::FileAccess {
                        path: path.to_path_buf(),
                        quantity: String::new(),
                        tindex: None,
                        reason: "file is empty".to_string(),
                    });
                }
                let file = File::open(path)?;
                // Field files are not modified while a run is post-processed.
                let map = unsafe { MmapOptions::new().map(&file)? };
                Backing::Mapped(map)
            }
            AccessMode::ReadWrite => Backing::Writable(
                OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(path)?,
            ),
        };
        self.open_calls += 1;
        let handle = Handle(self.next_id);
        self.next_id += 1;
        self.files.insert(
            handle,
            OpenFile {
                path: path.to_path_buf(),
                mode,
                backing,
            },
        );
        self.by_path.insert(path.to_path_buf(), handle);
        debug!(
            "rank {} opened '{}' ({:?})",
            self.comm.rank(),
            path.display(),
            mode
        );
        Ok(handle)
    }

    /// Closes `handle`. Returns `false` if it was already closed.
    pub fn close(&mut self, handle: Handle) -> PicResult<bool> {
        if handle.0 >= self.next_id {
            return Err(PicError::HandleState {
                path: PathBuf::new(),
                reason: format!("handle {} was never issued", handle.0),
            });
        }
        match self.files.remove(&handle) {
            Some(file) => {
                self.by_path.remove(&file.path);
                debug!("rank {} closed '{}'", self.comm.rank(), file.path.display());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn close_all(&mut self) {
        self.files.clear();
        self.by_path.clear();
    }

    /// Collective read of this rank's subarray at byte displacement `disp`.
    pub fn read<T: Real>(
        &self,
        handle: Handle,
        layout: &SubarrayLayout,
        disp: u64,
        buf: &mut Array3<T>,
    ) -> PicResult<()> {
        let result = self.read_local(handle, layout, disp, buf);
        self.comm.barrier();
        result
    }

    /// Collective write of this rank's subarray at byte displacement `disp`.
    pub fn write<T: Real>(
        &self,
        handle: Handle,
        layout: &SubarrayLayout,
        disp: u64,
        buf: &Array3<T>,
    ) -> PicResult<()> {
        let result = self.write_local(handle, layout, disp, buf);
        self.comm.barrier();
        result
    }

    fn slot(&self, handle: Handle) -> PicResult<&OpenFile> {
        match self.files.get(&handle) {
            Some(file) => Ok(file),
            None if handle.0 < self.next_id => Err(PicError::HandleState {
                path: PathBuf::new(),
                reason: format!("handle {} is closed", handle.0),
            }),
            None => Err(PicError::HandleState {
                path: PathBuf::new(),
                reason: format!("handle {} was never issued", handle.0),
            }),
        }
    }

    fn io_error(&self, file: &OpenFile, disp: u64, reason: impl Into<String>) -> PicError {
        PicError::CollectiveIo {
            path: file.path.clone(),
            rank: self.comm.rank(),
            displacement: disp,
            reason: reason.into(),
        }
    }

    fn check_buffer(
        &self,
        file: &OpenFile,
        layout: &SubarrayLayout,
        disp: u64,
        shape: &[usize],
        fortran: bool,
    ) -> PicResult<()> {
        if shape != layout.local() {
            return Err(self.io_error(
                file,
                disp,
                format!("buffer shape {:?} does not match layout {:?}", shape, layout.local()),
            ));
        }
        if !fortran {
            return Err(self.io_error(file, disp, "buffer is not Fortran-contiguous"));
        }
        Ok(())
    }

    fn check_extent<T: Real>(&self, file: &OpenFile, layout: &SubarrayLayout, disp: u64) -> PicResult<()> {
        let needed = disp + layout.global_bytes::<T>();
        let len = file.len()?;
        if len < needed {
            return Err(self.io_error(
                file,
                disp,
                format!("file holds {len} bytes, snapshot needs {needed}"),
            ));
        }
        Ok(())
    }

    fn read_local<T: Real>(
        &self,
        handle: Handle,
        layout: &SubarrayLayout,
        disp: u64,
        buf: &mut Array3<T>,
    ) -> PicResult<()> {
        let file = self.slot(handle)?;
        let fortran = buf.t().is_standard_layout();
        self.check_buffer(file, layout, disp, buf.shape(), fortran)?;
        self.check_extent::<T>(file, layout, disp)?;
        let dst = buf
            .as_slice_memory_order_mut()
            .ok_or_else(|| self.io_error(file, disp, "buffer is not contiguous"))?;
        for (pos, range) in layout.byte_runs::<T>(disp) {
            let bytes: &mut [u8] = cast_slice_mut(&mut dst[range]);
            match &file.backing {
                Backing::Mapped(map) => {
                    let start = pos as usize;
                    bytes.copy_from_slice(&map[start..start + bytes.len()]);
                }
                Backing::Writable(f) => f
                    .read_exact_at(bytes, pos)
                    .map_err(|e| self.io_error(file, disp, e.to_string()))?,
            }
        }
        trace!(
            "rank {} read {} {} values from '{}'",
            self.comm.rank(),
            layout.local_len(),
            T::type_name(),
            file.path.display()
        );
        Ok(())
    }

    fn write_local<T: Real>(
        &self,
        handle: Handle,
        layout: &SubarrayLayout,
        disp: u64,
        buf: &Array3<T>,
    ) -> PicResult<()> {
        let file = self.slot(handle)?;
        let Backing::Writable(f) = &file.backing else {
            return Err(PicError::HandleState {
                path: file.path.clone(),
                reason: "write through a read-only handle".to_string(),
            });
        };
        let fortran = buf.t().is_standard_layout();
        self.check_buffer(file, layout, disp, buf.shape(), fortran)?;
        let src = buf
            .as_slice_memory_order()
            .ok_or_else(|| self.io_error(file, disp, "buffer is not contiguous"))?;
        for (pos, range) in layout.byte_runs::<T>(disp) {
            f.write_all_at(cast_slice(&src[range]), pos)
                .map_err(|e| self.io_error(file, disp, e.to_string()))?;
        }
        trace!(
            "rank {} wrote {} {} values to '{}'",
            self.comm.rank(),
            layout.local_len(),
            T::type_name(),
            file.path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SelfComm;
    use ndarray::ShapeBuilder;

    fn whole_grid(n: [usize; 3]) -> SubarrayLayout {
        SubarrayLayout::build(n, n, [0, 0, 0], [0, 0, 0]).unwrap()
    }

    #[test]
    fn missing_and_empty_files_are_access_errors() {
        let dir = tempfile::tempdir().unwrap();
        let mut io = CollectiveIo::new(SelfComm);
        let missing = io.open(dir.path().join("bx.gda"), AccessMode::ReadOnly);
        assert!(matches!(missing, Err(PicError::FileAccess { .. })));
        std::fs::write(dir.path().join("by.gda"), b"").unwrap();
        let empty = io.open(dir.path().join("by.gda"), AccessMode::ReadOnly);
        assert!(matches!(empty, Err(PicError::FileAccess { .. })));
        assert_eq!(io.open_calls(), 0);
    }

    #[test]
    fn reopening_a_path_reuses_the_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ne.gda");
        std::fs::write(&path, [0u8; 16]).unwrap();
        let mut io = CollectiveIo::new(SelfComm);
        let a = io.open(&path, AccessMode::ReadOnly).unwrap();
        let b = io.open(&path, AccessMode::ReadOnly).unwrap();
        assert_eq!(a, b);
        assert_eq!(io.open_calls(), 1);
        assert!(matches!(
            io.open(&path, AccessMode::ReadWrite),
            Err(PicError::HandleState { .. })
        ));
        assert!(io.close(a).unwrap());
        assert!(!io.close(b).unwrap());
        assert!(!io.is_open(a));
        assert!(io.handle_for(&path).is_none());
    }

    #[test]
    fn closed_files_leave_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        let mut io = CollectiveIo::new(SelfComm);
        let mut last = None;
        for t in 0..50 {
            let path = dir.path().join(format!("ni_{t}.gda"));
            std::fs::write(&path, [0u8; 8]).unwrap();
            let h = io.open(&path, AccessMode::ReadOnly).unwrap();
            assert_ne!(Some(h), last);
            assert_eq!(io.open_files(), 1);
            assert!(io.close(h).unwrap());
            last = Some(h);
        }
        assert_eq!(io.open_files(), 0);
        assert_eq!(io.open_calls(), 50);
        assert!(matches!(io.close(Handle(50)), Err(PicError::HandleState { .. })));
    }

    #[test]
    fn closed_handles_cannot_be_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ex.gda");
        let mut io = CollectiveIo::new(SelfComm);
        let h = io.open(&path, AccessMode::ReadWrite).unwrap();
        let layout = whole_grid([2, 2, 1]);
        let buf = Array3::<f32>::zeros((2, 2, 1).f());
        io.write(h, &layout, 0, &buf).unwrap();
        io.close(h).unwrap();
        let mut out = Array3::<f32>::zeros((2, 2, 1).f());
        assert!(matches!(
            io.read(h, &layout, 0, &mut out),
            Err(PicError::HandleState { .. })
        ));
    }

    #[test]
    fn write_then_read_single_rank() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jx.gda");
        let mut io = CollectiveIo::new(SelfComm);
        let layout = whole_grid([3, 2, 2]);
        let mut buf = Array3::<f64>::zeros((3, 2, 2).f());
        for (i, v) in buf.iter_mut().enumerate() {
            *v = i as f64 * 0.25;
        }
        let h = io.open(&path, AccessMode::ReadWrite).unwrap();
        io.write(h, &layout, layout.global_bytes::<f64>(), &buf).unwrap();
        io.close(h).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2 * 12 * 8);

        let h = io.open(&path, AccessMode::ReadOnly).unwrap();
        let mut out = Array3::<f64>::zeros((3, 2, 2).f());
        io.read(h, &layout, layout.global_bytes::<f64>(), &mut out).unwrap();
        assert_eq!(out, buf);
        // x is the fastest index on disk
        let raw = std::fs::read(&path).unwrap();
        let second: f64 = bytemuck::pod_read_unaligned(&raw[12 * 8 + 8..12 * 8 + 16]);
        assert_eq!(second, buf[[1, 0, 0]]);
    }

    #[test]
    fn short_files_and_bad_buffers_are_collective_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bz.gda");
        std::fs::write(&path, [0u8; 8]).unwrap();
        let mut io = CollectiveIo::new(SelfComm);
        let h = io.open(&path, AccessMode::ReadOnly).unwrap();
        let layout = whole_grid([2, 2, 2]);
        let mut buf = Array3::<f32>::zeros((2, 2, 2).f());
        assert!(matches!(
            io.read(h, &layout, 0, &mut buf),
            Err(PicError::CollectiveIo { .. })
        ));
        let mut wrong = Array3::<f32>::zeros((2, 2, 1).f());
        assert!(matches!(
            io.read(h, &layout, 0, &mut wrong),
            Err(PicError::CollectiveIo { .. })
        ));
        assert!(matches!(
            io.write(h, &layout, 0, &buf),
            Err(PicError::HandleState { .. })
        ));
    }
}
