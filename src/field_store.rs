//! Per-species store of field arrays for one timestep at a time.
//!
//! A driver typically does, per species and timestep:
//!
//! ```text
//! store.init(group); store.open(&mut io, group, Some(t))?;
//! store.read(&mut io, t)?; store.interpolate_emf_to_node()?;
//! ... analysis on store.component(..) ...
//! store.free(&mut io, group)?;
//! ```
//!
//! Groups are always visited in `FieldStore::GROUP_ORDER`, so every rank issues
//! its collective reads in the same sequence.

use crate::collective_io::{AccessMode, CollectiveIo, Handle};
use crate::comm::Communicator;
use crate::config::RunConfig;
use crate::domain::DomainDescriptor;
use crate::error::{PicError, PicResult};
use crate::field::{magnitude_into, AxisStencil, FieldArray};
use crate::layout::{Real, SubarrayLayout};
use crate::naming::{component_names, stem, FieldGroup, FileNaming, Species, StorageConvention};
use log::{debug, info, trace, warn};
use once_cell::unsync::OnceCell;
use std::collections::{HashMap, HashSet};

/// Arrays of one group, in file component order.
#[derive(Debug, Clone)]
pub struct ComponentSet<T> {
    names: Vec<String>,
    arrays: Vec<FieldArray<T>>,
}

impl<T: Real> ComponentSet<T> {
    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn arrays(&self) -> &[FieldArray<T>] {
        &self.arrays
    }

    pub fn get(&self, name: &str) -> Option<&FieldArray<T>> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| &self.arrays[i])
    }
}

/// Handles of one group. Empty under the multi-file convention, where files are
/// opened per timestep.
#[derive(Debug, Clone, Default)]
struct FileHandleSet {
    handles: Vec<Handle>,
}

#[derive(Debug)]
pub struct FieldStore<T: Real> {
    species: Species,
    domain: DomainDescriptor,
    layout: SubarrayLayout,
    naming: FileNaming,
    relativistic: bool,
    n_bands: usize,
    groups: HashMap<FieldGroup, ComponentSet<T>>,
    magnitude: Option<FieldArray<T>>,
    files: HashMap<FieldGroup, FileHandleSet>,
    velocity_prefix: OnceCell<char>,
    node_centered: HashSet<FieldGroup>,
}

impl<T: Real> FieldStore<T> {
    pub const GROUP_ORDER: [FieldGroup; 7] = [
        FieldGroup::Magnetic,
        FieldGroup::Electric,
        FieldGroup::Current,
        FieldGroup::Pressure,
        FieldGroup::Velocity,
        FieldGroup::NumberDensity,
        FieldGroup::EnergyBand,
    ];

    pub fn new(species: Species, domain: DomainDescriptor, naming: FileNaming) -> PicResult<Self> {
        let layout = domain.layout()?;
        Ok(Self {
            species,
            domain,
            layout,
            naming,
            relativistic: false,
            n_bands: 0,
            groups: HashMap::new(),
            magnitude: None,
            files: HashMap::new(),
            velocity_prefix: OnceCell::new(),
            node_centered: HashSet::new(),
        })
    }

    /// Fails unless `T` matches the configured sample precision.
    pub fn from_config(config: &RunConfig, species: Species, rank: usize) -> PicResult<Self> {
        let precision = config.output.precision;
        if precision.bytes() != std::mem::size_of::<T>() {
            return Err(PicError::config(format!(
                "run stores {precision:?} samples, store was built for {}",
                T::type_name()
            )));
        }
        Ok(Self::new(species, config.domain(rank)?, config.naming())?
            .with_relativistic(config.physics.relativistic)
            .with_energy_bands(config.physics.n_energy_bands))
    }

    /// Adds the three lower off-diagonal pressure components.
    pub fn with_relativistic(mut self, relativistic: bool) -> Self {
        self.relativistic = relativistic;
        self
    }

    pub fn with_energy_bands(mut self, n_bands: usize) -> Self {
        self.n_bands = n_bands;
        self
    }

    pub fn species(&self) -> Species {
        self.species
    }

    pub fn domain(&self) -> &DomainDescriptor {
        &self.domain
    }

    pub fn layout(&self) -> &SubarrayLayout {
        &self.layout
    }

    pub fn naming(&self) -> &FileNaming {
        &self.naming
    }

    pub fn is_relativistic(&self) -> bool {
        self.relativistic
    }

    pub fn energy_bands(&self) -> usize {
        self.n_bands
    }

    /// Resolved velocity file prefix (`'v'` or `'u'`), once the velocity group is open.
    pub fn velocity_prefix(&self) -> Option<char> {
        self.velocity_prefix.get().copied()
    }

    pub fn is_initialized(&self, group: FieldGroup) -> bool {
        self.groups.contains_key(&group)
    }

    pub fn is_open(&self, group: FieldGroup) -> bool {
        self.files.contains_key(&group)
    }

    pub fn group(&self, group: FieldGroup) -> Option<&ComponentSet<T>> {
        self.groups.get(&group)
    }

    pub fn component(&self, group: FieldGroup, name: &str) -> Option<&FieldArray<T>> {
        self.groups.get(&group).and_then(|set| set.get(name))
    }

    /// `[x, y, z]` of a vector group.
    pub fn vector(&self, group: FieldGroup) -> Option<[&FieldArray<T>; 3]> {
        let set = self.groups.get(&group)?;
        Some([set.get("x")?, set.get("y")?, set.get("z")?])
    }

    /// `|B|`, allocated with the magnetic group.
    pub fn magnitude(&self) -> Option<&FieldArray<T>> {
        self.magnitude.as_ref()
    }

    /// Energy-band fraction `band` (1-based).
    pub fn energy_band(&self, band: usize) -> Option<&FieldArray<T>> {
        self.component(FieldGroup::EnergyBand, &format!("{band:02}"))
    }

    pub(crate) fn component_mut(&mut self, group: FieldGroup, name: &str) -> Option<&mut FieldArray<T>> {
        let set = self.groups.get_mut(&group)?;
        let i = set.names.iter().position(|n| n == name)?;
        Some(&mut set.arrays[i])
    }

    /// Allocates zeroed arrays for `group`.
    pub fn init(&mut self, group: FieldGroup) {
        if self.groups.contains_key(&group) {
            warn!("{} {} already allocated", self.species, group);
            return;
        }
        let names = component_names(group, self.relativistic, self.n_bands);
        let arrays = names
            .iter()
            .map(|_| FieldArray::for_domain(&self.domain, &self.layout))
            .collect();
        if group == FieldGroup::Magnetic {
            self.magnitude = Some(FieldArray::for_domain(&self.domain, &self.layout));
        }
        debug!(
            "rank {}: allocated {} ({} components of {:?})",
            self.domain.rank(),
            group,
            names.len(),
            self.layout.local()
        );
        self.groups.insert(group, ComponentSet { names, arrays });
    }

    /// Releases exactly what `init(group)` allocated, closing the group's files first.
    pub fn free<C: Communicator>(&mut self, io: &mut CollectiveIo<C>, group: FieldGroup) -> PicResult<()> {
        self.close(io, group)?;
        self.node_centered.remove(&group);
        if self.groups.remove(&group).is_some() {
            debug!("rank {}: freed {}", self.domain.rank(), group);
        }
        if group == FieldGroup::Magnetic {
            self.magnitude = None;
        }
        Ok(())
    }

    fn stems_with(&self, group: FieldGroup, velocity_prefix: char) -> Vec<String> {
        component_names(group, self.relativistic, self.n_bands)
            .iter()
            .map(|c| stem(group, self.species, c, velocity_prefix))
            .collect()
    }

    fn stems(&self, group: FieldGroup) -> PicResult<Vec<String>> {
        let prefix = if group == FieldGroup::Velocity {
            *self.velocity_prefix.get().ok_or_else(|| {
                PicError::config(format!("{} velocity read before its files were opened", self.species))
            })?
        } else {
            'v'
        };
        Ok(self.stems_with(group, prefix))
    }

    /// Opens the files of `group`.
    ///
    /// Under the single-file convention the handles stay open until `close`.
    /// Under the multi-file convention only the velocity prefix is resolved
    /// here (against `tindex`, or the first dumped step); files are opened
    /// around each read.
    pub fn open<C: Communicator>(
        &mut self,
        io: &mut CollectiveIo<C>,
        group: FieldGroup,
        tindex: Option<usize>,
    ) -> PicResult<()> {
        if !self.groups.contains_key(&group) {
            return Err(PicError::config(format!(
                "{} {} opened before init",
                self.species, group
            )));
        }
        if self.files.contains_key(&group) {
            trace!("{} {} already open", self.species, group);
            return Ok(());
        }
        let probe_at = tindex.unwrap_or(self.naming.tindex_first);
        if group == FieldGroup::Velocity {
            let naming = &self.naming;
            let species = self.species;
            self.velocity_prefix
                .get_or_try_init(|| naming.velocity_prefix(species, probe_at))?;
        }
        let mut set = FileHandleSet::default();
        if self.naming.storage == StorageConvention::SingleFile {
            for s in self.stems(group)? {
                let path = self.naming.path(&s, probe_at);
                let handle = io
                    .open(&path, AccessMode::ReadOnly)
                    .map_err(|e| e.with_quantity(&s, tindex))?;
                set.handles.push(handle);
            }
        }
        info!(
            "rank {}: opened {} {} ({} files)",
            self.domain.rank(),
            self.species,
            group,
            set.handles.len()
        );
        self.files.insert(group, set);
        Ok(())
    }

    pub fn close<C: Communicator>(&mut self, io: &mut CollectiveIo<C>, group: FieldGroup) -> PicResult<()> {
        if let Some(set) = self.files.remove(&group) {
            for h in set.handles {
                io.close(h)?;
            }
            debug!("rank {}: closed {} {}", self.domain.rank(), self.species, group);
        }
        if group == FieldGroup::Velocity {
            self.velocity_prefix.take();
        }
        Ok(())
    }

    /// Reads every open group at `tindex`.
    pub fn read<C: Communicator>(&mut self, io: &mut CollectiveIo<C>, tindex: usize) -> PicResult<()> {
        for group in Self::GROUP_ORDER {
            if self.files.contains_key(&group) {
                self.read_group(io, group, tindex)?;
            }
        }
        Ok(())
    }

    /// One collective read per component of `group`; `|B|` is rebuilt after
    /// every magnetic read.
    pub fn read_group<C: Communicator>(
        &mut self,
        io: &mut CollectiveIo<C>,
        group: FieldGroup,
        tindex: usize,
    ) -> PicResult<()> {
        let Some(set) = self.files.get(&group).cloned() else {
            return Err(PicError::config(format!(
                "{} {} read before open",
                self.species, group
            )));
        };
        let stems = self.stems(group)?;
        let disp = self
            .naming
            .displacement(self.layout.global_bytes::<T>(), tindex)?;
        let layout = self.layout.clone();
        let ghosts = layout.lower_ghost();
        let names = component_names(group, self.relativistic, self.n_bands);
        for (i, (s, name)) in stems.iter().zip(names.iter()).enumerate() {
            let (handle, transient) = match set.handles.get(i) {
                Some(&h) => (h, false),
                None => {
                    let path = self.naming.path(s, tindex);
                    let was_open = io.handle_for(&path).is_some();
                    let h = io
                        .open(&path, AccessMode::ReadOnly)
                        .map_err(|e| e.with_quantity(s, Some(tindex)))?;
                    (h, !was_open)
                }
            };
            let array = self
                .component_mut(group, name)
                .ok_or_else(|| PicError::config(format!("{group} component '{name}' not allocated")))?;
            let result = io.read(handle, &layout, disp, array.data_mut());
            array.restore_ghosts(ghosts);
            if transient {
                io.close(handle)?;
            }
            result.map_err(|e| e.with_quantity(s, Some(tindex)))?;
        }
        self.node_centered.remove(&group);
        if group == FieldGroup::Magnetic {
            self.update_magnitude();
        }
        trace!(
            "rank {}: read {} {} at tindex {tindex}",
            self.domain.rank(),
            self.species,
            group
        );
        Ok(())
    }

    /// Collective write of `group` at `tindex`, creating files as needed.
    /// Files already open in `io` are written through and left open.
    pub fn write_group<C: Communicator>(
        &self,
        io: &mut CollectiveIo<C>,
        group: FieldGroup,
        tindex: usize,
    ) -> PicResult<()> {
        let set = self
            .groups
            .get(&group)
            .ok_or_else(|| PicError::config(format!("{} {} written before init", self.species, group)))?;
        if set.arrays.iter().any(|a| a.lower_ghost() != self.layout.lower_ghost()) {
            return Err(PicError::config(format!(
                "{} {} was shifted; only ghosted buffers can be written",
                self.species, group
            )));
        }
        let disp = self
            .naming
            .displacement(self.layout.global_bytes::<T>(), tindex)?;
        // velocity is written classically unless a 4-velocity prefix was resolved
        let prefix = self.velocity_prefix().unwrap_or('v');
        for (s, array) in self.stems_with(group, prefix).iter().zip(set.arrays.iter()) {
            let path = self.naming.path(s, tindex);
            let was_open = io.handle_for(&path).is_some();
            let h = io.open(&path, AccessMode::ReadWrite)?;
            let result = io.write(h, &self.layout, disp, array.data());
            if !was_open {
                io.close(h)?;
            }
            result.map_err(|e| e.with_quantity(s, Some(tindex)))?;
        }
        Ok(())
    }

    fn update_magnitude(&mut self) {
        let Some(set) = self.groups.get(&FieldGroup::Magnetic) else {
            return;
        };
        let (Some(bx), Some(by), Some(bz), Some(m)) =
            (set.get("x"), set.get("y"), set.get("z"), self.magnitude.as_mut())
        else {
            return;
        };
        magnitude_into(m, bx, by, bz);
    }

    /// Drops the lower ghost layers of every array in `group`.
    pub fn shift(&mut self, group: FieldGroup) {
        if let Some(set) = self.groups.get_mut(&group) {
            for a in set.arrays.iter_mut() {
                a.shift();
            }
        }
        if group == FieldGroup::Magnetic {
            if let Some(m) = self.magnitude.as_mut() {
                m.shift();
            }
        }
    }

    fn stencils(&self) -> [AxisStencil; 3] {
        [
            AxisStencil::classify(&self.domain, 0),
            AxisStencil::classify(&self.domain, 1),
            AxisStencil::classify(&self.domain, 2),
        ]
    }

    /// Moves E and B from their staggered positions onto the grid nodes.
    ///
    /// E is centered along its own direction and shifted. Each B component is
    /// centered along its two transverse axes, `|B|` is rebuilt from the centered
    /// but still ghosted components, then all four are shifted. The centering
    /// reads ghost samples, so both groups must come straight from a read
    /// (or `init`), and a second call before the next read is refused.
    pub fn interpolate_emf_to_node(&mut self) -> PicResult<()> {
        let stencils = self.stencils();
        let ghosts = self.layout.lower_ghost();
        for group in [FieldGroup::Electric, FieldGroup::Magnetic] {
            if let Some(set) = self.groups.get(&group) {
                if self.node_centered.contains(&group) || set.arrays.iter().any(|a| a.lower_ghost() != ghosts) {
                    return Err(PicError::config(format!(
                        "{group} already centered or shifted; node-centering needs freshly read ghost layers"
                    )));
                }
            }
        }

        if self.groups.contains_key(&FieldGroup::Electric) {
            for (axis, name) in ["x", "y", "z"].iter().enumerate() {
                if let Some(e) = self.component_mut(FieldGroup::Electric, name) {
                    e.center_along(axis, stencils[axis]);
                }
            }
            self.shift(FieldGroup::Electric);
            self.node_centered.insert(FieldGroup::Electric);
        }

        if self.groups.contains_key(&FieldGroup::Magnetic) {
            // Bx over (y, z), By over (x, z), Bz over (x, y)
            for (name, axes) in [("x", [1, 2]), ("y", [0, 2]), ("z", [0, 1])] {
                if let Some(b) = self.component_mut(FieldGroup::Magnetic, name) {
                    for axis in axes {
                        b.center_along(axis, stencils[axis]);
                    }
                }
            }
            self.update_magnitude();
            self.shift(FieldGroup::Magnetic);
            self.node_centered.insert(FieldGroup::Magnetic);
        }
        debug!(
            "rank {}: EMF node-centered with stencils {:?}",
            self.domain.rank(),
            stencils
        );
        Ok(())
    }
}
