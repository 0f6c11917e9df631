//! Single-fluid bulk velocity from the two species' velocities and densities.
//!
//! ```text
//! v = (v_k w_k n_k + v_o w_o n_o) / (w_k n_k + w_o n_o)
//! ```
//!
//! with `w = mime` for ions and `1` for electrons. Cells where both densities
//! vanish come out as NaN.

use crate::collective_io::CollectiveIo;
use crate::comm::Communicator;
use crate::error::{PicError, PicResult};
use crate::field::FieldArray;
use crate::field_store::FieldStore;
use crate::layout::Real;
use crate::naming::{FieldGroup, Species};
use log::{debug, info};
use ndarray::Zip;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositionMode {
    /// `known` is already in memory; the other species is read here.
    OneKnown { known: Species },
    BothKnown,
}

/// Mass-ratio weight of a species.
pub fn species_weight(species: Species, mime: f64) -> f64 {
    match species {
        Species::Ion => mime,
        Species::Electron => 1.0,
    }
}

#[derive(Debug)]
pub struct SingleFluid<T: Real> {
    mode: CompositionMode,
    mime: f64,
    velocity: [FieldArray<T>; 3],
    density: FieldArray<T>,
    other: Option<FieldStore<T>>,
    composed: bool,
}

fn velocity_and_density<T: Real>(store: &FieldStore<T>) -> PicResult<([&FieldArray<T>; 3], &FieldArray<T>)> {
    let v = store.vector(FieldGroup::Velocity).ok_or_else(|| {
        PicError::config(format!("{} velocity is not allocated", store.species()))
    })?;
    let n = store.component(FieldGroup::NumberDensity, "").ok_or_else(|| {
        PicError::config(format!("{} number density is not allocated", store.species()))
    })?;
    Ok((v, n))
}

impl<T: Real> SingleFluid<T> {
    /// Starts from the species held by `known`; the other species gets its own
    /// store sharing `known`'s domain and naming.
    pub fn one_known(known: &FieldStore<T>, mime: f64) -> PicResult<Self> {
        let (v, n) = velocity_and_density(known)?;
        let species = known.species().other();
        let mut other = FieldStore::new(species, known.domain().clone(), known.naming().clone())?
            .with_relativistic(known.is_relativistic());
        other.init(FieldGroup::Velocity);
        other.init(FieldGroup::NumberDensity);
        Ok(Self {
            mode: CompositionMode::OneKnown {
                known: known.species(),
            },
            mime,
            velocity: [v[0].clone(), v[1].clone(), v[2].clone()],
            density: n.clone(),
            other: Some(other),
            composed: false,
        })
    }

    /// Composes immediately from two in-memory species.
    pub fn both_known(electron: &FieldStore<T>, ion: &FieldStore<T>, mime: f64) -> PicResult<Self> {
        if electron.species() != Species::Electron || ion.species() != Species::Ion {
            return Err(PicError::config(format!(
                "both-known composition expects (electron, ion), got ({}, {})",
                electron.species(),
                ion.species()
            )));
        }
        let (ve, ne) = velocity_and_density(electron)?;
        let (vi, ni) = velocity_and_density(ion)?;
        let mut fluid = Self {
            mode: CompositionMode::BothKnown,
            mime,
            velocity: [ve[0].clone(), ve[1].clone(), ve[2].clone()],
            density: ne.clone(),
            other: None,
            composed: false,
        };
        fluid.mix(vi, ni, 1.0, mime)?;
        Ok(fluid)
    }

    pub fn mode(&self) -> CompositionMode {
        self.mode
    }

    pub fn mime(&self) -> f64 {
        self.mime
    }

    pub fn is_composed(&self) -> bool {
        self.composed
    }

    /// Store holding the species read by `read_other`.
    pub fn other(&self) -> Option<&FieldStore<T>> {
        self.other.as_ref()
    }

    /// Replaces the known species' data, e.g. for the next timestep.
    pub fn load_known(&mut self, known: &FieldStore<T>) -> PicResult<()> {
        let CompositionMode::OneKnown { known: species } = self.mode else {
            return Err(PicError::config("both-known compositions have no known species to reload"));
        };
        if known.species() != species {
            return Err(PicError::config(format!(
                "composition was set up for {species}, got {}",
                known.species()
            )));
        }
        let (v, n) = velocity_and_density(known)?;
        for (dst, src) in self.velocity.iter_mut().zip(v) {
            dst.clone_from(src);
        }
        self.density.clone_from(n);
        self.composed = false;
        Ok(())
    }

    fn other_mut(&mut self) -> PicResult<&mut FieldStore<T>> {
        self.other
            .as_mut()
            .ok_or_else(|| PicError::config("both-known compositions read nothing"))
    }

    /// Opens the other species' velocity and density files; paths already open
    /// in `io` are reused.
    pub fn open_other<C: Communicator>(&mut self, io: &mut CollectiveIo<C>, tindex: Option<usize>) -> PicResult<()> {
        let other = self.other_mut()?;
        other.open(io, FieldGroup::Velocity, tindex)?;
        other.open(io, FieldGroup::NumberDensity, tindex)?;
        info!("opened {} velocity and density for single-fluid composition", other.species());
        Ok(())
    }

    pub fn read_other<C: Communicator>(&mut self, io: &mut CollectiveIo<C>, tindex: usize) -> PicResult<()> {
        let other = self.other_mut()?;
        other.read_group(io, FieldGroup::Velocity, tindex)?;
        other.read_group(io, FieldGroup::NumberDensity, tindex)
    }

    pub fn close_other<C: Communicator>(&mut self, io: &mut CollectiveIo<C>) -> PicResult<()> {
        let other = self.other_mut()?;
        other.close(io, FieldGroup::Velocity)?;
        other.close(io, FieldGroup::NumberDensity)
    }

    /// Mixes the known species with the one read by `read_other`.
    pub fn compose(&mut self) -> PicResult<()> {
        let CompositionMode::OneKnown { known } = self.mode else {
            return Err(PicError::config("both-known compositions are composed on construction"));
        };
        let w_k = species_weight(known, self.mime);
        let w_o = species_weight(known.other(), self.mime);
        let other = self.other.take().ok_or_else(|| PicError::config("no other-species store"))?;
        let result = velocity_and_density(&other).and_then(|(v, n)| self.mix(v, n, w_k, w_o));
        self.other = Some(other);
        result
    }

    fn mix(&mut self, v_o: [&FieldArray<T>; 3], n_o: &FieldArray<T>, w_k: f64, w_o: f64) -> PicResult<()> {
        if self.composed {
            return Err(PicError::config("single-fluid velocity already composed; reload the known species first"));
        }
        let ghosts = self.density.lower_ghost();
        let shape = self.density.shape();
        let mismatch = self
            .velocity
            .iter()
            .chain(v_o.iter().copied())
            .chain([n_o])
            .any(|a| a.lower_ghost() != ghosts || a.shape() != shape);
        if mismatch {
            return Err(PicError::config(
                "species arrays differ in shape or ghost state; shift both or neither",
            ));
        }

        let wk = T::lit(w_k);
        let wo = T::lit(w_o);
        let n_k = self.density.data();
        for (v, o) in self.velocity.iter_mut().zip(v_o) {
            Zip::from(v.data_mut())
                .and(n_k)
                .and(o.data())
                .and(n_o.data())
                .par_for_each(|v, &nk, &vo, &no| {
                    *v = (*v * wk * nk + vo * wo * no) / (wk * nk + wo * no);
                });
        }
        Zip::from(self.density.data_mut())
            .and(n_o.data())
            .par_for_each(|n, &no| *n = wk * *n + wo * no);
        self.composed = true;
        debug!("single-fluid velocity composed (w_k = {w_k}, w_o = {w_o})");
        Ok(())
    }

    /// Single-fluid velocity; before composition this is the known species' copy.
    pub fn velocity(&self) -> [&FieldArray<T>; 3] {
        [&self.velocity[0], &self.velocity[1], &self.velocity[2]]
    }

    /// Mass density `w_k n_k + w_o n_o` once composed.
    pub fn density(&self) -> &FieldArray<T> {
        &self.density
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SelfComm;
    use crate::domain::{Decomposition, DomainDescriptor, GlobalGrid, ProcessTopology};
    use crate::naming::{FileNaming, StorageConvention};

    fn filled(dir: &std::path::Path, species: Species, v: [f32; 3], n: f32) -> FieldStore<f32> {
        let domain = DomainDescriptor::new(
            GlobalGrid::new(3, 2, 2),
            ProcessTopology::new(1, 1, 1),
            0,
            Decomposition::Remainder,
            1,
        )
        .unwrap();
        let mut s = FieldStore::new(species, domain, FileNaming::new(dir, StorageConvention::SingleFile)).unwrap();
        s.init(FieldGroup::Velocity);
        s.init(FieldGroup::NumberDensity);
        for (name, value) in ["x", "y", "z"].iter().zip(v) {
            s.component_mut(FieldGroup::Velocity, name).unwrap().fill(value);
        }
        s.component_mut(FieldGroup::NumberDensity, "").unwrap().fill(n);
        s
    }

    #[test]
    fn empty_electrons_give_the_ion_velocity() {
        let dir = tempfile::tempdir().unwrap();
        let e = filled(dir.path(), Species::Electron, [3.0, -1.0, 7.0], 0.0);
        let i = filled(dir.path(), Species::Ion, [0.5, -0.25, 2.0], 2.0);
        let fluid = SingleFluid::both_known(&e, &i, 25.0).unwrap();
        let [vx, vy, vz] = fluid.velocity();
        assert!(vx.data().iter().all(|&v| v == 0.5));
        assert!(vy.data().iter().all(|&v| v == -0.25));
        assert!(vz.data().iter().all(|&v| v == 2.0));
        assert!(fluid.density().data().iter().all(|&n| n == 50.0));
    }

    #[test]
    fn vacuum_cells_are_nan() {
        let dir = tempfile::tempdir().unwrap();
        let e = filled(dir.path(), Species::Electron, [1.0, 1.0, 1.0], 0.0);
        let i = filled(dir.path(), Species::Ion, [1.0, 1.0, 1.0], 0.0);
        let fluid = SingleFluid::both_known(&e, &i, 100.0).unwrap();
        assert!(fluid.velocity()[0].data().iter().all(|v| v.is_nan()));
    }

    #[test]
    fn species_order_is_checked() {
        let dir = tempfile::tempdir().unwrap();
        let e = filled(dir.path(), Species::Electron, [0.0; 3], 1.0);
        let i = filled(dir.path(), Species::Ion, [0.0; 3], 1.0);
        assert!(SingleFluid::both_known(&i, &e, 1.0).is_err());
    }

    #[test]
    fn one_known_reads_the_other_species() {
        let dir = tempfile::tempdir().unwrap();
        let mut io = CollectiveIo::new(SelfComm);
        let ion = filled(dir.path(), Species::Ion, [1.0, 0.0, 4.0], 1.0);
        ion.write_group(&mut io, FieldGroup::Velocity, 0).unwrap();
        ion.write_group(&mut io, FieldGroup::NumberDensity, 0).unwrap();

        let e = filled(dir.path(), Species::Electron, [2.0, 3.0, -4.0], 3.0);
        let mut fluid = SingleFluid::one_known(&e, 5.0).unwrap();
        assert_eq!(fluid.mode(), CompositionMode::OneKnown { known: Species::Electron });
        fluid.open_other(&mut io, Some(0)).unwrap();
        fluid.read_other(&mut io, 0).unwrap();
        fluid.compose().unwrap();
        let [vx, vy, vz] = fluid.velocity();
        assert!(vx.data().iter().all(|&v| v == 1.375));
        assert!(vy.data().iter().all(|&v| v == 1.125));
        assert!(vz.data().iter().all(|&v| v == 1.0));
        assert!(fluid.density().data().iter().all(|&n| n == 8.0));
        assert_eq!(fluid.other().unwrap().velocity_prefix(), Some('v'));

        assert!(fluid.compose().is_err());
        fluid.load_known(&e).unwrap();
        fluid.compose().unwrap();
        assert!(fluid.velocity()[0].data().iter().all(|&v| v == 1.375));
        fluid.close_other(&mut io).unwrap();
        assert!(fluid.load_known(&ion).is_err());
    }

    #[test]
    fn both_known_cannot_be_composed_again() {
        let dir = tempfile::tempdir().unwrap();
        let e = filled(dir.path(), Species::Electron, [0.0; 3], 1.0);
        let i = filled(dir.path(), Species::Ion, [0.0; 3], 1.0);
        let mut fluid = SingleFluid::both_known(&e, &i, 1.0).unwrap();
        assert!(fluid.compose().is_err());
        let mut io = CollectiveIo::new(SelfComm);
        assert!(fluid.read_other(&mut io, 0).is_err());
    }

    #[test]
    fn shifted_and_ghosted_arrays_do_not_mix() {
        let dir = tempfile::tempdir().unwrap();
        let domain = DomainDescriptor::new(
            GlobalGrid::new(4, 2, 2),
            ProcessTopology::new(2, 1, 1),
            1,
            Decomposition::Remainder,
            1,
        )
        .unwrap();
        let naming = FileNaming::new(dir.path(), StorageConvention::SingleFile);
        let mut e = FieldStore::<f64>::new(Species::Electron, domain.clone(), naming.clone()).unwrap();
        let mut i = FieldStore::<f64>::new(Species::Ion, domain, naming).unwrap();
        for s in [&mut e, &mut i] {
            s.init(FieldGroup::Velocity);
            s.init(FieldGroup::NumberDensity);
        }
        e.shift(FieldGroup::Velocity);
        e.shift(FieldGroup::NumberDensity);
        assert!(matches!(
            SingleFluid::both_known(&e, &i, 1.0),
            Err(PicError::Configuration(_))
        ));
    }
}
