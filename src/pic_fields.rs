/*
File: pic_fields.rs
Copyright (C) 2025 the pic_fields authors
This program is free software; you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation; either version 2 of the License, or
(at your option) any later version.

Post-processing core for PIC field dumps: every rank reads its own ghosted
block of the flat Fortran-ordered field files, moves E and B onto the grid
nodes, and derives single-fluid quantities and particle spectra.

EXAMPLES:
    let config = RunConfig::from_file("run.toml")?;
    let mut io = CollectiveIo::new(comm);
    let mut store = FieldStore::<f32>::from_config(&config, Species::Electron, io.comm().rank())?;
    store.init(FieldGroup::Magnetic);
    store.init(FieldGroup::Electric);
    store.open(&mut io, FieldGroup::Magnetic, None)?;
    store.open(&mut io, FieldGroup::Electric, None)?;
    store.read(&mut io, 1000)?;
    store.interpolate_emf_to_node()?;
    let bmag = store.magnitude();

There are 4 main parts here:
1) DECOMPOSITION:
    Splits the global grid over the process topology, builds the per-rank
    subarray layout.

    Keywords:
    DomainDescriptor, local_extent, SubarrayLayout, Decomposition

2) COLLECTIVE I/O:
    Barrier-terminated reads/writes of ghosted subarrays, path -> handle registry.

    Keywords:
    CollectiveIo, Communicator, SelfComm, ThreadComm, MpiComm, FileNaming

3) FIELDS:
    Per-species field groups, ghost shift, node-centering, single-fluid mixing.

    Keywords:
    FieldStore, FieldArray, AxisStencil, SingleFluid, CompositionMode

4) SPECTRA:
    Energy spectra and 1D velocity distributions reduced over all ranks.

    Keywords:
    EnergySpectrum, VelocityDistribution, read_spectrum, read_velocity_distribution
*/

pub mod collective_io;
pub mod comm;
pub mod config;
pub mod domain;
pub mod error;
pub mod field;
pub mod field_store;
pub mod layout;
pub mod naming;
pub mod single_fluid;
pub mod spectrum;

pub use collective_io::{AccessMode, CollectiveIo, Handle};
#[cfg(feature = "mpi")]
pub use comm::MpiComm;
pub use comm::{Communicator, SelfComm, ThreadComm, ThreadGroup};
pub use config::{Precision, RunConfig};
pub use domain::{local_extent, Decomposition, DomainDescriptor, GlobalGrid, ProcessTopology};
pub use error::{PicError, PicResult};
pub use field::{AxisStencil, FieldArray};
pub use field_store::FieldStore;
pub use layout::{Real, SubarrayLayout};
pub use naming::{FieldGroup, FileNaming, Species, StorageConvention};
pub use single_fluid::{CompositionMode, SingleFluid};
pub use spectrum::{
    read_spectrum, read_velocity_distribution, EnergySpectrum, SpectrumData, VelocityDistribution,
    VelocityDistributionFile,
};
