//! Run description read from a TOML file.
//!
//! ```toml
//! [grid]
//! nx = 512
//! ny = 1
//! nz = 256
//!
//! [topology]
//! px = 16
//! py = 1
//! pz = 8
//!
//! [output]
//! data_dir = "data"
//! fields_interval = 1000
//!
//! [physics]
//! mime = 25.0
//! ```

use crate::domain::{Decomposition, DomainDescriptor, GlobalGrid, ProcessTopology};
use crate::error::{PicError, PicResult};
use crate::naming::{FileNaming, StorageConvention, DEFAULT_EXTENSION};
use log::debug;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_GHOST_WIDTH: usize = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub grid: GridSettings,
    pub topology: TopologySettings,
    pub output: OutputSettings,
    pub physics: PhysicsSettings,
    #[serde(default)]
    pub analysis: AnalysisSettings,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct GridSettings {
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TopologySettings {
    pub px: usize,
    pub py: usize,
    pub pz: usize,
    #[serde(default)]
    pub decomposition: Decomposition,
    #[serde(default = "default_ghost_width")]
    pub ghost_width: usize,
}

fn default_ghost_width() -> usize {
    DEFAULT_GHOST_WIDTH
}

/// Sample type of the field files.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    #[default]
    F32,
    F64,
}

impl Precision {
    pub fn bytes(self) -> usize {
        match self {
            Precision::F32 => 4,
            Precision::F64 => 8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct OutputSettings {
    pub data_dir: PathBuf,
    #[serde(default = "default_extension")]
    pub extension: String,
    #[serde(default)]
    pub storage: StorageConvention,
    #[serde(default)]
    pub tindex_first: usize,
    pub fields_interval: usize,
    #[serde(default)]
    pub precision: Precision,
}

fn default_extension() -> String {
    DEFAULT_EXTENSION.to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PhysicsSettings {
    /// Ion to electron mass ratio.
    pub mime: f64,
    #[serde(default)]
    pub relativistic: bool,
    #[serde(default)]
    pub n_energy_bands: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct AnalysisSettings {
    /// Total current dumped.
    #[serde(default)]
    pub save_jtot: bool,
    /// Current from the divergence of the bulk velocity dumped.
    #[serde(default)]
    pub save_jdivv: bool,
}

impl RunConfig {
    pub fn from_toml_str(content: &str) -> PicResult<Self> {
        let config: RunConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> PicResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| PicError::FileAccess {
            path: path.to_path_buf(),
            quantity: "run configuration".to_string(),
            tindex: None,
            reason: e.to_string(),
        })?;
        let config = Self::from_toml_str(&content)?;
        debug!("loaded run configuration from '{}'", path.display());
        Ok(config)
    }

    pub fn grid(&self) -> GlobalGrid {
        GlobalGrid::new(self.grid.nx, self.grid.ny, self.grid.nz)
    }

    pub fn topology(&self) -> ProcessTopology {
        ProcessTopology::new(self.topology.px, self.topology.py, self.topology.pz)
    }

    pub fn validate(&self) -> PicResult<()> {
        let g = self.grid;
        if g.nx == 0 || g.ny == 0 || g.nz == 0 {
            return Err(PicError::config(format!(
                "grid must have positive cell counts, got ({}, {}, {})",
                g.nx, g.ny, g.nz
            )));
        }
        let t = self.topology;
        if t.px == 0 || t.py == 0 || t.pz == 0 {
            return Err(PicError::config(format!(
                "topology must have positive rank counts, got ({}, {}, {})",
                t.px, t.py, t.pz
            )));
        }
        if self.output.fields_interval == 0 {
            return Err(PicError::config("fields_interval must be positive"));
        }
        if self.output.extension.is_empty() || self.output.extension.contains('.') {
            return Err(PicError::config(format!(
                "extension '{}' must be a bare suffix",
                self.output.extension
            )));
        }
        if !(self.physics.mime > 0.0) {
            return Err(PicError::config(format!("mime must be positive, got {}", self.physics.mime)));
        }
        // rank 0 carries the largest share along every axis
        DomainDescriptor::new(
            self.grid(),
            self.topology(),
            0,
            t.decomposition,
            t.ghost_width,
        )?;
        Ok(())
    }

    pub fn domain(&self, rank: usize) -> PicResult<DomainDescriptor> {
        DomainDescriptor::new(
            self.grid(),
            self.topology(),
            rank,
            self.topology.decomposition,
            self.topology.ghost_width,
        )
    }

    pub fn naming(&self) -> FileNaming {
        FileNaming::new(&self.output.data_dir, self.output.storage)
            .with_extension(self.output.extension.clone())
            .with_timing(self.output.tindex_first, self.output.fields_interval)
    }
}
