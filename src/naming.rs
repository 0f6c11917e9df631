//! File naming grammar of the field dumps:
//! `<prefix><component>[_<tindex>].<ext>`.

use crate::error::{PicError, PicResult};
use log::{debug, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const DEFAULT_EXTENSION: &str = "gda";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Species {
    Electron,
    Ion,
}

impl Species {
    /// One-character tag embedded in per-species field files.
    pub fn tag(self) -> char {
        match self {
            Species::Electron => 'e',
            Species::Ion => 'i',
        }
    }

    /// Tag used by the particle spectrum and distribution dumps.
    pub fn spectrum_tag(self) -> char {
        match self {
            Species::Electron => 'e',
            Species::Ion => 'h',
        }
    }

    pub fn other(self) -> Species {
        match self {
            Species::Electron => Species::Ion,
            Species::Ion => Species::Electron,
        }
    }
}

impl fmt::Display for Species {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Species::Electron => write!(f, "electron"),
            Species::Ion => write!(f, "ion"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldGroup {
    Magnetic,
    Electric,
    Current,
    Pressure,
    Velocity,
    NumberDensity,
    EnergyBand,
}

impl FieldGroup {
    pub fn is_per_species(self) -> bool {
        !matches!(
            self,
            FieldGroup::Magnetic | FieldGroup::Electric | FieldGroup::Current
        )
    }
}

impl fmt::Display for FieldGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldGroup::Magnetic => "magnetic field",
            FieldGroup::Electric => "electric field",
            FieldGroup::Current => "current density",
            FieldGroup::Pressure => "pressure tensor",
            FieldGroup::Velocity => "bulk velocity",
            FieldGroup::NumberDensity => "number density",
            FieldGroup::EnergyBand => "energy band fraction",
        };
        f.write_str(name)
    }
}

pub const PRESSURE_COMPONENTS: [&str; 6] = ["xx", "xy", "xz", "yy", "yz", "zz"];
pub const PRESSURE_COMPONENTS_REL: [&str; 3] = ["yx", "zx", "zy"];

/// Component suffixes of a group, in storage order.
pub fn component_names(group: FieldGroup, relativistic: bool, n_bands: usize) -> Vec<String> {
    match group {
        FieldGroup::Magnetic
        | FieldGroup::Electric
        | FieldGroup::Current
        | FieldGroup::Velocity => ["x", "y", "z"].iter().map(|s| s.to_string()).collect(),
        FieldGroup::Pressure => {
            let mut names: Vec<String> = PRESSURE_COMPONENTS.iter().map(|s| s.to_string()).collect();
            if relativistic {
                names.extend(PRESSURE_COMPONENTS_REL.iter().map(|s| s.to_string()));
            }
            names
        }
        FieldGroup::NumberDensity => vec![String::new()],
        FieldGroup::EnergyBand => (1..=n_bands).map(|b| format!("{b:02}")).collect(),
    }
}

/// File stem (`<prefix><component>`) of one component.
///
/// `velocity_prefix` is `'v'` or `'u'` and only matters for the velocity group.
pub fn stem(group: FieldGroup, species: Species, component: &str, velocity_prefix: char) -> String {
    let s = species.tag();
    match group {
        FieldGroup::Magnetic => format!("b{component}"),
        FieldGroup::Electric => format!("e{component}"),
        FieldGroup::Current => format!("j{component}"),
        FieldGroup::Pressure => format!("p{s}-{component}"),
        FieldGroup::Velocity => format!("{velocity_prefix}{s}{component}"),
        FieldGroup::NumberDensity => format!("n{s}"),
        FieldGroup::EnergyBand => format!("{s}EB{component}"),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageConvention {
    /// One file per component holding every dumped timestep back to back.
    #[default]
    SingleFile,
    /// One file per component and timestep.
    MultiFile,
}

/// Resolves stems and timesteps to paths and byte displacements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNaming {
    pub dir: PathBuf,
    pub extension: String,
    pub storage: StorageConvention,
    pub tindex_first: usize,
    pub interval: usize,
}

impl FileNaming {
    pub fn new(dir: impl Into<PathBuf>, storage: StorageConvention) -> Self {
        Self {
            dir: dir.into(),
            extension: DEFAULT_EXTENSION.to_string(),
            storage,
            tindex_first: 0,
            interval: 1,
        }
    }

    pub fn with_timing(mut self, tindex_first: usize, interval: usize) -> Self {
        self.tindex_first = tindex_first;
        self.interval = interval;
        self
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into();
        self
    }

    pub fn path(&self, stem: &str, tindex: usize) -> PathBuf {
        match self.storage {
            StorageConvention::SingleFile => self.dir.join(format!("{stem}.{}", self.extension)),
            StorageConvention::MultiFile => {
                self.dir.join(format!("{stem}_{tindex}.{}", self.extension))
            }
        }
    }

    /// Position of `tindex` in a single-file stream.
    pub fn frame(&self, tindex: usize) -> PicResult<u64> {
        if self.interval == 0 {
            return Err(PicError::config("fields interval must be positive"));
        }
        if tindex < self.tindex_first || (tindex - self.tindex_first) % self.interval != 0 {
            return Err(PicError::config(format!(
                "tindex {tindex} is not a dumped step (first {}, interval {})",
                self.tindex_first, self.interval
            )));
        }
        Ok(((tindex - self.tindex_first) / self.interval) as u64)
    }

    /// Byte displacement of `tindex` for a snapshot of `snapshot_bytes`.
    pub fn displacement(&self, snapshot_bytes: u64, tindex: usize) -> PicResult<u64> {
        match self.storage {
            StorageConvention::SingleFile => Ok(snapshot_bytes * self.frame(tindex)?),
            StorageConvention::MultiFile => Ok(0),
        }
    }

    /// Picks `v` (classical velocity) or `u` (4-velocity) for `species`.
    ///
    /// The first non-empty file wins. Neither present is a `FileAccess` error.
    pub fn velocity_prefix(&self, species: Species, tindex: usize) -> PicResult<char> {
        let mut probed = Vec::with_capacity(2);
        for prefix in ['v', 'u'] {
            let path = self.path(&stem(FieldGroup::Velocity, species, "x", prefix), tindex);
            if is_nonempty(&path) {
                if prefix == 'u' {
                    warn!(
                        "no {} velocity under '{}', using 4-velocity files",
                        species,
                        probed.first().map(|p: &PathBuf| p.display().to_string()).unwrap_or_default()
                    );
                }
                debug!("{species} velocity resolved to prefix '{prefix}'");
                return Ok(prefix);
            }
            probed.push(path);
        }
        Err(PicError::FileAccess {
            path: probed.remove(0),
            quantity: format!("{species} velocity"),
            tindex: Some(tindex),
            reason: format!("neither v- nor u-prefixed file present (also tried '{}')", probed[0].display()),
        })
    }

    /// Timesteps present in `dir` for `stem` under the multi-file convention.
    pub fn available_tindices(&self, stem: &str) -> PicResult<Vec<usize>> {
        let re = Regex::new(&format!(
            r"^{}_(\d+)\.{}$",
            regex::escape(stem),
            regex::escape(&self.extension)
        ))
        .map_err(|e| PicError::config(format!("bad stem '{stem}': {e}")))?;
        let mut found = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(t) = re
                .captures(name)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse::<usize>().ok())
            {
                found.push(t);
            }
        }
        found.sort_unstable();
        found.dedup();
        Ok(found)
    }
}

fn is_nonempty(path: &Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stems_follow_the_dump_grammar() {
        let e = Species::Electron;
        let i = Species::Ion;
        assert_eq!(stem(FieldGroup::Magnetic, e, "x", 'v'), "bx");
        assert_eq!(stem(FieldGroup::Current, i, "z", 'v'), "jz");
        assert_eq!(stem(FieldGroup::Pressure, e, "xy", 'v'), "pe-xy");
        assert_eq!(stem(FieldGroup::Velocity, i, "y", 'u'), "uiy");
        assert_eq!(stem(FieldGroup::NumberDensity, e, "", 'v'), "ne");
        assert_eq!(stem(FieldGroup::EnergyBand, i, "03", 'v'), "iEB03");
    }

    #[test]
    fn component_lists() {
        assert_eq!(component_names(FieldGroup::Pressure, false, 0).len(), 6);
        let rel = component_names(FieldGroup::Pressure, true, 0);
        assert_eq!(rel.len(), 9);
        assert_eq!(rel[8], "zy");
        assert_eq!(
            component_names(FieldGroup::EnergyBand, false, 3),
            vec!["01", "02", "03"]
        );
        assert_eq!(component_names(FieldGroup::NumberDensity, true, 5), vec![""]);
    }

    #[test]
    fn paths_and_displacements() {
        let single = FileNaming::new("/run/data", StorageConvention::SingleFile).with_timing(100, 50);
        assert_eq!(single.path("bx", 200), PathBuf::from("/run/data/bx.gda"));
        assert_eq!(single.displacement(1000, 200).unwrap(), 2000);
        assert!(single.displacement(1000, 120).is_err());
        assert!(single.displacement(1000, 50).is_err());

        let multi = single.clone().with_extension("bin");
        let multi = FileNaming {
            storage: StorageConvention::MultiFile,
            ..multi
        };
        assert_eq!(multi.path("ne", 200), PathBuf::from("/run/data/ne_200.bin"));
        assert_eq!(multi.displacement(1000, 200).unwrap(), 0);
    }

    #[test]
    fn velocity_prefix_falls_back_to_u() {
        let dir = tempfile::tempdir().unwrap();
        let naming = FileNaming::new(dir.path(), StorageConvention::SingleFile);
        let err = naming.velocity_prefix(Species::Electron, 0).unwrap_err();
        assert!(matches!(err, PicError::FileAccess { .. }));

        std::fs::write(dir.path().join("uex.gda"), [0u8; 4]).unwrap();
        assert_eq!(naming.velocity_prefix(Species::Electron, 0).unwrap(), 'u');

        // a zero-length v file does not count
        std::fs::write(dir.path().join("vex.gda"), b"").unwrap();
        assert_eq!(naming.velocity_prefix(Species::Electron, 0).unwrap(), 'u');

        std::fs::write(dir.path().join("vex.gda"), [0u8; 4]).unwrap();
        assert_eq!(naming.velocity_prefix(Species::Electron, 0).unwrap(), 'v');
    }

    #[test]
    fn discovers_multi_file_timesteps() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["bx_200.gda", "bx_0.gda", "bx_1000.gda", "bxx_10.gda", "bx_5.bin", "by_3.gda"] {
            std::fs::write(dir.path().join(name), [1u8]).unwrap();
        }
        let naming = FileNaming::new(dir.path(), StorageConvention::MultiFile);
        assert_eq!(naming.available_tindices("bx").unwrap(), vec![0, 200, 1000]);
    }
}
