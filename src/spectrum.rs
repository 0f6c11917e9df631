//! Particle energy spectra and 1D velocity distributions.
//!
//! Every rank bins its own particles, `reduce` sums the histograms over the
//! communicator and rank 0 alone writes the result.

use crate::comm::Communicator;
use crate::error::{PicError, PicResult};
use crate::naming::Species;
use bytemuck::{bytes_of, cast_slice, pod_read_unaligned, Pod};
use log::{debug, info};
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Runs `write` on rank 0, then waits for every rank. Returns the written path on rank 0.
fn write_on_root<C, F>(comm: &C, path: PathBuf, write: F) -> PicResult<Option<PathBuf>>
where
    C: Communicator,
    F: FnOnce(&Path) -> std::io::Result<()>,
{
    let result = if comm.is_root() {
        write(&path).map(|_| Some(path))
    } else {
        Ok(None)
    };
    comm.barrier();
    let written = result?;
    if let Some(p) = &written {
        info!("wrote '{}'", p.display());
    }
    Ok(written)
}

fn add_into(acc: &mut [f64], other: &[f64]) {
    for (a, b) in acc.iter_mut().zip(other) {
        *a += b;
    }
}

/// Energy spectrum on linear and logarithmic bins over `[emin, emax)`.
///
/// Fluxes are `dN/dE`: accumulated weight divided by the bin width.
#[derive(Debug, Clone, PartialEq)]
pub struct EnergySpectrum {
    nbins: usize,
    emin: f64,
    emax: f64,
    flin: Vec<f64>,
    flog: Vec<f64>,
}

impl EnergySpectrum {
    pub fn new(nbins: usize, emin: f64, emax: f64) -> PicResult<Self> {
        if nbins == 0 || !(emin > 0.0) || !(emax > emin) {
            return Err(PicError::config(format!(
                "energy bins need nbins > 0 and 0 < emin < emax, got {nbins} over [{emin}, {emax})"
            )));
        }
        Ok(Self {
            nbins,
            emin,
            emax,
            flin: vec![0.0; nbins],
            flog: vec![0.0; nbins],
        })
    }

    pub fn nbins(&self) -> usize {
        self.nbins
    }

    fn de_lin(&self) -> f64 {
        (self.emax - self.emin) / self.nbins as f64
    }

    fn dlog(&self) -> f64 {
        (self.emax / self.emin).ln() / self.nbins as f64
    }

    /// Linear bin centers.
    pub fn ene_lin(&self) -> Vec<f64> {
        let de = self.de_lin();
        (0..self.nbins).map(|i| self.emin + (i as f64 + 0.5) * de).collect()
    }

    /// Geometric centers of the logarithmic bins.
    pub fn ene_log(&self) -> Vec<f64> {
        let dlog = self.dlog();
        (0..self.nbins)
            .map(|i| self.emin * ((i as f64 + 0.5) * dlog).exp())
            .collect()
    }

    pub fn flin(&self) -> &[f64] {
        &self.flin
    }

    pub fn flog(&self) -> &[f64] {
        &self.flog
    }

    /// `(linear bin, flux increment)` and `(log bin, flux increment)` of one sample.
    fn bin(&self, energy: f64, weight: f64) -> Option<((usize, f64), (usize, f64))> {
        if !(energy >= self.emin && energy < self.emax) {
            return None;
        }
        let de = self.de_lin();
        let dlog = self.dlog();
        let il = (((energy - self.emin) / de) as usize).min(self.nbins - 1);
        let ig = (((energy / self.emin).ln() / dlog) as usize).min(self.nbins - 1);
        let log_width = self.emin * (((ig + 1) as f64 * dlog).exp() - (ig as f64 * dlog).exp());
        Some(((il, weight / de), (ig, weight / log_width)))
    }

    /// Adds one particle; energies outside `[emin, emax)` are dropped.
    pub fn accumulate(&mut self, energy: f64, weight: f64) {
        if let Some(((il, fl), (ig, fg))) = self.bin(energy, weight) {
            self.flin[il] += fl;
            self.flog[ig] += fg;
        }
    }

    /// `(energy, weight)` pairs, binned in parallel.
    pub fn accumulate_all(&mut self, samples: &[(f64, f64)]) {
        let n = self.nbins;
        let (flin, flog) = samples
            .par_iter()
            .fold(
                || (vec![0.0; n], vec![0.0; n]),
                |(mut lin, mut log), &(e, w)| {
                    if let Some(((il, fl), (ig, fg))) = self.bin(e, w) {
                        lin[il] += fl;
                        log[ig] += fg;
                    }
                    (lin, log)
                },
            )
            .reduce(
                || (vec![0.0; n], vec![0.0; n]),
                |(mut la, mut ga), (lb, gb)| {
                    add_into(&mut la, &lb);
                    add_into(&mut ga, &gb);
                    (la, ga)
                },
            );
        add_into(&mut self.flin, &flin);
        add_into(&mut self.flog, &flog);
    }

    /// Global sum over `comm`. Collective.
    pub fn reduce<C: Communicator>(&mut self, comm: &C) {
        comm.sum_in_place(&mut self.flin);
        comm.sum_in_place(&mut self.flog);
    }

    pub fn file_name(species: Species, tframe: usize) -> String {
        format!("spectrum-{}.{tframe}", species.spectrum_tag())
    }

    /// Rank 0 writes `ene_lin flin ene_log flog` rows into `dir`. Collective.
    pub fn write<C: Communicator>(
        &self,
        comm: &C,
        dir: &Path,
        species: Species,
        tframe: usize,
    ) -> PicResult<Option<PathBuf>> {
        let path = dir.join(Self::file_name(species, tframe));
        write_on_root(comm, path, |p| {
            let mut out = BufWriter::new(File::create(p)?);
            for (((el, fl), eg), fg) in self
                .ene_lin()
                .iter()
                .zip(&self.flin)
                .zip(self.ene_log().iter())
                .zip(&self.flog)
            {
                writeln!(out, "{el:.8e} {fl:.8e} {eg:.8e} {fg:.8e}")?;
            }
            out.flush()
        })
    }
}

/// Columns of a spectrum file.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SpectrumData {
    pub ene_lin: Vec<f64>,
    pub flin: Vec<f64>,
    pub ene_log: Vec<f64>,
    pub flog: Vec<f64>,
}

impl SpectrumData {
    /// `Σ flin ΔE`, with `ΔE` taken from the spacing of the linear bin
    /// centers. `None` with fewer than two bins.
    pub fn total_particles(&self) -> Option<f64> {
        let [first, .., last] = self.ene_lin[..] else {
            return None;
        };
        let de = (last - first) / (self.ene_lin.len() - 1) as f64;
        Some(self.flin.iter().sum::<f64>() * de)
    }
}

/// Reads a spectrum file, dividing the log-binned flux by `fnorm`.
pub fn read_spectrum(path: &Path, fnorm: f64) -> PicResult<SpectrumData> {
    let file = File::open(path).map_err(|_| PicError::missing(path, "energy spectrum", None))?;
    let mut data = SpectrumData::default();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let cols: Vec<f64> = line
            .split_whitespace()
            .map(str::parse::<f64>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| PicError::FileAccess {
                path: path.to_path_buf(),
                quantity: "energy spectrum".to_string(),
                tindex: None,
                reason: format!("line {}: {e}", lineno + 1),
            })?;
        let [el, fl, eg, fg] = cols[..] else {
            return Err(PicError::FileAccess {
                path: path.to_path_buf(),
                quantity: "energy spectrum".to_string(),
                tindex: None,
                reason: format!("line {} has {} columns, expected 4", lineno + 1, cols.len()),
            });
        };
        data.ene_lin.push(el);
        data.flin.push(fl);
        data.ene_log.push(eg);
        data.flog.push(fg / fnorm);
    }
    debug!("read {} spectrum bins from '{}'", data.ene_lin.len(), path.display());
    Ok(data)
}

/// Header size of a velocity distribution file.
pub const VDIST_HEADER_BYTES: usize = 36;

/// Velocity distributions parallel and perpendicular to the local magnetic
/// field, for the particles inside one box.
#[derive(Debug, Clone, PartialEq)]
pub struct VelocityDistribution {
    center: [f32; 3],
    sizes: [f32; 3],
    vmax: f64,
    nbins: usize,
    fvel_para: Vec<f64>,
    fvel_perp: Vec<f64>,
}

impl VelocityDistribution {
    pub fn new(center: [f32; 3], sizes: [f32; 3], vmax: f64, nbins: usize) -> PicResult<Self> {
        if nbins == 0 || !(vmax > 0.0) {
            return Err(PicError::config(format!(
                "velocity bins need nbins > 0 and vmax > 0, got {nbins} and {vmax}"
            )));
        }
        Ok(Self {
            center,
            sizes,
            vmax,
            nbins,
            fvel_para: vec![0.0; 2 * nbins],
            fvel_perp: vec![0.0; nbins],
        })
    }

    pub fn nbins(&self) -> usize {
        self.nbins
    }

    fn dv(&self) -> f64 {
        self.vmax / self.nbins as f64
    }

    /// Perpendicular bin centers over `[0, vmax]`.
    pub fn vbins_short(&self) -> Vec<f64> {
        let dv = self.dv();
        (0..self.nbins).map(|i| (i as f64 + 0.5) * dv).collect()
    }

    /// Parallel bin centers over `[-vmax, vmax]`.
    pub fn vbins_long(&self) -> Vec<f64> {
        let dv = self.dv();
        (0..2 * self.nbins)
            .map(|i| -self.vmax + (i as f64 + 0.5) * dv)
            .collect()
    }

    pub fn fvel_para(&self) -> &[f64] {
        &self.fvel_para
    }

    pub fn fvel_perp(&self) -> &[f64] {
        &self.fvel_perp
    }

    /// Parallel and perpendicular bins of velocity `u` against field `b`.
    fn bin(&self, u: [f64; 3], b: [f64; 3]) -> (Option<usize>, Option<usize>) {
        let bmag = (b[0] * b[0] + b[1] * b[1] + b[2] * b[2]).sqrt();
        if !(bmag > 0.0) {
            return (None, None);
        }
        let bhat = [b[0] / bmag, b[1] / bmag, b[2] / bmag];
        let para = u[0] * bhat[0] + u[1] * bhat[1] + u[2] * bhat[2];
        let perp = [
            u[0] - para * bhat[0],
            u[1] - para * bhat[1],
            u[2] - para * bhat[2],
        ];
        let perp = (perp[0] * perp[0] + perp[1] * perp[1] + perp[2] * perp[2]).sqrt();
        let dv = self.dv();
        let ipara = ((para + self.vmax) / dv).floor();
        let iperp = (perp / dv).floor();
        let ipara = (ipara >= 0.0 && ipara < (2 * self.nbins) as f64).then_some(ipara as usize);
        let iperp = (iperp < self.nbins as f64).then_some(iperp as usize);
        (ipara, iperp)
    }

    /// Adds one particle. Velocities outside the bins, or a vanishing field, add nothing.
    pub fn accumulate(&mut self, u: [f64; 3], b: [f64; 3], weight: f64) {
        let (ipara, iperp) = self.bin(u, b);
        if let Some(i) = ipara {
            self.fvel_para[i] += weight;
        }
        if let Some(i) = iperp {
            self.fvel_perp[i] += weight;
        }
    }

    /// `(u, b, weight)` triples, binned in parallel.
    pub fn accumulate_all(&mut self, samples: &[([f64; 3], [f64; 3], f64)]) {
        let n = self.nbins;
        let (para, perp) = samples
            .par_iter()
            .fold(
                || (vec![0.0; 2 * n], vec![0.0; n]),
                |(mut para, mut perp), &(u, b, w)| {
                    let (ipara, iperp) = self.bin(u, b);
                    if let Some(i) = ipara {
                        para[i] += w;
                    }
                    if let Some(i) = iperp {
                        perp[i] += w;
                    }
                    (para, perp)
                },
            )
            .reduce(
                || (vec![0.0; 2 * n], vec![0.0; n]),
                |(mut pa, mut qa), (pb, qb)| {
                    add_into(&mut pa, &pb);
                    add_into(&mut qa, &qb);
                    (pa, qa)
                },
            );
        add_into(&mut self.fvel_para, &para);
        add_into(&mut self.fvel_perp, &perp);
    }

    /// Global sum over `comm`. Collective.
    pub fn reduce<C: Communicator>(&mut self, comm: &C) {
        comm.sum_in_place(&mut self.fvel_para);
        comm.sum_in_place(&mut self.fvel_perp);
    }

    pub fn file_name(species: Species, tframe: usize) -> String {
        format!("vdist_1d-{}.{tframe}", species.spectrum_tag())
    }

    /// Rank 0 writes the binary distribution file into `dir`. Collective.
    pub fn write<C: Communicator>(
        &self,
        comm: &C,
        dir: &Path,
        species: Species,
        tframe: usize,
    ) -> PicResult<Option<PathBuf>> {
        let path = dir.join(Self::file_name(species, tframe));
        write_on_root(comm, path, |p| {
            let mut out = BufWriter::new(File::create(p)?);
            out.write_all(cast_slice(&self.center))?;
            out.write_all(cast_slice(&self.sizes))?;
            out.write_all(bytes_of(&(-self.vmax as f32)))?;
            out.write_all(bytes_of(&(self.vmax as f32)))?;
            out.write_all(bytes_of(&(self.nbins as i32)))?;
            out.write_all(cast_slice(&self.vbins_short()))?;
            out.write_all(cast_slice(&self.vbins_long()))?;
            out.write_all(cast_slice(&self.fvel_para))?;
            out.write_all(cast_slice(&self.fvel_perp))?;
            out.flush()
        })
    }
}

/// Everything stored in a velocity distribution file.
#[derive(Debug, Clone, PartialEq)]
pub struct VelocityDistributionFile {
    pub center: [f32; 3],
    pub sizes: [f32; 3],
    pub vmin: f32,
    pub vmax: f32,
    pub nbins: usize,
    pub vbins_short: Vec<f64>,
    pub vbins_long: Vec<f64>,
    pub fvel_para: Vec<f64>,
    pub fvel_perp: Vec<f64>,
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take<T: Pod>(&mut self) -> Option<T> {
        let size = std::mem::size_of::<T>();
        let chunk = self.bytes.get(self.pos..self.pos + size)?;
        self.pos += size;
        Some(pod_read_unaligned(chunk))
    }

    fn take_vec<T: Pod>(&mut self, n: usize) -> Option<Vec<T>> {
        (0..n).map(|_| self.take()).collect()
    }
}

/// Reads a velocity distribution file of `species`.
///
/// Ion files store `sqrt(mime) u`; their bins and velocity range are scaled
/// back to `u`. The distributions are returned as stored.
pub fn read_velocity_distribution(path: &Path, species: Species, mime: f64) -> PicResult<VelocityDistributionFile> {
    if !(mime > 0.0) {
        return Err(PicError::config(format!("mime must be positive, got {mime}")));
    }
    let bytes = std::fs::read(path).map_err(|_| PicError::missing(path, "velocity distribution", None))?;
    let truncated = |what: &str| PicError::FileAccess {
        path: path.to_path_buf(),
        quantity: "velocity distribution".to_string(),
        tindex: None,
        reason: format!("file ends inside {what} ({} bytes)", bytes.len()),
    };
    let mut cur = Cursor { bytes: &bytes, pos: 0 };
    let mut header = || -> Option<([f32; 3], [f32; 3], f32, f32, i32)> {
        let center = [cur.take()?, cur.take()?, cur.take()?];
        let sizes = [cur.take()?, cur.take()?, cur.take()?];
        Some((center, sizes, cur.take()?, cur.take()?, cur.take()?))
    };
    let (center, sizes, mut vmin, mut vmax, nbins) = header().ok_or_else(|| truncated("the header"))?;
    let nbins = usize::try_from(nbins).map_err(|_| PicError::FileAccess {
        path: path.to_path_buf(),
        quantity: "velocity distribution".to_string(),
        tindex: None,
        reason: format!("negative bin count {nbins}"),
    })?;
    let mut vbins_short: Vec<f64> = cur.take_vec(nbins).ok_or_else(|| truncated("the perpendicular bins"))?;
    let mut vbins_long: Vec<f64> = cur.take_vec(2 * nbins).ok_or_else(|| truncated("the parallel bins"))?;
    let fvel_para = cur.take_vec(2 * nbins).ok_or_else(|| truncated("the parallel distribution"))?;
    let fvel_perp = cur.take_vec(nbins).ok_or_else(|| truncated("the perpendicular distribution"))?;
    if species == Species::Ion {
        let smime = mime.sqrt();
        vbins_short.iter_mut().chain(vbins_long.iter_mut()).for_each(|v| *v /= smime);
        vmin /= smime as f32;
        vmax /= smime as f32;
    }
    Ok(VelocityDistributionFile {
        center,
        sizes,
        vmin,
        vmax,
        nbins,
        vbins_short,
        vbins_long,
        fvel_para,
        fvel_perp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{SelfComm, ThreadGroup};

    #[test]
    fn linear_and_log_bins() {
        let mut s = EnergySpectrum::new(4, 1.0, 16.0).unwrap();
        assert_eq!(s.ene_lin(), vec![2.875, 6.625, 10.375, 14.125]);
        let log = s.ene_log();
        assert!((log[0] - 2f64.sqrt()).abs() < 1e-12);
        assert!((log[3] - 8.0 * 2f64.sqrt()).abs() < 1e-12);

        s.accumulate(3.0, 1.0);
        s.accumulate(20.0, 1.0);
        s.accumulate(0.5, 1.0);
        assert!((s.flin()[0] - 1.0 / 3.75).abs() < 1e-12);
        // 3 falls in the log bin [2, 4)
        assert!((s.flog()[1] - 0.5).abs() < 1e-12);
        assert_eq!(s.flin().iter().filter(|&&f| f > 0.0).count(), 1);
    }

    #[test]
    fn parallel_accumulation_matches_serial() {
        let samples: Vec<(f64, f64)> = (0..1000).map(|i| (1.0 + (i % 97) as f64 * 0.1, 1.0)).collect();
        let mut serial = EnergySpectrum::new(16, 1.0, 12.0).unwrap();
        for &(e, w) in &samples {
            serial.accumulate(e, w);
        }
        let mut par = EnergySpectrum::new(16, 1.0, 12.0).unwrap();
        par.accumulate_all(&samples);
        for (a, b) in serial.flin().iter().zip(par.flin()) {
            assert!((a - b).abs() < 1e-9);
        }
    }

    #[test]
    fn spectrum_file_round_trip_with_normalization() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = EnergySpectrum::new(8, 0.5, 4.5).unwrap();
        for e in [0.6, 1.0, 1.1, 2.0, 4.0] {
            s.accumulate(e, 2.0);
        }
        let path = s.write(&SelfComm, dir.path(), Species::Ion, 12).unwrap().unwrap();
        assert!(path.ends_with("spectrum-h.12"));
        let data = read_spectrum(&path, 2.0).unwrap();
        assert_eq!(data.ene_lin.len(), 8);
        for (a, b) in data.flog.iter().zip(s.flog()) {
            assert!((a - b / 2.0).abs() <= 1e-7 * b.abs());
        }
        // five samples of weight 2
        assert!((data.total_particles().unwrap() - 10.0).abs() < 1e-6);
    }

    #[test]
    fn ranks_sum_before_rank_zero_writes() {
        let dir = tempfile::tempdir().unwrap();
        let written = ThreadGroup::run(3, |comm| {
            let mut s = EnergySpectrum::new(2, 1.0, 3.0).unwrap();
            s.accumulate(1.5, 1.0 + comm.rank() as f64);
            s.reduce(&comm);
            assert_eq!(s.flin(), &[6.0, 0.0]);
            s.write(&comm, dir.path(), Species::Electron, 0).unwrap()
        });
        assert!(written[0].is_some());
        assert!(written[1].is_none() && written[2].is_none());
    }

    #[test]
    fn parallel_and_perpendicular_bins() {
        let mut d = VelocityDistribution::new([0.0; 3], [1.0; 3], 1.0, 4).unwrap();
        assert_eq!(d.vbins_short(), vec![0.125, 0.375, 0.625, 0.875]);
        assert_eq!(d.vbins_long()[0], -0.875);
        assert_eq!(d.vbins_long()[7], 0.875);
        // B along z: u = (0.3, 0.4, -0.6) -> para -0.6, perp 0.5
        d.accumulate([0.3, 0.4, -0.6], [0.0, 0.0, 2.0], 1.5);
        assert_eq!(d.fvel_para()[1], 1.5);
        assert_eq!(d.fvel_perp()[2], 1.5);
        d.accumulate([0.3, 0.4, -0.6], [0.0; 3], 1.0);
        d.accumulate([0.0, 0.0, 1.5], [0.0, 0.0, 1.0], 1.0);
        assert_eq!(d.fvel_para().iter().sum::<f64>(), 1.5);
        assert_eq!(d.fvel_perp()[0], 1.0);
    }

    #[test]
    fn velocity_distribution_file_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = VelocityDistribution::new([1.0, 2.0, 3.0], [0.5, 0.5, 0.5], 2.0, 3).unwrap();
        d.accumulate_all(&[([0.1, 0.0, 0.0], [1.0, 0.0, 0.0], 1.0), ([0.0, 1.2, 0.0], [1.0, 0.0, 0.0], 2.0)]);
        let path = d.write(&SelfComm, dir.path(), Species::Electron, 7).unwrap().unwrap();
        assert!(path.ends_with("vdist_1d-e.7"));
        let len = std::fs::metadata(&path).unwrap().len() as usize;
        assert_eq!(len, VDIST_HEADER_BYTES + 8 * (3 + 6 + 6 + 3));

        let f = read_velocity_distribution(&path, Species::Electron, 25.0).unwrap();
        assert_eq!(f.center, [1.0, 2.0, 3.0]);
        assert_eq!((f.vmin, f.vmax, f.nbins), (-2.0, 2.0, 3));
        assert_eq!(f.vbins_short, d.vbins_short());
        assert_eq!(f.vbins_long, d.vbins_long());
        assert_eq!(f.fvel_para, d.fvel_para());
        assert_eq!(f.fvel_perp, d.fvel_perp());

        std::fs::write(&path, &std::fs::read(&path).unwrap()[..40]).unwrap();
        assert!(matches!(
            read_velocity_distribution(&path, Species::Electron, 25.0),
            Err(PicError::FileAccess { .. })
        ));
    }

    #[test]
    fn ion_velocities_are_scaled_back_by_sqrt_mime() {
        let dir = tempfile::tempdir().unwrap();
        let mut d = VelocityDistribution::new([0.0; 3], [1.0; 3], 2.0, 4).unwrap();
        d.accumulate([0.0, 0.0, 0.7], [0.0, 0.0, 1.0], 3.0);
        let path = d.write(&SelfComm, dir.path(), Species::Ion, 3).unwrap().unwrap();
        let f = read_velocity_distribution(&path, Species::Ion, 4.0).unwrap();
        assert_eq!((f.vmin, f.vmax), (-1.0, 1.0));
        let halved: Vec<f64> = d.vbins_long().iter().map(|v| v / 2.0).collect();
        assert_eq!(f.vbins_long, halved);
        assert_eq!(f.vbins_short[0], 0.125);
        assert_eq!(f.fvel_para, d.fvel_para());
        assert!(read_velocity_distribution(&path, Species::Ion, 0.0).is_err());
    }

    #[test]
    fn total_particles_needs_a_bin_width() {
        let one_bin = SpectrumData {
            ene_lin: vec![1.0],
            flin: vec![5.0],
            ene_log: vec![1.0],
            flog: vec![5.0],
        };
        assert_eq!(one_bin.total_particles(), None);
        let data = SpectrumData {
            ene_lin: vec![0.25, 0.75, 1.25],
            flin: vec![2.0, 4.0, 0.0],
            ..one_bin
        };
        assert_eq!(data.total_particles(), Some(3.0));
    }
}
