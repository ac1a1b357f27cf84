//! Expansion coefficients, their layout, and time series of coefficient
//! frames for playback.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use nalgebra::DMatrix;
use num_complex::Complex64;
use serde::{Deserialize, Serialize};

use crate::codec::{
    expect_eof, invalid, read_f64, read_str, read_u32, read_u8, write_f64, write_len, write_str, write_u8,
};
use crate::config::Geometry;
use crate::error::{Error, Result};

/// Row layout of a coefficient matrix. Spheres store one row per `(l, m)`
/// with `0 <= m <= l`, row `l(l+1)/2 + m`; cylinders store one row per
/// `m`. Columns are radial orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoefLayout {
    pub geometry: Geometry,
    pub lmax: usize,
    pub nmax: usize,
}

/// One row of a [`CoefLayout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AngularRow {
    pub row: usize,
    /// Index into the basis tables: `l` for spheres, `m` for cylinders.
    pub harmonic: usize,
    pub m: usize,
}

impl CoefLayout {
    pub fn new(geometry: Geometry, lmax: usize, nmax: usize) -> Self {
        Self { geometry, lmax, nmax }
    }

    pub fn rows(&self) -> usize {
        match self.geometry {
            Geometry::Sphere => (self.lmax + 1) * (self.lmax + 2) / 2,
            Geometry::Cylinder => self.lmax + 1,
        }
    }

    pub fn len(&self) -> usize {
        self.rows() * self.nmax
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn row_index(&self, harmonic: usize, m: usize) -> Result<usize> {
        if harmonic > self.lmax {
            return Err(Error::LevelIndexOutOfRange {
                what: "harmonic",
                index: harmonic,
                limit: self.lmax,
            });
        }
        match self.geometry {
            Geometry::Sphere if m > harmonic => Err(Error::LevelIndexOutOfRange {
                what: "azimuthal order",
                index: m,
                limit: harmonic,
            }),
            Geometry::Sphere => Ok(harmonic * (harmonic + 1) / 2 + m),
            Geometry::Cylinder if m != harmonic => Err(Error::LevelIndexOutOfRange {
                what: "azimuthal order",
                index: m,
                limit: harmonic,
            }),
            Geometry::Cylinder => Ok(harmonic),
        }
    }

    pub fn angular_rows(&self) -> Vec<AngularRow> {
        match self.geometry {
            Geometry::Sphere => (0..=self.lmax)
                .flat_map(|l| (0..=l).map(move |m| (l, m)))
                .enumerate()
                .map(|(row, (harmonic, m))| AngularRow { row, harmonic, m })
                .collect(),
            Geometry::Cylinder => (0..=self.lmax)
                .map(|m| AngularRow {
                    row: m,
                    harmonic: m,
                    m,
                })
                .collect(),
        }
    }
}

/// Complex coefficients for every angular row and radial order.
#[derive(Debug, Clone, PartialEq)]
pub struct CoefficientSet {
    layout: CoefLayout,
    data: DMatrix<Complex64>,
}

impl CoefficientSet {
    pub fn zeros(layout: CoefLayout) -> Self {
        Self {
            layout,
            data: DMatrix::zeros(layout.rows(), layout.nmax),
        }
    }

    /// Build from values in row-major order.
    pub fn from_row_major(layout: CoefLayout, values: &[Complex64]) -> Result<Self> {
        let mut set = Self::zeros(layout);
        set.set_row_major(values)?;
        Ok(set)
    }

    pub fn layout(&self) -> CoefLayout {
        self.layout
    }

    pub fn matrix(&self) -> &DMatrix<Complex64> {
        &self.data
    }

    pub fn get(&self, harmonic: usize, m: usize, order: usize) -> Result<Complex64> {
        let row = self.layout.row_index(harmonic, m)?;
        self.check_order(order)?;
        Ok(self.data[(row, order)])
    }

    pub fn set(&mut self, harmonic: usize, m: usize, order: usize, value: Complex64) -> Result<()> {
        let row = self.layout.row_index(harmonic, m)?;
        self.check_order(order)?;
        self.data[(row, order)] = value;
        Ok(())
    }

    pub fn at(&self, row: usize, order: usize) -> Complex64 {
        self.data[(row, order)]
    }

    pub fn at_mut(&mut self, row: usize, order: usize) -> &mut Complex64 {
        &mut self.data[(row, order)]
    }

    /// Replace every coefficient from row-major values.
    pub fn set_row_major(&mut self, values: &[Complex64]) -> Result<()> {
        if values.len() != self.layout.len() {
            return Err(Error::SizeMismatch {
                what: "coefficient values",
                expected: self.layout.len(),
                found: values.len(),
            });
        }
        let nmax = self.layout.nmax;
        for (i, v) in values.iter().enumerate() {
            self.data[(i / nmax, i % nmax)] = *v;
        }
        Ok(())
    }

    pub fn to_row_major(&self) -> Vec<Complex64> {
        let (rows, cols) = self.data.shape();
        (0..rows)
            .flat_map(|r| (0..cols).map(move |c| (r, c)))
            .map(|rc| self.data[rc])
            .collect()
    }

    pub fn set_matrix(&mut self, data: DMatrix<Complex64>) -> Result<()> {
        if data.shape() != self.data.shape() {
            return Err(Error::SizeMismatch {
                what: "coefficient matrix",
                expected: self.layout.len(),
                found: data.len(),
            });
        }
        self.data = data;
        Ok(())
    }

    pub fn add_assign(&mut self, other: &CoefficientSet) -> Result<()> {
        self.check_layout(other)?;
        self.data += &other.data;
        Ok(())
    }

    pub fn sub_assign(&mut self, other: &CoefficientSet) -> Result<()> {
        self.check_layout(other)?;
        self.data -= &other.data;
        Ok(())
    }

    pub fn scale(&mut self, factor: f64) {
        self.data *= Complex64::new(factor, 0.0);
    }

    pub fn clear(&mut self) {
        self.data.fill(Complex64::new(0.0, 0.0));
    }

    pub fn max_abs_diff(&self, other: &CoefficientSet) -> Result<f64> {
        self.check_layout(other)?;
        Ok(self
            .data
            .iter()
            .zip(other.data.iter())
            .map(|(a, b)| (a - b).norm())
            .fold(0.0, f64::max))
    }

    pub fn max_abs(&self) -> f64 {
        self.data.iter().map(|c| c.norm()).fold(0.0, f64::max)
    }

    /// Interleaved real and imaginary parts, for collective reductions.
    pub fn to_reals(&self) -> Vec<f64> {
        self.data.iter().flat_map(|c| [c.re, c.im]).collect()
    }

    pub fn set_reals(&mut self, reals: &[f64]) -> Result<()> {
        if reals.len() != 2 * self.data.len() {
            return Err(Error::SizeMismatch {
                what: "real coefficient buffer",
                expected: 2 * self.data.len(),
                found: reals.len(),
            });
        }
        for (c, pair) in self.data.iter_mut().zip(reals.chunks_exact(2)) {
            *c = Complex64::new(pair[0], pair[1]);
        }
        Ok(())
    }

    fn check_order(&self, order: usize) -> Result<()> {
        if order >= self.layout.nmax {
            return Err(Error::LevelIndexOutOfRange {
                what: "radial order",
                index: order,
                limit: self.layout.nmax.saturating_sub(1),
            });
        }
        Ok(())
    }

    fn check_layout(&self, other: &CoefficientSet) -> Result<()> {
        if self.layout != other.layout {
            return Err(Error::SizeMismatch {
                what: "coefficient layout",
                expected: self.layout.len(),
                found: other.layout.len(),
            });
        }
        Ok(())
    }
}

/// Coefficients of one snapshot, tagged with time and expansion centre.
#[derive(Debug, Clone, PartialEq)]
pub struct CoefFrame {
    pub id: String,
    pub time: f64,
    pub center: [f64; 3],
    pub coefs: CoefficientSet,
}

impl CoefFrame {
    pub fn new(id: impl Into<String>, time: f64, coefs: CoefficientSet) -> Self {
        Self {
            id: id.into(),
            time,
            center: [0.0; 3],
            coefs,
        }
    }

    pub fn geometry(&self) -> Geometry {
        self.coefs.layout().geometry
    }

    pub fn set_coefs(&mut self, values: &[Complex64]) -> Result<()> {
        self.coefs.set_row_major(values)
    }

    pub fn set_center(&mut self, center: &[f64]) -> Result<()> {
        let center: [f64; 3] = center.try_into().map_err(|_| Error::SizeMismatch {
            what: "expansion center",
            expected: 3,
            found: center.len(),
        })?;
        self.center = center;
        Ok(())
    }
}

const HISTORY_MAGIC: &[u8; 4] = b"BCOF";
const HISTORY_FORMAT: u8 = 1;
/// Upper bounds on a history header, checked before any frame is read.
const MAX_HARMONIC: usize = 1 << 12;
const MAX_FRAME_VALUES: usize = 1 << 24;

/// Time-ordered frames sharing one layout.
#[derive(Debug, Clone, PartialEq)]
pub struct CoefHistory {
    layout: CoefLayout,
    frames: Vec<CoefFrame>,
}

impl CoefHistory {
    pub fn new(layout: CoefLayout) -> Self {
        Self {
            layout,
            frames: Vec::new(),
        }
    }

    pub fn layout(&self) -> CoefLayout {
        self.layout
    }

    pub fn frames(&self) -> &[CoefFrame] {
        &self.frames
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Insert keeping time order; a frame at an existing time replaces it.
    pub fn push(&mut self, frame: CoefFrame) -> Result<()> {
        if frame.coefs.layout() != self.layout {
            return Err(Error::SizeMismatch {
                what: "frame coefficients",
                expected: self.layout.len(),
                found: frame.coefs.layout().len(),
            });
        }
        if !frame.time.is_finite() {
            return Err(Error::InvalidState(format!("frame time {} is not finite", frame.time)));
        }
        match self
            .frames
            .binary_search_by(|f| f.time.total_cmp(&frame.time))
        {
            Ok(i) => self.frames[i] = frame,
            Err(i) => self.frames.insert(i, frame),
        }
        Ok(())
    }

    pub fn time_range(&self) -> Option<(f64, f64)> {
        Some((self.frames.first()?.time, self.frames.last()?.time))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut w = BufWriter::new(File::create(path)?);
        self.write_to(&mut w)?;
        w.flush()?;
        Ok(())
    }

    pub fn read(path: &Path) -> Result<Self> {
        let mut r = BufReader::new(File::open(path)?);
        Ok(Self::read_from(&mut r)?)
    }

    fn write_to<W: Write>(&self, w: &mut W) -> io::Result<()> {
        w.write_all(HISTORY_MAGIC)?;
        write_u8(w, HISTORY_FORMAT)?;
        write_str(w, self.layout.geometry.tag())?;
        write_len(w, self.layout.lmax)?;
        write_len(w, self.layout.nmax)?;
        write_len(w, self.frames.len())?;
        for frame in &self.frames {
            write_str(w, &frame.id)?;
            write_f64(w, frame.time)?;
            for c in frame.center {
                write_f64(w, c)?;
            }
            for v in frame.coefs.to_reals() {
                write_f64(w, v)?;
            }
        }
        Ok(())
    }

    fn read_from<R: Read>(r: &mut R) -> io::Result<Self> {
        let mut magic = [0u8; 4];
        r.read_exact(&mut magic)?;
        if &magic != HISTORY_MAGIC || read_u8(r)? != HISTORY_FORMAT {
            return Err(invalid("not a coefficient history".to_string()));
        }
        let tag = read_str(r)?;
        let geometry =
            Geometry::from_tag(&tag).ok_or_else(|| invalid(format!("unknown geometry '{tag}'")))?;
        let lmax = read_u32(r)? as usize;
        let nmax = read_u32(r)? as usize;
        let layout = CoefLayout::new(geometry, lmax, nmax);
        let values = frame_values(layout)?;
        let count = read_u32(r)?;

        let mut history = Self::new(layout);
        for _ in 0..count {
            let id = read_str(r)?;
            let time = read_f64(r)?;
            let center = [read_f64(r)?, read_f64(r)?, read_f64(r)?];
            let mut reals = vec![0.0; values];
            for v in reals.iter_mut() {
                *v = read_f64(r)?;
            }
            let mut coefs = CoefficientSet::zeros(layout);
            coefs
                .set_reals(&reals)
                .map_err(|e| invalid(e.to_string()))?;
            history
                .push(CoefFrame {
                    id,
                    time,
                    center,
                    coefs,
                })
                .map_err(|e| invalid(e.to_string()))?;
        }
        expect_eof(r)?;
        Ok(history)
    }
}

/// Number of reals in one stored frame, rejecting implausible headers.
fn frame_values(layout: CoefLayout) -> io::Result<usize> {
    if layout.lmax > MAX_HARMONIC {
        return Err(invalid(format!("implausible harmonic limit {}", layout.lmax)));
    }
    layout
        .rows()
        .checked_mul(layout.nmax)
        .and_then(|n| n.checked_mul(2))
        .filter(|&n| n <= MAX_FRAME_VALUES)
        .ok_or_else(|| invalid(format!("implausible frame size {} x {}", layout.rows(), layout.nmax)))
}

/// Replays a recorded history as a time-continuous coefficient source.
#[derive(Debug, Clone)]
pub struct Playback {
    history: CoefHistory,
}

impl Playback {
    pub fn new(history: CoefHistory) -> Result<Self> {
        if history.is_empty() {
            return Err(Error::InvalidState("playback needs at least one frame".into()));
        }
        Ok(Self { history })
    }

    pub fn history(&self) -> &CoefHistory {
        &self.history
    }

    /// Linear interpolation between the bracketing frames. Queries outside
    /// the recorded interval are rejected.
    pub fn coefficients_at(&self, time: f64) -> Result<CoefFrame> {
        let frames = self.history.frames();
        let (first, last) = match self.history.time_range() {
            Some(range) => range,
            None => return Err(Error::InvalidState("empty coefficient history".into())),
        };
        if !(time >= first && time <= last) {
            return Err(Error::OutOfRangeQuery {
                coordinate: "time",
                value: time,
                min: first,
                max: last,
            });
        }

        let hi = match frames.binary_search_by(|f| f.time.total_cmp(&time)) {
            Ok(i) => return Ok(frames[i].clone()),
            Err(i) => i,
        };
        let (a, b) = (&frames[hi - 1], &frames[hi]);
        let w = (time - a.time) / (b.time - a.time);

        let data = a.coefs.matrix() * Complex64::new(1.0 - w, 0.0) + b.coefs.matrix() * Complex64::new(w, 0.0);
        let mut coefs = CoefficientSet::zeros(self.history.layout());
        coefs.set_matrix(data)?;
        let mut center = [0.0; 3];
        for (k, c) in center.iter_mut().enumerate() {
            *c = (1.0 - w) * a.center[k] + w * b.center[k];
        }
        Ok(CoefFrame {
            id: a.id.clone(),
            time,
            center,
            coefs,
        })
    }
}
