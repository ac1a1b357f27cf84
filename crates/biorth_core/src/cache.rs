//! Persistent basis tables.
//!
//! File layout, all integers and floats little-endian:
//!
//! ```text
//! magic "BIOR" | format u8
//! record count u32 | { key str | tag u8 | value }*
//! array count u32  | { name str | length u32 | f64* }*
//! ```
//!
//! Strings are `u32` length-prefixed UTF-8. Array names are
//! `"<field>/<harmonic>/<order>"`. A table is only accepted when every
//! header record matches the requested configuration exactly.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::basis::{BasisTable, Field, FieldTable};
use crate::codec::{
    expect_eof, invalid, read_f64, read_f64_array, read_str, read_u32, read_u64, read_u8, write_f64,
    write_f64_slice, write_len, write_str, write_u64, write_u8,
};
use crate::config::{BasisConfig, Geometry};
use crate::error::{Error, Result};
use crate::mapping::{AxisGrid, Mapping};

pub const CACHE_MAGIC: &[u8; 4] = b"BIOR";
pub const CACHE_FORMAT: u8 = 1;
pub const CACHE_VERSION: &str = "1.0";

const TAG_STR: u8 = 0;
const TAG_UNSIGNED: u8 = 1;
const TAG_FLOAT: u8 = 2;
const TAG_BOOL: u8 = 3;

const MAX_RECORDS: u32 = 1024;

const SPHERE_FIELDS: [Field; 3] = [Field::Potential, Field::Density, Field::RadialForce];

#[derive(Debug, Clone, PartialEq)]
pub enum HeaderValue {
    Str(String),
    Unsigned(u64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Str(s) => f.write_str(s),
            HeaderValue::Unsigned(v) => write!(f, "{v}"),
            HeaderValue::Float(v) => write!(f, "{v}"),
            HeaderValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

/// The parameters that determine a table's contents. Parameters that do not
/// apply to the geometry are stored at canonical values so that they never
/// cause spurious mismatches.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHeader {
    pub version: String,
    pub geometry: Geometry,
    pub lmax: usize,
    pub nmax: usize,
    pub numr: usize,
    pub numz: usize,
    pub rmin: f64,
    pub rmax: f64,
    pub zmax: f64,
    pub scale: f64,
    pub rmap: Mapping,
    pub zmap: Mapping,
}

impl CacheHeader {
    pub fn from_config(config: &BasisConfig) -> Self {
        let (numz, zmax, zmap) = match config.geometry {
            Geometry::Sphere => (1, 0.0, Mapping::Identity),
            Geometry::Cylinder => (config.numz, config.zmax, config.zmap),
        };
        Self {
            version: CACHE_VERSION.to_string(),
            geometry: config.geometry,
            lmax: config.lmax,
            nmax: config.nmax,
            numr: config.numr,
            numz,
            rmin: config.rmin,
            rmax: config.rmax,
            zmax,
            scale: config.scale,
            rmap: config.rmap,
            zmap,
        }
    }

    /// Records in file order. `version` always comes first.
    pub fn records(&self) -> Vec<(&'static str, HeaderValue)> {
        vec![
            ("version", HeaderValue::Str(self.version.clone())),
            ("geometry", HeaderValue::Str(self.geometry.tag().to_string())),
            ("lmax", HeaderValue::Unsigned(self.lmax as u64)),
            ("nmax", HeaderValue::Unsigned(self.nmax as u64)),
            ("numr", HeaderValue::Unsigned(self.numr as u64)),
            ("numz", HeaderValue::Unsigned(self.numz as u64)),
            ("rmin", HeaderValue::Float(self.rmin)),
            ("rmax", HeaderValue::Float(self.rmax)),
            ("zmax", HeaderValue::Float(self.zmax)),
            ("scale", HeaderValue::Float(self.scale)),
            ("rmap", HeaderValue::Str(self.rmap.tag().to_string())),
            ("zmap", HeaderValue::Str(self.zmap.tag().to_string())),
            ("two_dimensional", HeaderValue::Bool(self.geometry == Geometry::Cylinder)),
        ]
    }

    /// First record whose cached value differs from this header's.
    fn check_records(&self, cached: &[(String, HeaderValue)]) -> Result<()> {
        let lookup: BTreeMap<&str, &HeaderValue> =
            cached.iter().map(|(k, v)| (k.as_str(), v)).collect();
        for (key, requested) in self.records() {
            match lookup.get(key) {
                Some(found) if **found == requested => {}
                found => {
                    return Err(Error::CacheMismatch {
                        field: key.to_string(),
                        cached: found.map_or_else(|| "<absent>".to_string(), |v| v.to_string()),
                        requested: requested.to_string(),
                    })
                }
            }
        }
        let expected = self.records().len();
        if cached.len() != expected {
            return Err(Error::CacheMismatch {
                field: "record count".to_string(),
                cached: cached.len().to_string(),
                requested: expected.to_string(),
            });
        }
        Ok(())
    }

    pub fn grids(&self) -> Result<(AxisGrid, AxisGrid)> {
        let radial = AxisGrid::new(self.rmap, self.scale, self.rmin, self.rmax, self.numr)?;
        let vertical = match self.geometry {
            Geometry::Sphere => AxisGrid::single(),
            Geometry::Cylinder => AxisGrid::new(self.zmap, self.scale, 0.0, self.zmax, self.numz)?,
        };
        Ok((radial, vertical))
    }

    fn fields(&self) -> &'static [Field] {
        match self.geometry {
            Geometry::Sphere => &SPHERE_FIELDS,
            Geometry::Cylinder => &Field::ALL,
        }
    }
}

/// Write `table` next to `path` and atomically rename it into place, so a
/// concurrent reader sees either the old file or the complete new one.
pub fn save(path: &Path, header: &CacheHeader, table: &BasisTable) -> Result<()> {
    let tmp = temp_path(path);
    let written = File::create(&tmp).and_then(|file| {
        let mut w = BufWriter::new(file);
        write_cache(&mut w, header, table)?;
        let file = w.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()
    });
    if let Err(e) = written {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        Error::Io(e)
    })
}

/// Read a table, accepting it only if its header equals `requested`.
pub fn load(path: &Path, requested: &CacheHeader) -> Result<BasisTable> {
    let mut r = open(path)?;
    let records = read_records(&mut r).map_err(|e| corrupt(path, e))?;
    requested.check_records(&records)?;
    read_table(&mut r, requested).map_err(|e| corrupt(path, e))
}

/// The header of a cache file as strings, without reading the tables.
pub fn inspect(path: &Path) -> Result<BTreeMap<String, String>> {
    let mut r = open(path)?;
    let records = read_records(&mut r).map_err(|e| corrupt(path, e))?;
    Ok(records.into_iter().map(|(k, v)| (k, v.to_string())).collect())
}

fn open(path: &Path) -> Result<BufReader<File>> {
    match File::open(path) {
        Ok(file) => Ok(BufReader::new(file)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(Error::CacheMissing {
            path: path.to_path_buf(),
        }),
        Err(e) => Err(e.into()),
    }
}

fn corrupt(path: &Path, e: io::Error) -> Error {
    Error::CacheCorrupt {
        path: path.to_path_buf(),
        detail: e.to_string(),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(format!(".tmp-{}", std::process::id()));
    path.with_file_name(name)
}

fn array_name(field: Field, harmonic: usize, order: usize) -> String {
    format!("{}/{harmonic}/{order}", field.name())
}

fn write_cache<W: Write>(w: &mut W, header: &CacheHeader, table: &BasisTable) -> io::Result<()> {
    w.write_all(CACHE_MAGIC)?;
    write_u8(w, CACHE_FORMAT)?;

    let records = header.records();
    write_len(w, records.len())?;
    for (key, value) in &records {
        write_str(w, key)?;
        match value {
            HeaderValue::Str(s) => {
                write_u8(w, TAG_STR)?;
                write_str(w, s)?;
            }
            HeaderValue::Unsigned(v) => {
                write_u8(w, TAG_UNSIGNED)?;
                write_u64(w, *v)?;
            }
            HeaderValue::Float(v) => {
                write_u8(w, TAG_FLOAT)?;
                write_f64(w, *v)?;
            }
            HeaderValue::Bool(v) => {
                write_u8(w, TAG_BOOL)?;
                write_u8(w, u8::from(*v))?;
            }
        }
    }

    let fields = header.fields();
    write_len(w, fields.len() * (table.lmax + 1) * table.nmax)?;
    for &field in fields {
        let values = table
            .field(field)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        for h in 0..=table.lmax {
            for n in 0..table.nmax {
                write_str(w, &array_name(field, h, n))?;
                write_f64_slice(w, values.slice(h, n))?;
            }
        }
    }
    w.flush()
}

fn read_records<R: Read>(r: &mut R) -> io::Result<Vec<(String, HeaderValue)>> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    if &magic != CACHE_MAGIC {
        return Err(invalid(format!("bad magic {magic:?}")));
    }
    let format = read_u8(r)?;
    if format != CACHE_FORMAT {
        return Err(invalid(format!("unsupported format {format}")));
    }

    let count = read_u32(r)?;
    if count > MAX_RECORDS {
        return Err(invalid(format!("implausible record count {count}")));
    }
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let key = read_str(r)?;
        let value = match read_u8(r)? {
            TAG_STR => HeaderValue::Str(read_str(r)?),
            TAG_UNSIGNED => HeaderValue::Unsigned(read_u64(r)?),
            TAG_FLOAT => HeaderValue::Float(read_f64(r)?),
            TAG_BOOL => HeaderValue::Bool(read_u8(r)? != 0),
            tag => return Err(invalid(format!("unknown value tag {tag} for '{key}'"))),
        };
        records.push((key, value));
    }
    Ok(records)
}

fn read_table<R: Read>(r: &mut R, header: &CacheHeader) -> io::Result<BasisTable> {
    let (radial, vertical) = header.grids().map_err(|e| invalid(e.to_string()))?;
    let grid_len = radial.num * vertical.num;
    let harmonics = header.lmax + 1;
    let fields = header.fields();

    let count = read_u32(r)? as usize;
    let expected = fields.len() * harmonics * header.nmax;
    if count != expected {
        return Err(invalid(format!("{count} arrays, expected {expected}")));
    }

    let mut tables = Vec::with_capacity(fields.len());
    for &field in fields {
        let mut table = FieldTable::zeros(harmonics, header.nmax, grid_len);
        for h in 0..harmonics {
            for n in 0..header.nmax {
                let name = read_str(r)?;
                let want = array_name(field, h, n);
                if name != want {
                    return Err(invalid(format!("found array '{name}' where '{want}' belongs")));
                }
                let values = read_f64_array(r, grid_len)?;
                table.slice_mut(h, n).copy_from_slice(&values);
            }
        }
        tables.push(table);
    }
    expect_eof(r)?;

    let mut tables = tables.into_iter();
    let mut next = || tables.next().ok_or_else(|| invalid("missing field table".to_string()));
    let potential = next()?;
    let density = next()?;
    let rforce = next()?;
    let zforce = match header.geometry {
        Geometry::Sphere => None,
        Geometry::Cylinder => Some(next()?),
    };

    Ok(BasisTable {
        geometry: header.geometry,
        lmax: header.lmax,
        nmax: header.nmax,
        radial,
        vertical,
        potential,
        density,
        rforce,
        zforce,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn scratch_path(tag: &str) -> PathBuf {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        let n = NEXT.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!("biorth-cache-{}-{tag}-{n}.bin", std::process::id()))
    }

    fn small_config(geometry: Geometry) -> BasisConfig {
        BasisConfig {
            geometry,
            lmax: 1,
            nmax: 2,
            numr: 6,
            numz: 4,
            zmax: 0.5,
            ..BasisConfig::default()
        }
    }

    fn synthetic_table(header: &CacheHeader) -> BasisTable {
        let (radial, vertical) = header.grids().unwrap();
        let grid_len = radial.num * vertical.num;
        let fill = |offset: f64| {
            let mut t = FieldTable::zeros(header.lmax + 1, header.nmax, grid_len);
            for h in 0..=header.lmax {
                for n in 0..header.nmax {
                    for (g, v) in t.slice_mut(h, n).iter_mut().enumerate() {
                        *v = offset + (h * 100 + n * 10) as f64 + g as f64 / 7.0;
                    }
                }
            }
            t
        };
        BasisTable {
            geometry: header.geometry,
            lmax: header.lmax,
            nmax: header.nmax,
            radial,
            vertical,
            potential: fill(-1.0),
            density: fill(2.0),
            rforce: fill(3.0),
            zforce: (header.geometry == Geometry::Cylinder).then(|| fill(4.0)),
        }
    }

    #[test]
    fn save_then_load_is_exact() {
        for geometry in [Geometry::Sphere, Geometry::Cylinder] {
            let header = CacheHeader::from_config(&small_config(geometry));
            let table = synthetic_table(&header);
            let path = scratch_path("exact");
            save(&path, &header, &table).unwrap();
            let loaded = load(&path, &header).unwrap();
            assert_eq!(loaded, table);
            fs::remove_file(&path).unwrap();
        }
    }

    #[test]
    fn every_header_field_is_checked() {
        let header = CacheHeader::from_config(&small_config(Geometry::Cylinder));
        let table = synthetic_table(&header);
        let path = scratch_path("mismatch");
        save(&path, &header, &table).unwrap();

        let variants: Vec<(&str, Box<dyn Fn(&mut BasisConfig)>)> = vec![
            ("geometry", Box::new(|c: &mut BasisConfig| c.geometry = Geometry::Sphere)),
            ("lmax", Box::new(|c: &mut BasisConfig| c.lmax = 2)),
            ("nmax", Box::new(|c: &mut BasisConfig| c.nmax = 3)),
            ("numr", Box::new(|c: &mut BasisConfig| c.numr = 7)),
            ("numz", Box::new(|c: &mut BasisConfig| c.numz = 5)),
            ("rmin", Box::new(|c: &mut BasisConfig| c.rmin = 0.1)),
            ("rmax", Box::new(|c: &mut BasisConfig| c.rmax = 2.0)),
            ("zmax", Box::new(|c: &mut BasisConfig| c.zmax = 0.75)),
            ("scale", Box::new(|c: &mut BasisConfig| c.scale = 0.5)),
            ("rmap", Box::new(|c: &mut BasisConfig| c.rmap = Mapping::Identity)),
            ("zmap", Box::new(|c: &mut BasisConfig| c.zmap = Mapping::Identity)),
        ];
        for (key, change) in variants {
            let mut config = small_config(Geometry::Cylinder);
            change(&mut config);
            let requested = CacheHeader::from_config(&config);
            match load(&path, &requested) {
                Err(Error::CacheMismatch { field, .. }) => assert_eq!(field, key),
                other => panic!("{key}: expected mismatch, got {other:?}"),
            }
        }
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn version_mismatch_is_reported() {
        let header = CacheHeader::from_config(&small_config(Geometry::Sphere));
        let path = scratch_path("version");
        save(&path, &header, &synthetic_table(&header)).unwrap();
        let mut requested = header.clone();
        requested.version = "2.0".to_string();
        let err = load(&path, &requested).unwrap_err();
        assert!(matches!(err, Error::CacheMismatch { ref field, .. } if field == "version"));
        assert!(err.is_recoverable());
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn sphere_header_ignores_vertical_settings() {
        let a = small_config(Geometry::Sphere);
        let mut b = a.clone();
        b.numz = 99;
        b.zmax = 7.0;
        b.zmap = Mapping::Log;
        assert_eq!(CacheHeader::from_config(&a), CacheHeader::from_config(&b));
    }

    #[test]
    fn missing_and_corrupt_files_are_distinguished() {
        let header = CacheHeader::from_config(&small_config(Geometry::Sphere));
        let path = scratch_path("missing");
        assert!(matches!(load(&path, &header), Err(Error::CacheMissing { .. })));

        save(&path, &header, &synthetic_table(&header)).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();
        assert!(matches!(load(&path, &header), Err(Error::CacheCorrupt { .. })));

        fs::write(&path, b"not a cache").unwrap();
        assert!(matches!(load(&path, &header), Err(Error::CacheCorrupt { .. })));
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn inspect_reports_header_as_strings() {
        let header = CacheHeader::from_config(&small_config(Geometry::Cylinder));
        let path = scratch_path("inspect");
        save(&path, &header, &synthetic_table(&header)).unwrap();
        let info = inspect(&path).unwrap();
        assert_eq!(info["version"], CACHE_VERSION);
        assert_eq!(info["geometry"], "cylinder");
        assert_eq!(info["numz"], "4");
        assert_eq!(info["zmax"], "0.5");
        assert_eq!(info["rmap"], "rational");
        assert_eq!(info["two_dimensional"], "true");
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn temp_file_does_not_linger() {
        let header = CacheHeader::from_config(&small_config(Geometry::Sphere));
        let path = scratch_path("tmp");
        save(&path, &header, &synthetic_table(&header)).unwrap();
        assert!(!temp_path(&path).exists());
        fs::remove_file(&path).unwrap();
    }
}
