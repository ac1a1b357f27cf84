//! Dense storage for tabulated basis fields.

use serde::{Deserialize, Serialize};

use crate::config::Geometry;
use crate::error::{Error, Result};
use crate::mapping::AxisGrid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Potential,
    Density,
    RadialForce,
    VerticalForce,
}

impl Field {
    pub const ALL: [Field; 4] = [
        Field::Potential,
        Field::Density,
        Field::RadialForce,
        Field::VerticalForce,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Field::Potential => "potential",
            Field::Density => "density",
            Field::RadialForce => "rforce",
            Field::VerticalForce => "zforce",
        }
    }

    /// Odd under reflection through the midplane.
    pub fn is_odd(self) -> bool {
        matches!(self, Field::VerticalForce)
    }
}

/// One field for every `(harmonic, order)` pair, each over the whole grid.
/// Grid points are stored radial-major: `i * numz + j`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldTable {
    harmonics: usize,
    orders: usize,
    grid_len: usize,
    data: Vec<f64>,
}

impl FieldTable {
    pub fn zeros(harmonics: usize, orders: usize, grid_len: usize) -> Self {
        Self {
            harmonics,
            orders,
            grid_len,
            data: vec![0.0; harmonics * orders * grid_len],
        }
    }

    /// Assemble from per-harmonic blocks of `orders * grid_len` values.
    pub fn from_blocks(orders: usize, grid_len: usize, blocks: Vec<Vec<f64>>) -> Result<Self> {
        let harmonics = blocks.len();
        let mut data = Vec::with_capacity(harmonics * orders * grid_len);
        for block in blocks {
            if block.len() != orders * grid_len {
                return Err(Error::SizeMismatch {
                    what: "harmonic block",
                    expected: orders * grid_len,
                    found: block.len(),
                });
            }
            data.extend(block);
        }
        Ok(Self {
            harmonics,
            orders,
            grid_len,
            data,
        })
    }

    pub fn harmonics(&self) -> usize {
        self.harmonics
    }

    pub fn orders(&self) -> usize {
        self.orders
    }

    pub fn grid_len(&self) -> usize {
        self.grid_len
    }

    pub fn slice(&self, harmonic: usize, order: usize) -> &[f64] {
        let start = (harmonic * self.orders + order) * self.grid_len;
        &self.data[start..start + self.grid_len]
    }

    pub fn slice_mut(&mut self, harmonic: usize, order: usize) -> &mut [f64] {
        let start = (harmonic * self.orders + order) * self.grid_len;
        &mut self.data[start..start + self.grid_len]
    }
}

/// `[field][harmonic][order][grid point]`, immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct BasisTable {
    pub geometry: Geometry,
    pub lmax: usize,
    pub nmax: usize,
    pub radial: AxisGrid,
    /// Single-node axis for one-dimensional tables.
    pub vertical: AxisGrid,
    pub potential: FieldTable,
    pub density: FieldTable,
    pub rforce: FieldTable,
    pub zforce: Option<FieldTable>,
}

impl BasisTable {
    pub fn grid_len(&self) -> usize {
        self.radial.num * self.vertical.num
    }

    pub fn is_two_dimensional(&self) -> bool {
        !self.vertical.is_single()
    }

    pub fn field(&self, field: Field) -> Result<&FieldTable> {
        match field {
            Field::Potential => Ok(&self.potential),
            Field::Density => Ok(&self.density),
            Field::RadialForce => Ok(&self.rforce),
            Field::VerticalForce => self.zforce.as_ref().ok_or(Error::MissingField { field }),
        }
    }

    /// Fields present in this table, in storage order.
    pub fn fields(&self) -> Vec<Field> {
        Field::ALL
            .into_iter()
            .filter(|f| self.field(*f).is_ok())
            .collect()
    }

    pub fn check_index(&self, harmonic: usize, order: usize) -> Result<()> {
        if harmonic > self.lmax {
            return Err(Error::LevelIndexOutOfRange {
                what: "harmonic",
                index: harmonic,
                limit: self.lmax,
            });
        }
        if order >= self.nmax {
            return Err(Error::LevelIndexOutOfRange {
                what: "radial order",
                index: order,
                limit: self.nmax - 1,
            });
        }
        Ok(())
    }
}
