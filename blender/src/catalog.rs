//! Galaxy catalog loading, filtering and train/test partitioning.
//!
//! The catalog is one row per postage stamp, keyed by row order matching the
//! stamp cubes. Filtering never mutates in place: it produces a new catalog
//! with a reset, contiguous index space, which invalidates any previously
//! computed partition.

use std::fmt;
use std::path::Path;

use clap::ValueEnum;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Deserialize;
use thiserror::Error;

/// Magnitude zero point of the reference survey imaging.
pub const DEFAULT_ZEROPOINT: f64 = 25.96;

/// Errors raised while loading or validating a galaxy catalog.
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("failed to read catalog: {0}")]
    Csv(#[from] csv::Error),
    #[error("catalog has {catalog} rows but the stamp store holds {stamps} stamps")]
    StampCountMismatch { catalog: usize, stamps: usize },
}

/// Visual morphology classes of the reference survey.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Morphology {
    /// Irregular
    Irr,
    /// Disk-dominated
    Disk,
    /// Spheroid-dominated
    Sph,
    /// Spheroid plus disk
    Sphd,
}

impl fmt::Display for Morphology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Morphology::Irr => "irr",
            Morphology::Disk => "disk",
            Morphology::Sph => "sph",
            Morphology::Sphd => "sphd",
        };
        write!(f, "{}", name)
    }
}

/// One galaxy entry, tied to the stamp at row `cat_index` of the store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GalaxyRecord {
    /// Row index into the current catalog and stamp store.
    pub cat_index: usize,
    /// Survey identifier of the galaxy.
    pub id: u64,
    /// Apparent magnitude.
    pub mag: f64,
    /// Effective radius in pixels.
    pub radius: f64,
    /// Redshift.
    pub z: f64,
    /// Morphology class.
    pub galtype: Morphology,
    /// Quality flag from the source catalog, 1 for clean detections.
    /// `None` when the catalog carries no such column.
    pub clean_flag: Option<u8>,
}

#[derive(Debug, Deserialize)]
struct CatalogRow {
    #[serde(rename = "ID")]
    id: u64,
    mag: f64,
    radius: f64,
    z: f64,
    galtype: Morphology,
    #[serde(default)]
    clean_flag: Option<u8>,
}

/// Immutable galaxy catalog with contiguous row indexing.
#[derive(Debug, Clone)]
pub struct Catalog {
    records: Vec<GalaxyRecord>,
}

impl Catalog {
    /// Build a catalog from pre-assembled records, re-indexing them to the
    /// contiguous range `0..len`.
    pub fn from_records(records: impl IntoIterator<Item = GalaxyRecord>) -> Self {
        let records = records
            .into_iter()
            .enumerate()
            .map(|(cat_index, record)| GalaxyRecord { cat_index, ..record })
            .collect();
        Catalog { records }
    }

    /// Load a catalog from a delimited file with at least the columns
    /// `ID, mag, radius, z, galtype`; extra columns are ignored.
    pub fn from_csv(path: impl AsRef<Path>) -> Result<Self, CatalogError> {
        let mut reader = csv::Reader::from_path(path.as_ref())?;
        let mut records = Vec::new();
        for (cat_index, row) in reader.deserialize().enumerate() {
            let row: CatalogRow = row?;
            records.push(GalaxyRecord {
                cat_index,
                id: row.id,
                mag: row.mag,
                radius: row.radius,
                z: row.z,
                galtype: row.galtype,
                clean_flag: row.clean_flag,
            });
        }
        Ok(Catalog { records })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record at row `index`. Panics on out-of-range indices, which can only
    /// come from a stale partition.
    pub fn get(&self, index: usize) -> GalaxyRecord {
        self.records[index]
    }

    pub fn records(&self) -> &[GalaxyRecord] {
        &self.records
    }

    /// New catalog keeping the records matching `keep`, re-indexed to a
    /// contiguous range. Any partition computed for the old catalog is
    /// invalid afterwards and must be recomputed.
    pub fn filter(&self, keep: impl Fn(&GalaxyRecord) -> bool) -> Catalog {
        Catalog::from_records(self.records.iter().copied().filter(|r| keep(r)))
    }

    /// Boolean row mask for `keep`, aligned with the stamp store.
    pub fn mask(&self, keep: impl Fn(&GalaxyRecord) -> bool) -> Vec<bool> {
        self.records.iter().map(keep).collect()
    }

    /// Check that the catalog is aligned with a stamp store of `stamps`
    /// entries. Done once, eagerly, at load time.
    pub fn validate_stamp_count(&self, stamps: usize) -> Result<(), CatalogError> {
        if self.records.len() != stamps {
            return Err(CatalogError::StampCountMismatch {
                catalog: self.records.len(),
                stamps,
            });
        }
        Ok(())
    }
}

/// Train/test split of catalog row indices.
///
/// Computed as a pure function of `(len, test_ratio, seed)`: a uniform
/// random permutation of `0..len` cut at the requested ratio. Recompute it
/// whenever the catalog is filtered; it is never updated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

impl Partition {
    pub fn split(len: usize, test_ratio: f64, seed: u64) -> Partition {
        let mut indices: Vec<usize> = (0..len).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        indices.shuffle(&mut rng);
        let n_test = ((test_ratio * len as f64) as usize).min(len);
        let test = indices[..n_test].to_vec();
        let train = indices[n_test..].to_vec();
        Partition { train, test }
    }
}

/// Convert an apparent magnitude to flux at the given zero point.
pub fn mag_to_flux(mag: f64, zeropoint: f64) -> f64 {
    10f64.powf(-0.4 * (mag - zeropoint))
}
