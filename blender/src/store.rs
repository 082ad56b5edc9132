//! Stamp storage and per-blend persistence.
//!
//! Input stamps live in two parallel FITS cubes, `(n, S, S)` images and
//! `(n, S, S)` segmentation maps, aligned by row with the galaxy catalog.
//! Outputs are one image file and one label file per blend plus one row per
//! blend in a delimited catalog.

use std::fs::File;
use std::path::{Path, PathBuf};

use fitsio::images::{ImageDescription, ImageType};
use fitsio::FitsFile;
use ndarray::{Array3, ArrayD, Axis};
use thiserror::Error;

use crate::blend::Blend;
use crate::catalog::GalaxyRecord;

/// Column layout of the blend catalog.
pub const CATALOG_HEADER: [&str; 14] = [
    "id", "distance", "shift_x", "shift_y", "g1_id", "g1_mag", "g1_rad", "g1_z", "g1_type",
    "g2_id", "g2_mag", "g2_rad", "g2_z", "g2_type",
];

/// Errors raised while reading stamp cubes or persisting blends.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("FITS I/O error: {0}")]
    Fits(#[from] fitsio::errors::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog output error: {0}")]
    Csv(#[from] csv::Error),
    #[error("expected a 3-dimensional stamp cube, got {0} dimensions")]
    NotACube(usize),
    #[error("stamps must be square, got {height}x{width}")]
    NotSquare { height: usize, width: usize },
    #[error("image cube is {images:?} but segmentation cube is {segmaps:?}")]
    ShapeMismatch { images: Vec<usize>, segmaps: Vec<usize> },
}

/// In-memory store of galaxy stamps and their segmentation maps.
///
/// Shape agreement between the two cubes is checked once at construction;
/// accessors hand out owned copies of single stamps.
#[derive(Debug, Clone)]
pub struct StampStore {
    images: Array3<f32>,
    segmaps: Array3<u8>,
}

impl StampStore {
    pub fn new(images: Array3<f32>, segmaps: Array3<u8>) -> Result<Self, StoreError> {
        if images.dim() != segmaps.dim() {
            return Err(StoreError::ShapeMismatch {
                images: images.shape().to_vec(),
                segmaps: segmaps.shape().to_vec(),
            });
        }
        let (_, height, width) = images.dim();
        if height != width {
            return Err(StoreError::NotSquare { height, width });
        }
        Ok(StampStore { images, segmaps })
    }

    /// Load the image and segmentation cubes from two FITS files.
    pub fn from_fits(
        image_path: impl AsRef<Path>,
        segmap_path: impl AsRef<Path>,
    ) -> Result<Self, StoreError> {
        let images: Array3<f32> = read_cube(image_path.as_ref())?;
        let segmaps: Array3<u8> = read_cube(segmap_path.as_ref())?;
        StampStore::new(images, segmaps)
    }

    /// Number of stamps held.
    pub fn len(&self) -> usize {
        self.images.len_of(Axis(0))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Side length of one stamp in pixels.
    pub fn stamp_size(&self) -> usize {
        self.images.len_of(Axis(1))
    }

    /// Owned copy of the stamp at `index`.
    pub fn image(&self, index: usize) -> ndarray::Array2<f32> {
        self.images.index_axis(Axis(0), index).to_owned()
    }

    /// Owned copy of the segmentation map at `index`.
    pub fn segmap(&self, index: usize) -> ndarray::Array2<u8> {
        self.segmaps.index_axis(Axis(0), index).to_owned()
    }

    /// New store keeping only the rows flagged in `keep`, preserving order.
    /// Mirrors catalog filtering so both stay row-aligned.
    pub fn select(&self, keep: &[bool]) -> StampStore {
        let rows: Vec<usize> =
            keep.iter().enumerate().filter_map(|(i, &k)| k.then_some(i)).collect();
        let images = self.images.select(Axis(0), &rows);
        let segmaps = self.segmaps.select(Axis(0), &rows);
        StampStore { images, segmaps }
    }
}

fn read_cube<T>(path: &Path) -> Result<Array3<T>, StoreError>
where
    ArrayD<T>: fitsio::images::ReadImage,
{
    let mut fptr = FitsFile::open(path)?;
    let hdu = fptr.primary_hdu()?;
    let data: ArrayD<T> = hdu.read_image(&mut fptr)?;
    let ndim = data.ndim();
    data.into_dimensionality::<ndarray::Ix3>()
        .map_err(|_| StoreError::NotACube(ndim))
}

/// Writes blends of one split (train or test) to disk: per-blend FITS image
/// and label files named `{prefix}_blend_{idx:06}` and
/// `{prefix}_blend_seg_{idx:06}`, plus the blend catalog CSV.
pub struct BlendWriter {
    outdir: PathBuf,
    prefix: String,
    catalog: csv::Writer<File>,
}

impl BlendWriter {
    /// Create the writer and emit the catalog header.
    pub fn create(outdir: impl AsRef<Path>, prefix: &str) -> Result<Self, StoreError> {
        let outdir = outdir.as_ref().to_path_buf();
        std::fs::create_dir_all(&outdir)?;
        let catalog_path = outdir.join(format!("{}_blend_cat.csv", prefix));
        let mut catalog = csv::Writer::from_path(&catalog_path)?;
        catalog.write_record(CATALOG_HEADER)?;
        Ok(BlendWriter { outdir, prefix: prefix.to_string(), catalog })
    }

    /// Persist one blend under the given sequential index.
    pub fn write(&mut self, blend: &Blend, index: usize) -> Result<(), StoreError> {
        let image_path = self.outdir.join(format!("{}_blend_{:06}.fits", self.prefix, index));
        let seg_path = self.outdir.join(format!("{}_blend_seg_{:06}.fits", self.prefix, index));
        write_image(&image_path, &blend.image)?;
        write_segmap(&seg_path, &blend.segmap)?;
        self.catalog.write_record(blend_row(blend, index))?;
        self.catalog.flush()?;
        Ok(())
    }
}

fn write_image(path: &Path, cube: &Array3<f32>) -> Result<(), StoreError> {
    let description = ImageDescription {
        data_type: ImageType::Float,
        dimensions: cube.shape(),
    };
    let mut fptr = FitsFile::create(path).with_custom_primary(&description).open()?;
    let hdu = fptr.primary_hdu()?;
    let flat: Vec<f32> = cube.iter().copied().collect();
    hdu.write_image(&mut fptr, &flat)?;
    Ok(())
}

fn write_segmap(path: &Path, cube: &Array3<u8>) -> Result<(), StoreError> {
    let description = ImageDescription {
        data_type: ImageType::UnsignedByte,
        dimensions: cube.shape(),
    };
    let mut fptr = FitsFile::create(path).with_custom_primary(&description).open()?;
    let hdu = fptr.primary_hdu()?;
    let flat: Vec<u8> = cube.iter().copied().collect();
    hdu.write_image(&mut fptr, &flat)?;
    Ok(())
}

fn galaxy_fields(galaxy: &GalaxyRecord) -> [String; 5] {
    [
        format!("{}", galaxy.id),
        format!("{:.6}", galaxy.mag),
        format!("{:.6}", galaxy.radius),
        format!("{:.6}", galaxy.z),
        format!("{}", galaxy.galtype),
    ]
}

/// One catalog row for a blend: its index, the separation of the pair, the
/// offset components and both galaxy descriptions.
pub fn blend_row(blend: &Blend, index: usize) -> Vec<String> {
    let mut row = vec![
        format!("{}", index),
        format!("{:.6}", blend.shift.norm()),
        format!("{}", blend.shift.dx),
        format!("{}", blend.shift.dy),
    ];
    row.extend(galaxy_fields(&blend.central));
    row.extend(galaxy_fields(&blend.companion));
    row
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Morphology;
    use crate::placement::Displacement;
    use ndarray::Array3;

    fn store(n: usize, size: usize) -> StampStore {
        let images = Array3::from_shape_fn((n, size, size), |(i, y, x)| (i + y + x) as f32);
        let segmaps = Array3::from_shape_fn((n, size, size), |(i, _, _)| i as u8);
        StampStore::new(images, segmaps).unwrap()
    }

    fn record(id: u64) -> GalaxyRecord {
        GalaxyRecord {
            cat_index: 0,
            id,
            mag: 21.25,
            radius: 3.5,
            z: 0.8,
            galtype: Morphology::Sphd,
            clean_flag: Some(1),
        }
    }

    #[test]
    fn test_new_rejects_shape_mismatch() {
        let images = Array3::<f32>::zeros((3, 8, 8));
        let segmaps = Array3::<u8>::zeros((3, 8, 4));
        assert!(matches!(
            StampStore::new(images, segmaps),
            Err(StoreError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_new_rejects_non_square_stamps() {
        let images = Array3::<f32>::zeros((3, 8, 4));
        let segmaps = Array3::<u8>::zeros((3, 8, 4));
        assert!(matches!(
            StampStore::new(images, segmaps),
            Err(StoreError::NotSquare { height: 8, width: 4 })
        ));
    }

    #[test]
    fn test_select_keeps_flagged_rows_in_order() {
        let store = store(4, 8);
        let kept = store.select(&[true, false, true, false]);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept.segmap(0)[[0, 0]], 0);
        assert_eq!(kept.segmap(1)[[0, 0]], 2);
        assert_eq!(kept.stamp_size(), 8);
    }

    #[test]
    fn test_accessors_return_copies() {
        let store = store(2, 8);
        let mut stamp = store.image(1);
        stamp[[0, 0]] = -1.0;
        assert_eq!(store.image(1)[[0, 0]], 1.0);
    }

    #[test]
    fn test_blend_row_layout() {
        let blend = Blend {
            image: Array3::zeros((8, 8, 2)),
            segmap: Array3::zeros((2, 8, 8)),
            central: record(7),
            companion: record(9),
            shift: Displacement { dy: 3, dx: -4 },
        };
        let row = blend_row(&blend, 12);
        assert_eq!(row.len(), CATALOG_HEADER.len());
        assert_eq!(row[0], "12");
        assert_eq!(row[1], "5.000000");
        assert_eq!(row[2], "-4");
        assert_eq!(row[3], "3");
        assert_eq!(row[4], "7");
        assert_eq!(row[8], "sphd");
        assert_eq!(row[9], "9");
    }

    #[test]
    fn test_writer_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let blend = Blend {
            image: Array3::from_elem((8, 8, 2), 1.5f32),
            segmap: Array3::from_elem((2, 8, 8), 1u8),
            central: record(7),
            companion: record(9),
            shift: Displacement { dy: 0, dx: 3 },
        };
        let mut writer = BlendWriter::create(dir.path(), "train").unwrap();
        writer.write(&blend, 0).unwrap();

        assert!(dir.path().join("train_blend_000000.fits").exists());
        assert!(dir.path().join("train_blend_seg_000000.fits").exists());
        let catalog = std::fs::read_to_string(dir.path().join("train_blend_cat.csv")).unwrap();
        let mut lines = catalog.lines();
        assert_eq!(lines.next().unwrap(), CATALOG_HEADER.join(","));
        assert!(lines.next().unwrap().starts_with("0,3.000000,3,0,7,"));

        let restored: Array3<f32> =
            read_cube(&dir.path().join("train_blend_000000.fits")).unwrap();
        assert_eq!(restored.dim(), (8, 8, 2));
        assert_eq!(restored[[4, 4, 1]], 1.5);
    }
}
