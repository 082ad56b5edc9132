//! Blend construction engine.
//!
//! A [`Blender`] owns the stamp store, the galaxy catalog, the train/test
//! partition and one seeded random generator, and turns magnitude-matched
//! galaxy pairs into two-channel blend cubes. All randomness flows through
//! the engine's generator in a fixed order (pair sampling before placement
//! sampling for each attempt), so a given seed reproduces the exact same
//! sequence of blends. Parallel producers should each own their own engine
//! with a distinct seed.

use log::info;
use ndarray::{s, Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use crate::catalog::{Catalog, CatalogError, GalaxyRecord, Partition};
use crate::geometry::shift;
use crate::placement::{sample_offset, Displacement};
use crate::segmap::{
    central_label, central_source_map, mask_out_pixels, normalize_segmap, MaskFill,
    DILATION_ITERATIONS,
};
use crate::store::StampStore;

/// Retry budget for drawing a magnitude-matched companion. The reference
/// pipeline retried forever, which hangs on catalogs where some galaxy has
/// no neighbour in magnitude; a generous bound with an explicit error is
/// the safer default.
pub const PAIR_TRIES: usize = 10_000;

/// Errors raised while sampling and composing blends.
#[derive(Error, Debug)]
pub enum BlendError {
    /// No valid displacement found within the attempt budget. Recoverable:
    /// the orchestrator resamples a fresh pair.
    #[error("no valid displacement for galaxies {central} and {companion}")]
    Placement { central: u64, companion: u64 },
    /// The held-out partition was requested but none was configured.
    #[error("test partition requested but no galaxies are held out")]
    PartitionUnavailable,
    /// The catalog holds no galaxies (typically after over-aggressive cuts).
    #[error("catalog holds no galaxies to sample from")]
    EmptyCatalog,
    /// No companion close enough in magnitude within the retry budget.
    #[error("no companion within {tolerance} mag of galaxy {id} after {attempts} attempts")]
    NoMagnitudeMatch { id: u64, tolerance: f64, attempts: usize },
}

/// Tunables of the blend engine.
#[derive(Debug, Clone, Copy)]
pub struct BlendConfig {
    /// Maximum magnitude difference between the two galaxies of a pair.
    pub magnitude_tolerance: f64,
    /// Maximum separation as a multiple of the smaller effective radius.
    pub radius_ratio: f64,
    /// Seed of the engine's random generator and of the partition split.
    pub seed: u64,
    /// Fraction of the catalog held out for the test partition.
    pub train_test_ratio: f64,
    /// Erase contaminating neighbours instead of keeping raw stamps.
    pub masking_enabled: bool,
    /// Fill strategy for erased neighbour pixels.
    pub mask_fill: MaskFill,
    /// Scale of the extra global noise realization in synthesized fills.
    pub noise_factor: f32,
}

impl Default for BlendConfig {
    fn default() -> Self {
        BlendConfig {
            magnitude_tolerance: 2.0,
            radius_ratio: 4.0,
            seed: 42,
            train_test_ratio: 0.2,
            masking_enabled: true,
            mask_fill: MaskFill::Synthesized,
            noise_factor: 1.0,
        }
    }
}

/// A composed blend: two image channels (central, shifted companion) and the
/// matching label channels, plus the records and offset that produced them.
///
/// The image cube is `(S, S, 2)` channels-last `f32`; the label cube is
/// `(2, S, S)` channels-first `u8`, mirroring the layouts consumed by the
/// training pipelines downstream.
#[derive(Debug, Clone)]
pub struct Blend {
    pub image: Array3<f32>,
    pub segmap: Array3<u8>,
    pub central: GalaxyRecord,
    pub companion: GalaxyRecord,
    pub shift: Displacement,
}

/// Blend construction engine. See the module docs for the reproducibility
/// contract.
pub struct Blender {
    stamps: StampStore,
    catalog: Catalog,
    partition: Partition,
    config: BlendConfig,
    rng: StdRng,
}

impl Blender {
    /// Build an engine over a stamp store and its catalog.
    ///
    /// Alignment between the catalog and the store is checked eagerly here,
    /// so per-blend operations never fail on malformed inputs.
    pub fn new(
        stamps: StampStore,
        catalog: Catalog,
        config: BlendConfig,
    ) -> Result<Self, CatalogError> {
        catalog.validate_stamp_count(stamps.len())?;
        let partition = Partition::split(catalog.len(), config.train_test_ratio, config.seed);
        let rng = StdRng::seed_from_u64(config.seed);
        Ok(Blender { stamps, catalog, partition, config, rng })
    }

    /// Number of galaxies currently available.
    pub fn n_galaxies(&self) -> usize {
        self.catalog.len()
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn image_size(&self) -> usize {
        self.stamps.stamp_size()
    }

    /// Drop every galaxy not matching `keep`, from the catalog and the
    /// stamp store together, and recompute the train/test partition for the
    /// filtered index space.
    pub fn make_cut(&mut self, keep: impl Fn(&GalaxyRecord) -> bool) {
        let mask = self.catalog.mask(&keep);
        self.stamps = self.stamps.select(&mask);
        self.catalog = self.catalog.filter(&keep);
        self.partition =
            Partition::split(self.catalog.len(), self.config.train_test_ratio, self.config.seed);
    }

    /// Raw stamp and its segmentation map with labels renormalized to small
    /// consecutive integers.
    pub fn original_stamp(&self, galaxy: &GalaxyRecord) -> (Array2<f32>, Array2<u8>) {
        let image = self.stamps.image(galaxy.cat_index);
        let segmap = normalize_segmap(&self.stamps.segmap(galaxy.cat_index));
        (image, segmap)
    }

    /// Stamp with contaminating neighbours erased, and the binary map of
    /// the central source as its label channel.
    pub fn masked_stamp(&mut self, galaxy: &GalaxyRecord) -> (Array2<f32>, Array2<u8>) {
        let image = self.stamps.image(galaxy.cat_index);
        let segmap = self.stamps.segmap(galaxy.cat_index);
        let masked = mask_out_pixels(
            &image,
            &segmap,
            central_label(&segmap),
            self.config.mask_fill,
            self.config.noise_factor,
            DILATION_ITERATIONS,
            &mut self.rng,
        );
        (masked, central_source_map(&segmap))
    }

    /// One galaxy drawn uniformly from the requested partition.
    pub fn random_galaxy(&mut self, from_test: bool) -> Result<GalaxyRecord, BlendError> {
        let pool = if from_test { &self.partition.test } else { &self.partition.train };
        if pool.is_empty() {
            if from_test {
                return Err(BlendError::PartitionUnavailable);
            }
            return Err(BlendError::EmptyCatalog);
        }
        let index = pool[self.rng.random_range(0..pool.len())];
        Ok(self.catalog.get(index))
    }

    /// A magnitude-matched galaxy pair from the requested partition.
    ///
    /// Draws are with replacement, so a galaxy can be paired with itself,
    /// as in the reference pipeline.
    /// Both draws come from the same partition, including retries; the
    /// historical behaviour of falling back to the training partition on
    /// retry was an inconsistency and is not reproduced.
    pub fn random_pair(
        &mut self,
        from_test: bool,
    ) -> Result<(GalaxyRecord, GalaxyRecord), BlendError> {
        let first = self.random_galaxy(from_test)?;
        for _ in 0..PAIR_TRIES {
            let second = self.random_galaxy(from_test)?;
            if (first.mag - second.mag).abs() < self.config.magnitude_tolerance {
                return Ok((first, second));
            }
        }
        Err(BlendError::NoMagnitudeMatch {
            id: first.id,
            tolerance: self.config.magnitude_tolerance,
            attempts: PAIR_TRIES,
        })
    }

    /// Compose a blend from a specific galaxy pair.
    ///
    /// Placement failure is propagated, never retried here; resampling a
    /// fresh pair is the orchestrator's responsibility, keeping this step
    /// pure with respect to the generator stream.
    pub fn compose(
        &mut self,
        central: &GalaxyRecord,
        companion: &GalaxyRecord,
    ) -> Result<Blend, BlendError> {
        let ((image1, seg1), (image2, seg2)) = if self.config.masking_enabled {
            (self.masked_stamp(central), self.masked_stamp(companion))
        } else {
            (self.original_stamp(central), self.original_stamp(companion))
        };

        let offset = sample_offset(
            &mut self.rng,
            central,
            companion,
            self.config.radius_ratio,
            self.stamps.stamp_size(),
        )
        .ok_or(BlendError::Placement { central: central.id, companion: companion.id })?;

        let image2 = shift(&image2.view(), offset);
        let seg2 = shift(&seg2.view(), offset);

        let size = self.stamps.stamp_size();
        let mut image = Array3::<f32>::zeros((size, size, 2));
        image.slice_mut(s![.., .., 0]).assign(&image1);
        image.slice_mut(s![.., .., 1]).assign(&image2);
        let mut segmap = Array3::<u8>::zeros((2, size, size));
        segmap.slice_mut(s![0, .., ..]).assign(&seg1);
        segmap.slice_mut(s![1, .., ..]).assign(&seg2);

        Ok(Blend {
            image,
            segmap,
            central: *central,
            companion: *companion,
            shift: offset,
        })
    }

    /// Produce the next blend from the requested partition.
    ///
    /// Placement failures are logged with the offending pair and absorbed
    /// by resampling a fresh pair; partition and pairing errors propagate.
    pub fn next_blend(&mut self, from_test: bool) -> Result<Blend, BlendError> {
        loop {
            let (central, companion) = self.random_pair(from_test)?;
            match self.compose(&central, &companion) {
                Ok(blend) => return Ok(blend),
                Err(BlendError::Placement { central, companion }) => {
                    info!(
                        "no valid displacement for galaxies {} and {}, resampling pair",
                        central, companion
                    );
                }
                Err(other) => return Err(other),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn flat_store(n: usize, size: usize) -> StampStore {
        // One uniform source label per stamp so masking is the identity.
        let images = Array3::from_shape_fn((n, size, size), |(i, y, x)| {
            (i + 1) as f32 * 0.001 * (y * size + x) as f32
        });
        let segmaps = Array3::<u8>::from_elem((n, size, size), 1);
        StampStore::new(images, segmaps).unwrap()
    }

    fn record(cat_index: usize, id: u64, mag: f64, radius: f64) -> GalaxyRecord {
        GalaxyRecord {
            cat_index,
            id,
            mag,
            radius,
            z: 0.9,
            galtype: crate::catalog::Morphology::Sph,
            clean_flag: Some(1),
        }
    }

    fn test_catalog(n: usize) -> Catalog {
        Catalog::from_records((0..n).map(|i| record(i, 100 + i as u64, 21.0 + (i % 3) as f64, 3.0)))
    }

    fn test_config() -> BlendConfig {
        BlendConfig { noise_factor: 0.0, ..BlendConfig::default() }
    }

    #[test]
    fn test_new_rejects_misaligned_inputs() {
        let result = Blender::new(flat_store(4, 32), test_catalog(7), test_config());
        assert!(matches!(
            result,
            Err(CatalogError::StampCountMismatch { catalog: 7, stamps: 4 })
        ));
    }

    #[test]
    fn test_random_pair_respects_tolerance() {
        let mut blender = Blender::new(flat_store(30, 32), test_catalog(30), test_config()).unwrap();
        for _ in 0..50 {
            let (g1, g2) = blender.random_pair(false).unwrap();
            assert!((g1.mag - g2.mag).abs() < blender.config.magnitude_tolerance);
        }
    }

    #[test]
    fn test_pairing_fails_when_no_match_exists() {
        // Draws are with replacement, so any positive tolerance is satisfied
        // as soon as the same record comes up twice. A strict zero tolerance
        // rejects every candidate and genuinely exhausts the budget.
        let catalog = Catalog::from_records([
            record(0, 1, 18.0, 3.0),
            record(1, 2, 23.0, 3.0),
        ]);
        let config = BlendConfig {
            magnitude_tolerance: 0.0,
            train_test_ratio: 0.0,
            ..test_config()
        };
        let mut blender = Blender::new(flat_store(2, 32), catalog, config).unwrap();
        assert!(matches!(
            blender.random_pair(false),
            Err(BlendError::NoMagnitudeMatch { .. })
        ));
    }

    #[test]
    fn test_random_pair_may_pair_a_galaxy_with_itself() {
        // With mags five apart and a tolerance of one, the only acceptable
        // companion for either galaxy is itself.
        let catalog = Catalog::from_records([
            record(0, 1, 18.0, 3.0),
            record(1, 2, 23.0, 3.0),
        ]);
        let config = BlendConfig {
            magnitude_tolerance: 1.0,
            train_test_ratio: 0.0,
            ..test_config()
        };
        let mut blender = Blender::new(flat_store(2, 32), catalog, config).unwrap();
        let (g1, g2) = blender.random_pair(false).unwrap();
        assert_eq!(g1.id, g2.id);
    }

    #[test]
    fn test_test_partition_unconfigured_is_an_error() {
        let config = BlendConfig { train_test_ratio: 0.0, ..test_config() };
        let mut blender = Blender::new(flat_store(10, 32), test_catalog(10), config).unwrap();
        assert!(matches!(
            blender.random_galaxy(true),
            Err(BlendError::PartitionUnavailable)
        ));
    }

    #[test]
    fn test_make_cut_recomputes_partition_and_store() {
        let mut blender = Blender::new(flat_store(20, 32), test_catalog(20), test_config()).unwrap();
        blender.make_cut(|g| g.mag < 22.0);
        let n = blender.n_galaxies();
        assert!(n < 20 && n > 0);
        assert_eq!(blender.stamps.len(), n);
        assert_eq!(blender.partition.train.len() + blender.partition.test.len(), n);
        // Every record is re-indexed into the filtered range.
        for g in blender.catalog().records() {
            assert!(g.cat_index < n);
        }
    }

    #[test]
    fn test_compose_zero_offset_channel_sum() {
        // Zero radii make the acceptance annulus [0, 0], so the offset is
        // forced to (0, 0) and the two channels sum to the plain pixel sum
        // of the two input stamps.
        let catalog = Catalog::from_records([
            record(0, 1, 21.0, 0.0),
            record(1, 2, 21.0, 0.0),
        ]);
        let config = BlendConfig { train_test_ratio: 0.0, ..test_config() };
        let store = flat_store(2, 16);
        let img1 = store.image(0);
        let img2 = store.image(1);
        let mut blender = Blender::new(store, catalog, config).unwrap();
        let (g1, g2) = (blender.catalog().get(0), blender.catalog().get(1));
        let blend = blender.compose(&g1, &g2).unwrap();
        assert_eq!(blend.shift, Displacement { dy: 0, dx: 0 });
        let summed = blend.image.index_axis(ndarray::Axis(2), 0).to_owned()
            + blend.image.index_axis(ndarray::Axis(2), 1);
        assert_eq!(summed, img1 + img2);
    }

    #[test]
    fn test_compose_reports_placement_failure() {
        // Sub-pixel radii with ratio 1 give the annulus [0.72, 0.9], which
        // contains no integer offset: every draw collapses to the origin
        // and the sampler deterministically exhausts its budget.
        let catalog = Catalog::from_records([
            record(0, 1, 21.0, 0.9),
            record(1, 2, 21.0, 0.9),
        ]);
        let config = BlendConfig {
            train_test_ratio: 0.0,
            radius_ratio: 1.0,
            ..test_config()
        };
        let mut blender = Blender::new(flat_store(2, 32), catalog, config).unwrap();
        let (g1, g2) = (blender.catalog().get(0), blender.catalog().get(1));
        assert!(matches!(
            blender.compose(&g1, &g2),
            Err(BlendError::Placement { central: 1, companion: 2 })
        ));
    }

    #[test]
    fn test_next_blend_is_reproducible_under_seed() {
        let make = || {
            Blender::new(flat_store(30, 32), test_catalog(30), test_config()).unwrap()
        };
        let mut b1 = make();
        let mut b2 = make();
        for _ in 0..5 {
            let blend1 = b1.next_blend(false).unwrap();
            let blend2 = b2.next_blend(false).unwrap();
            assert_eq!(blend1.central.id, blend2.central.id);
            assert_eq!(blend1.companion.id, blend2.companion.id);
            assert_eq!(blend1.shift, blend2.shift);
            assert_eq!(blend1.image, blend2.image);
        }
    }

    #[test]
    fn test_blend_channel_counts() {
        let mut blender = Blender::new(flat_store(30, 32), test_catalog(30), test_config()).unwrap();
        let blend = blender.next_blend(false).unwrap();
        assert_eq!(blend.image.dim(), (32, 32, 2));
        assert_eq!(blend.segmap.dim(), (2, 32, 32));
        let (rad_min, rad_max) = crate::placement::placement_bounds(
            blend.central.radius,
            blend.companion.radius,
            blender.config.radius_ratio,
            32,
        );
        let norm = blend.shift.norm();
        assert!(norm >= rad_min && norm <= rad_max);
    }
}
