//! Blended galaxy stamp production from survey catalogs.
//!
//! This crate composites pairs of real galaxy postage stamps into synthetic
//! two-source blends for training deblending models. Each blend pairs two
//! magnitude-matched galaxies, erases contaminating neighbours from both
//! stamps, displaces the companion by a rejection-sampled offset bounded by
//! the galaxies' effective radii, and stacks the result into a two-channel
//! image cube with its two-channel segmentation labels.
//!
//! The [`blend::Blender`] engine drives the whole pipeline and is fully
//! deterministic under a fixed seed; [`store`] handles stamp-cube input and
//! per-blend output, and the `produce_blends` binary wires the two together
//! behind a command line.

pub mod blend;
pub mod catalog;
pub mod geometry;
pub mod placement;
pub mod segmap;
pub mod store;

pub use blend::{Blend, BlendConfig, BlendError, Blender};
pub use catalog::{Catalog, CatalogError, GalaxyRecord, Morphology, Partition};
pub use placement::Displacement;
pub use segmap::MaskFill;
pub use store::{BlendWriter, StampStore, StoreError};
