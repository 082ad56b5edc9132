//! Produce stamps of blended galaxies with their individual masks.
//!
//! Reads the survey stamp cubes and galaxy catalog from a data directory,
//! applies magnitude and morphology cuts, then writes a training set and a
//! held-out test set of blends: per-blend FITS image and label files plus a
//! blend catalog CSV per split, under `output-s_{seed}-n_{n_blends}/`.

use std::error::Error;
use std::fs::File;
use std::path::PathBuf;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;

use blender::{BlendConfig, BlendWriter, Blender, Catalog, MaskFill, Morphology, StampStore};

#[derive(Parser, Debug)]
#[command(author, version, about = "Produce stamps of blended galaxies with their individual masks", long_about = None)]
struct Cli {
    /// Number of blends to produce
    #[arg(short, long, default_value_t = 100)]
    n_blends: usize,

    /// Lowest galaxy magnitude
    #[arg(long, default_value_t = 0.0)]
    mag_low: f64,

    /// Highest galaxy magnitude
    #[arg(long, default_value_t = 100.0)]
    mag_high: f64,

    /// Top magnitude difference between galaxies
    #[arg(long, default_value_t = 2.0)]
    mag_diff: f64,

    /// Top distance between galaxies as a fraction of radius
    #[arg(long, default_value_t = 4.0)]
    rad_diff: f64,

    /// Ratio of the input galaxies used only for the test set
    #[arg(short = 't', long, default_value_t = 0.2)]
    test_ratio: f64,

    /// Excluded galaxy types
    #[arg(short = 'e', long, value_enum)]
    excluded_type: Vec<Morphology>,

    /// Keep only galaxies with a clean quality flag in the catalog
    #[arg(short = 'c', long)]
    use_clean_galaxies: bool,

    /// Keep raw stamps instead of erasing contaminating neighbours
    #[arg(long)]
    no_mask: bool,

    /// Fill erased neighbour pixels with resampled background values
    /// instead of synthesized Gaussian noise
    #[arg(long)]
    shuffled_fill: bool,

    /// Path to data files
    #[arg(short, long, default_value = "./data")]
    datapath: PathBuf,

    /// Random seed
    #[arg(short, long, default_value_t = 42)]
    seed: u64,
}

fn create_image_set(
    blender: &mut Blender,
    n_blends: usize,
    outdir: &PathBuf,
    test_set: bool,
) -> Result<(), Box<dyn Error>> {
    let prefix = if test_set { "test" } else { "train" };
    let mut writer = BlendWriter::create(outdir, prefix)?;

    let bar = ProgressBar::new(n_blends as u64).with_style(ProgressStyle::with_template(
        "{msg} [{bar:40}] {pos}/{len}",
    )?);
    bar.set_message(format!("Producing {} blended images", prefix));

    for index in 0..n_blends {
        let blend = blender.next_blend(test_set)?;
        writer.write(&blend, index)?;
        bar.inc(1);
    }
    bar.finish();
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    let image_path = cli.datapath.join("candels_img.fits");
    let segmap_path = cli.datapath.join("candels_seg.fits");
    let catalog_path = cli.datapath.join("candels_cat.csv");
    let outdir = PathBuf::from(format!("output-s_{}-n_{}", cli.seed, cli.n_blends));

    // Each run keeps its log next to its outputs.
    std::fs::create_dir_all(&outdir)?;
    let log_file = File::create(outdir.join("blender.log"))?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .init();

    info!(
        "configuration: n_blends={} seed={} mag range ({}, {}) mag_diff={} rad_diff={} \
         test_ratio={} excluded={:?}",
        cli.n_blends,
        cli.seed,
        cli.mag_low,
        cli.mag_high,
        cli.mag_diff,
        cli.rad_diff,
        cli.test_ratio,
        cli.excluded_type,
    );

    let stamps = StampStore::from_fits(&image_path, &segmap_path)?;
    let catalog = Catalog::from_csv(&catalog_path)?;

    let config = BlendConfig {
        magnitude_tolerance: cli.mag_diff,
        radius_ratio: cli.rad_diff,
        seed: cli.seed,
        train_test_ratio: cli.test_ratio,
        masking_enabled: !cli.no_mask,
        mask_fill: if cli.shuffled_fill { MaskFill::Shuffled } else { MaskFill::Synthesized },
        ..BlendConfig::default()
    };
    let mut blender = Blender::new(stamps, catalog, config)?;

    println!(
        "Selecting galaxies in the magnitude range {} < m < {}",
        cli.mag_low, cli.mag_high
    );
    blender.make_cut(|g| g.mag > cli.mag_low);
    blender.make_cut(|g| g.mag < cli.mag_high);
    if cli.use_clean_galaxies {
        println!("Selecting only the clean-flagged galaxies");
        blender.make_cut(|g| g.clean_flag == Some(1));
    }
    for galtype in &cli.excluded_type {
        println!("Excluding {} galaxies", galtype);
        blender.make_cut(|g| g.galtype != *galtype);
    }
    println!(
        "After the cuts, there are {} individual galaxies left in the catalog.",
        blender.n_galaxies()
    );

    let n_test = (cli.test_ratio * cli.n_blends as f64) as usize;
    let n_train = cli.n_blends - n_test;

    create_image_set(&mut blender, n_train, &outdir, false)?;
    if n_test > 0 {
        create_image_set(&mut blender, n_test, &outdir, true)?;
    }

    println!("Images stored in {}", outdir.display());
    Ok(())
}
