use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
};

use image::{ImageFormat, RgbImage};
use serde::Serialize;
use tracing::debug;

use crate::{PlumeError, Result};

const GRID_PADDING: u32 = 2;

/// What happens to the fixed "latest output" file after each write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LatestPointer {
    Disabled,
    /// Every written sample or grid is copied over this path.
    Overwrite(PathBuf),
}

/// One file written for a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactRecord {
    pub sequence_number: usize,
    pub file_path: PathBuf,
    pub watermarked: bool,
}

/// Everything written for one request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OutputManifest {
    pub samples: Vec<ArtifactRecord>,
    pub grid: Option<ArtifactRecord>,
}

impl OutputManifest {
    /// The artifact a caller should receive: the grid if one was written, else the last sample.
    pub fn primary(&self) -> Option<&ArtifactRecord> {
        self.grid.as_ref().or_else(|| self.samples.last())
    }
}

/// An image ready to be persisted.
#[derive(Debug, Clone)]
pub struct OutputImage {
    pub image: RgbImage,
    pub watermarked: bool,
}

/// Persists samples and grids under one output directory.
///
/// File names come from counting what is already on disk. Every write runs under the writer's
/// lock, so workers sharing one writer never reuse a number. Separate processes pointed at the
/// same directory can still collide.
#[derive(Debug)]
pub struct ArtifactWriter {
    outdir: PathBuf,
    sample_dir: PathBuf,
    latest: LatestPointer,
    write_scope: Mutex<()>,
}

impl ArtifactWriter {
    /// Creates `<outdir>/samples` and the latest pointer's parent directory.
    pub fn create(outdir: impl Into<PathBuf>, latest: LatestPointer) -> Result<Self> {
        let outdir = outdir.into();
        let sample_dir = outdir.join("samples");
        fs::create_dir_all(&sample_dir).map_err(|e| PlumeError::io(&sample_dir, e))?;
        if let LatestPointer::Overwrite(path) = &latest {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent).map_err(|e| PlumeError::io(parent, e))?;
            }
        }
        Ok(Self {
            outdir,
            sample_dir,
            latest,
            write_scope: Mutex::new(()),
        })
    }

    pub fn outdir(&self) -> &Path {
        &self.outdir
    }

    pub fn sample_dir(&self) -> &Path {
        &self.sample_dir
    }

    pub fn latest(&self) -> &LatestPointer {
        &self.latest
    }

    /// Writes `<outdir>/samples/<seq:05>.png` for each image, numbering from the current
    /// directory size.
    pub fn write_samples(&self, images: Vec<OutputImage>) -> Result<Vec<ArtifactRecord>> {
        let _scope = self.lock();
        let mut sequence = count_entries(&self.sample_dir, &[])?;
        let mut records = Vec::with_capacity(images.len());
        for OutputImage { image, watermarked } in images {
            let file_path = self.sample_dir.join(format!("{sequence:05}.png"));
            self.save(&image, &file_path)?;
            records.push(ArtifactRecord {
                sequence_number: sequence,
                file_path,
                watermarked,
            });
            sequence += 1;
        }
        Ok(records)
    }

    /// Writes `<outdir>/grid-<seq:04>.png`, numbering from the entries of `<outdir>` other than
    /// the samples directory and the latest pointer.
    pub fn write_grid(&self, grid: OutputImage) -> Result<ArtifactRecord> {
        let _scope = self.lock();
        let mut skip = vec![self.sample_dir.as_path()];
        if let LatestPointer::Overwrite(path) = &self.latest {
            skip.push(path.as_path());
        }
        let sequence = count_entries(&self.outdir, &skip)?;
        let file_path = self.outdir.join(format!("grid-{sequence:04}.png"));
        self.save(&grid.image, &file_path)?;
        Ok(ArtifactRecord {
            sequence_number: sequence,
            file_path,
            watermarked: grid.watermarked,
        })
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        // The guard protects no data, so a panic in another writer leaves nothing inconsistent.
        self.write_scope
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn save(&self, image: &RgbImage, path: &Path) -> Result<()> {
        image.save_with_format(path, ImageFormat::Png)?;
        debug!("wrote {}", path.display());
        if let LatestPointer::Overwrite(latest) = &self.latest {
            fs::copy(path, latest).map_err(|e| PlumeError::io(latest, e))?;
        }
        Ok(())
    }
}

fn count_entries(dir: &Path, skip: &[&Path]) -> Result<usize> {
    let entries = fs::read_dir(dir).map_err(|e| PlumeError::io(dir, e))?;
    let mut count = 0;
    for entry in entries {
        let entry = entry.map_err(|e| PlumeError::io(dir, e))?;
        let path = entry.path();
        if !skip.iter().any(|s| same_file(s, &path)) {
            count += 1;
        }
    }
    Ok(count)
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Tiles `images` into one contact sheet, `per_row` images per row, with 2 px black padding.
///
/// All images must share the first image's dimensions.
pub fn compose_grid(images: &[RgbImage], per_row: usize) -> Result<RgbImage> {
    let first = images
        .first()
        .ok_or_else(|| PlumeError::configuration("cannot build a grid from zero images"))?;
    if per_row < 1 {
        return Err(PlumeError::configuration("grid rows must be at least 1"));
    }
    let (width, height) = first.dimensions();
    if images.iter().any(|img| img.dimensions() != (width, height)) {
        return Err(PlumeError::configuration(
            "grid images must share one size",
        ));
    }

    let columns = per_row.min(images.len());
    let rows = images.len().div_ceil(columns);
    let cell_width = width + GRID_PADDING;
    let cell_height = height + GRID_PADDING;
    let mut grid = RgbImage::new(
        cell_width * columns as u32 + GRID_PADDING,
        cell_height * rows as u32 + GRID_PADDING,
    );
    for (i, img) in images.iter().enumerate() {
        let x = (i % columns) as u32 * cell_width + GRID_PADDING;
        let y = (i / columns) as u32 * cell_height + GRID_PADDING;
        image::imageops::replace(&mut grid, img, i64::from(x), i64::from(y));
    }
    Ok(grid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn solid(value: u8) -> OutputImage {
        OutputImage {
            image: RgbImage::from_pixel(4, 4, Rgb([value, value, value])),
            watermarked: true,
        }
    }

    #[test]
    fn sequence_continues_from_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ArtifactWriter::create(dir.path(), LatestPointer::Disabled).unwrap();
        for i in 0..3 {
            fs::write(writer.sample_dir().join(format!("old-{i}")), b"").unwrap();
        }

        let records = writer
            .write_samples(vec![solid(1), solid(2), solid(3), solid(4)])
            .unwrap();

        let numbers: Vec<usize> = records.iter().map(|r| r.sequence_number).collect();
        assert_eq!(numbers, [3, 4, 5, 6]);
        assert_eq!(
            records[0].file_path,
            dir.path().join("samples").join("00003.png")
        );
        assert!(records.iter().all(|r| r.file_path.exists()));
    }

    #[test]
    fn latest_pointer_tracks_last_write() {
        let dir = tempfile::tempdir().unwrap();
        let latest = dir.path().join("pointer").join("latest.png");
        let writer =
            ArtifactWriter::create(dir.path().join("out"), LatestPointer::Overwrite(latest.clone()))
                .unwrap();

        writer.write_samples(vec![solid(10), solid(20)]).unwrap();

        let pointed = image::open(&latest).unwrap().to_rgb8();
        assert_eq!(pointed.get_pixel(0, 0).0, [20, 20, 20]);
    }

    #[test]
    fn grid_numbering_ignores_samples_and_pointer() {
        let dir = tempfile::tempdir().unwrap();
        let latest = dir.path().join("latest.png");
        let writer =
            ArtifactWriter::create(dir.path(), LatestPointer::Overwrite(latest.clone())).unwrap();
        writer.write_samples(vec![solid(1)]).unwrap();

        let first = writer.write_grid(solid(5)).unwrap();
        let second = writer.write_grid(solid(6)).unwrap();

        assert_eq!(first.sequence_number, 0);
        assert_eq!(first.file_path, dir.path().join("grid-0000.png"));
        assert_eq!(second.sequence_number, 1);
        let pointed = image::open(&latest).unwrap().to_rgb8();
        assert_eq!(pointed.get_pixel(0, 0).0, [6, 6, 6]);
    }

    #[test]
    fn primary_prefers_grid() {
        let record = |n| ArtifactRecord {
            sequence_number: n,
            file_path: PathBuf::from(format!("{n}.png")),
            watermarked: false,
        };
        let mut manifest = OutputManifest {
            samples: vec![record(0), record(1)],
            grid: None,
        };
        assert_eq!(manifest.primary(), Some(&record(1)));
        manifest.grid = Some(record(7));
        assert_eq!(manifest.primary(), Some(&record(7)));
        assert_eq!(OutputManifest::default().primary(), None);
    }

    #[test]
    fn grid_layout_matches_make_grid() {
        let images: Vec<RgbImage> = (1..=5)
            .map(|v| RgbImage::from_pixel(4, 3, Rgb([v, v, v])))
            .collect();

        let grid = compose_grid(&images, 2).unwrap();

        // 2 columns, 3 rows, 2 px padding around every cell.
        assert_eq!(grid.dimensions(), (2 * 6 + 2, 3 * 5 + 2));
        assert_eq!(grid.get_pixel(0, 0).0, [0, 0, 0]);
        assert_eq!(grid.get_pixel(2, 2).0, [1, 1, 1]);
        assert_eq!(grid.get_pixel(8, 2).0, [2, 2, 2]);
        assert_eq!(grid.get_pixel(2, 7).0, [3, 3, 3]);
        assert_eq!(grid.get_pixel(2, 12).0, [5, 5, 5]);
        assert_eq!(grid.get_pixel(8, 12).0, [0, 0, 0]);
    }

    #[test]
    fn grid_width_is_capped_by_image_count() {
        let images = vec![RgbImage::new(4, 4); 2];
        let grid = compose_grid(&images, 8).unwrap();
        assert_eq!(grid.dimensions(), (2 * 6 + 2, 6 + 2));
    }

    #[test]
    fn empty_grid_is_rejected() {
        assert!(compose_grid(&[], 2).is_err());
    }
}
