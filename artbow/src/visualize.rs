//! Images of palettes and class distributions.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use image::codecs::png::PngEncoder;
use image::{ImageEncoder, ImageError, Rgb, RgbImage};
use thiserror::Error;
use tracing::debug;

use crate::palette::Palette;

const TILE_GAP: u32 = 2;
const BAR_WIDTH: u32 = 12;
const BAR_GAP: u32 = 4;
const CHART_HEIGHT: u32 = 240;
const MARGIN: u32 = 10;

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const BAR: Rgb<u8> = Rgb([70, 110, 170]);
const AVERAGE: Rgb<u8> = Rgb([220, 20, 20]);

#[derive(Debug, Error)]
pub enum VisualizeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("PNG encoding error: {0}")]
    Encoding(#[from] ImageError),

    #[error("palette dimension {dim} is not a {patch_size}x{patch_size} RGB patch")]
    PatchShape { dim: usize, patch_size: usize },

    #[error("nothing to draw")]
    Empty,
}

/// Vertical axis of a distribution chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scale {
    #[default]
    Linear,
    Log,
}

impl Scale {
    fn apply(&self, value: f64) -> f64 {
        match self {
            Scale::Linear => value,
            Scale::Log => value.ln_1p(),
        }
    }
}

/// Write-only sink for diagnostic images. `name` is a `/`-separated path
/// without extension.
pub trait Visualizer {
    fn palette(&mut self, name: &str, palette: &Palette, patch_size: usize) -> Result<(), VisualizeError>;

    fn class_distribution(&mut self, name: &str, counts: &[(String, usize)], scale: Scale) -> Result<(), VisualizeError>;
}

/// Draws nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoVisualizer;

impl Visualizer for NoVisualizer {
    fn palette(&mut self, _name: &str, _palette: &Palette, _patch_size: usize) -> Result<(), VisualizeError> {
        Ok(())
    }

    fn class_distribution(&mut self, _name: &str, _counts: &[(String, usize)], _scale: Scale) -> Result<(), VisualizeError> {
        Ok(())
    }
}

/// Writes PNG files below a directory.
#[derive(Debug, Clone)]
pub struct PngVisualizer {
    root: PathBuf,
}

impl PngVisualizer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn write(&self, name: &str, image: &RgbImage) -> Result<PathBuf, VisualizeError> {
        let path = self.root.join(format!("{name}.png"));
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_png(image, &path)?;
        debug!(path = %path.display(), "wrote image");
        Ok(path)
    }
}

impl Visualizer for PngVisualizer {
    fn palette(&mut self, name: &str, palette: &Palette, patch_size: usize) -> Result<(), VisualizeError> {
        let image = render_palette(palette, patch_size)?;
        self.write(name, &image)?;
        Ok(())
    }

    fn class_distribution(&mut self, name: &str, counts: &[(String, usize)], scale: Scale) -> Result<(), VisualizeError> {
        let image = render_distribution(counts, scale)?;
        self.write(name, &image)?;
        Ok(())
    }
}

pub fn write_png(image: &RgbImage, path: &Path) -> Result<(), VisualizeError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    PngEncoder::new(&mut writer).write_image(
        image.as_raw(),
        image.width(),
        image.height(),
        image::ExtendedColorType::Rgb8,
    )?;
    writer.flush()?;
    Ok(())
}

/// Lays the palette entries out as a square-ish grid of `patch_size` tiles.
pub fn render_palette(palette: &Palette, patch_size: usize) -> Result<RgbImage, VisualizeError> {
    if patch_size == 0 || palette.dim() != patch_size * patch_size * 3 {
        return Err(VisualizeError::PatchShape {
            dim: palette.dim(),
            patch_size,
        });
    }

    let count = palette.len() as u32;
    let columns = (f64::from(count).sqrt().ceil() as u32).max(1);
    let rows = count.div_ceil(columns);
    let tile = patch_size as u32;
    let step = tile + TILE_GAP;

    let mut image = RgbImage::from_pixel(
        columns * step + TILE_GAP,
        rows * step + TILE_GAP,
        BACKGROUND,
    );
    for (i, entry) in palette.iter().enumerate() {
        let i = i as u32;
        let (x0, y0) = (TILE_GAP + (i % columns) * step, TILE_GAP + (i / columns) * step);
        for (p, pixel) in entry.chunks_exact(3).enumerate() {
            let p = p as u32;
            let channel = |c: f32| c.round().clamp(0.0, 255.0) as u8;
            image.put_pixel(
                x0 + p % tile,
                y0 + p / tile,
                Rgb([channel(pixel[0]), channel(pixel[1]), channel(pixel[2])]),
            );
        }
    }
    Ok(image)
}

/// Bar per class with a red line at the average height.
pub fn render_distribution(counts: &[(String, usize)], scale: Scale) -> Result<RgbImage, VisualizeError> {
    if counts.is_empty() {
        return Err(VisualizeError::Empty);
    }

    let values: Vec<f64> = counts.iter().map(|(_, n)| scale.apply(*n as f64)).collect();
    let max = values.iter().copied().fold(0.0, f64::max);
    let average = values.iter().sum::<f64>() / values.len() as f64;
    let height_of = |value: f64| {
        if max > 0.0 {
            (value / max * f64::from(CHART_HEIGHT)).round() as u32
        } else {
            0
        }
    };

    let width = 2 * MARGIN + values.len() as u32 * (BAR_WIDTH + BAR_GAP) - BAR_GAP;
    let height = CHART_HEIGHT + 2 * MARGIN;
    let baseline = MARGIN + CHART_HEIGHT;
    let mut image = RgbImage::from_pixel(width, height, BACKGROUND);

    for (i, &value) in values.iter().enumerate() {
        let x0 = MARGIN + i as u32 * (BAR_WIDTH + BAR_GAP);
        for y in baseline - height_of(value)..baseline {
            for x in x0..x0 + BAR_WIDTH {
                image.put_pixel(x, y, BAR);
            }
        }
    }

    let line = baseline - height_of(average).max(1);
    for x in MARGIN..width - MARGIN {
        image.put_pixel(x, line, AVERAGE);
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_tone_palette() -> Palette {
        let mut entries = vec![0.0; 3 * 2 * 2 * 3];
        entries[12..24].fill(255.0);
        entries[24..].copy_from_slice(&[300.0, -4.0, 127.6].repeat(4));
        Palette::from_entries(2 * 2 * 3, entries).unwrap()
    }

    #[test]
    fn palette_grid_layout() {
        let image = render_palette(&two_tone_palette(), 2).unwrap();
        // Two columns, two rows of 2px tiles separated by 2px gaps.
        assert_eq!(image.dimensions(), (10, 10));
        assert_eq!(image.get_pixel(2, 2).0, [0, 0, 0]);
        assert_eq!(image.get_pixel(6, 3).0, [255, 255, 255]);
        assert_eq!(image.get_pixel(3, 6).0, [255, 0, 128]);
        assert_eq!(image.get_pixel(0, 0), &BACKGROUND);
    }

    #[test]
    fn palette_must_match_patch_shape() {
        assert!(matches!(
            render_palette(&two_tone_palette(), 3),
            Err(VisualizeError::PatchShape { dim: 12, patch_size: 3 })
        ));
    }

    #[test]
    fn distribution_bars_and_average() {
        let counts = vec![("a".to_owned(), 10), ("b".to_owned(), 30)];
        let image = render_distribution(&counts, Scale::Linear).unwrap();
        assert_eq!(image.dimensions(), (2 * MARGIN + 2 * BAR_WIDTH + BAR_GAP, CHART_HEIGHT + 2 * MARGIN));

        let baseline = MARGIN + CHART_HEIGHT;
        let second = MARGIN + BAR_WIDTH + BAR_GAP;
        // The tallest bar spans the whole chart.
        assert_eq!(image.get_pixel(second, MARGIN), &BAR);
        assert_eq!(image.get_pixel(MARGIN, baseline - 81), &BACKGROUND);
        // Average of 20 sits at two thirds of the full height.
        assert_eq!(image.get_pixel(MARGIN + 1, baseline - 160), &AVERAGE);
    }

    #[test]
    fn log_scale_compresses_bars() {
        let counts = vec![("a".to_owned(), 10), ("b".to_owned(), 1000)];
        let linear = render_distribution(&counts, Scale::Linear).unwrap();
        let log = render_distribution(&counts, Scale::Log).unwrap();
        let baseline = MARGIN + CHART_HEIGHT;
        assert_eq!(linear.get_pixel(MARGIN + 1, baseline - 20), &BACKGROUND);
        assert_eq!(log.get_pixel(MARGIN + 1, baseline - 20), &BAR);
    }

    #[test]
    fn empty_distribution_is_an_error() {
        assert!(matches!(render_distribution(&[], Scale::Log), Err(VisualizeError::Empty)));
    }

    #[test]
    fn writes_png_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut visualizer = PngVisualizer::new(dir.path());
        visualizer
            .palette("loc_palette_images/Cubism", &two_tone_palette(), 2)
            .unwrap();
        visualizer
            .class_distribution("style_distribution", &[("x".to_owned(), 1)], Scale::Log)
            .unwrap();

        let written = image::open(dir.path().join("loc_palette_images/Cubism.png")).unwrap().to_rgb8();
        assert_eq!(written, render_palette(&two_tone_palette(), 2).unwrap());
        assert!(dir.path().join("style_distribution.png").is_file());
    }
}
