use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::{DetectorConfig, Frame, Thresholds};

/// Converts a color frame into the smoothed grayscale raster every comparison
/// works on.
pub fn preprocess(frame: &Frame, blur_sigma: f32) -> GrayImage {
    let gray = frame.to_gray();
    if blur_sigma > 0.0 {
        image::imageops::blur(&gray, blur_sigma)
    } else {
        gray
    }
}

/// Produces the scalar motion magnitude for a frame against the background.
///
/// Both rasters handed to [`MotionAnalyzer::magnitude`] always share the same
/// dimensions.
pub trait MotionAnalyzer {
    fn magnitude(&mut self, current: &GrayImage, reference: &GrayImage) -> f64;

    /// Called whenever thresholds are derived for a new resolution.
    fn configure(&mut self, _thresholds: &Thresholds) {}
}

/// Morphological clean-up applied to the change mask before regions are
/// measured.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoiseFilter {
    /// One erosion followed by two dilations.
    #[default]
    ErodeDilate,
    /// Two dilations only; more sensitive to speckle.
    DilateOnly,
}

/// Frame-differencing analyzer: thresholded absolute difference, noise
/// filtering, then the summed area of every 8-connected region at least
/// `min_region_area` pixels large.
#[derive(Debug, Clone)]
pub struct DifferenceAnalyzer {
    pixel_threshold: u8,
    noise_filter: NoiseFilter,
    min_region_area: u32,
}

impl DifferenceAnalyzer {
    pub fn new(pixel_threshold: u8, noise_filter: NoiseFilter, min_region_area: u32) -> Self {
        Self {
            pixel_threshold,
            noise_filter,
            min_region_area,
        }
    }

    pub fn from_config(config: &DetectorConfig, thresholds: &Thresholds) -> Self {
        Self::new(
            config.pixel_threshold,
            config.noise_filter,
            thresholds.min_region_area,
        )
    }

    pub fn min_region_area(&self) -> u32 {
        self.min_region_area
    }

    fn change_mask(&self, current: &GrayImage, reference: &GrayImage) -> Mask {
        let (width, height) = current.dimensions();
        let bits = current
            .as_raw()
            .iter()
            .zip(reference.as_raw())
            .map(|(a, b)| a.abs_diff(*b) > self.pixel_threshold)
            .collect();
        Mask {
            width: width as usize,
            height: height as usize,
            bits,
        }
    }
}

impl MotionAnalyzer for DifferenceAnalyzer {
    fn magnitude(&mut self, current: &GrayImage, reference: &GrayImage) -> f64 {
        let mut mask = self.change_mask(current, reference);

        match self.noise_filter {
            NoiseFilter::ErodeDilate => {
                mask = mask.erode();
                mask = mask.dilate().dilate();
            }
            NoiseFilter::DilateOnly => {
                mask = mask.dilate().dilate();
            }
        }

        mask.region_areas()
            .into_iter()
            .filter(|area| *area >= self.min_region_area as usize)
            .sum::<usize>() as f64
    }

    fn configure(&mut self, thresholds: &Thresholds) {
        self.min_region_area = thresholds.min_region_area;
    }
}

/// Binary raster of changed pixels.
#[derive(Debug, Clone, PartialEq)]
struct Mask {
    width: usize,
    height: usize,
    bits: Vec<bool>,
}

impl Mask {
    fn get(&self, x: isize, y: isize) -> Option<bool> {
        if x < 0 || y < 0 || x as usize >= self.width || y as usize >= self.height {
            return None;
        }
        Some(self.bits[y as usize * self.width + x as usize])
    }

    /// 3x3 erosion. Pixels outside the raster do not erode their neighbours.
    fn erode(&self) -> Self {
        self.map_neighbourhood(|mask, x, y| {
            neighbourhood(x, y).all(|(nx, ny)| mask.get(nx, ny).unwrap_or(true))
        })
    }

    /// 3x3 dilation.
    fn dilate(&self) -> Self {
        self.map_neighbourhood(|mask, x, y| {
            neighbourhood(x, y).any(|(nx, ny)| mask.get(nx, ny).unwrap_or(false))
        })
    }

    fn map_neighbourhood(&self, op: impl Fn(&Self, isize, isize) -> bool) -> Self {
        let mut bits = Vec::with_capacity(self.bits.len());
        for y in 0..self.height as isize {
            for x in 0..self.width as isize {
                bits.push(op(self, x, y));
            }
        }
        Self {
            width: self.width,
            height: self.height,
            bits,
        }
    }

    /// Pixel counts of every 8-connected region of set pixels.
    fn region_areas(&self) -> Vec<usize> {
        let mut visited = vec![false; self.bits.len()];
        let mut stack = Vec::new();
        let mut areas = Vec::new();

        for start in 0..self.bits.len() {
            if !self.bits[start] || visited[start] {
                continue;
            }

            visited[start] = true;
            stack.push(start);
            let mut area = 0;

            while let Some(index) = stack.pop() {
                area += 1;
                let x = (index % self.width) as isize;
                let y = (index / self.width) as isize;
                for (nx, ny) in neighbourhood(x, y) {
                    if self.get(nx, ny) == Some(true) {
                        let next = ny as usize * self.width + nx as usize;
                        if !visited[next] {
                            visited[next] = true;
                            stack.push(next);
                        }
                    }
                }
            }

            areas.push(area);
        }

        areas
    }
}

fn neighbourhood(x: isize, y: isize) -> impl Iterator<Item = (isize, isize)> {
    (-1..=1).flat_map(move |dy| (-1..=1).map(move |dx| (x + dx, y + dy)))
}
