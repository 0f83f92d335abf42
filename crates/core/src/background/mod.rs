use image::{GrayImage, Luma};

use crate::{MotionAlarmError, Result};

/// Rolling estimate of the quiet scene.
///
/// Blending is accumulated in floating point so that slow rates keep moving
/// the estimate instead of stalling on 8-bit rounding; [`reference`] exposes
/// the quantised raster the analyzer compares against.
///
/// [`reference`]: BackgroundModel::reference
#[derive(Debug, Clone)]
pub struct BackgroundModel {
    accumulator: Vec<f32>,
    reference: GrayImage,
}

impl BackgroundModel {
    /// Seeds the model with the first preprocessed frame.
    pub fn new(seed: &GrayImage) -> Self {
        Self {
            accumulator: seed.as_raw().iter().map(|v| f32::from(*v)).collect(),
            reference: seed.clone(),
        }
    }

    pub fn reference(&self) -> &GrayImage {
        &self.reference
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.reference.dimensions()
    }

    /// `reference = rate * current + (1 - rate) * reference`.
    pub fn update(&mut self, current: &GrayImage, rate: f32) -> Result<()> {
        self.check_dimensions(current)?;
        debug_assert!(rate > 0.0 && rate < 1.0, "blend rate {rate} outside (0, 1)");

        let keep = 1.0 - rate;
        for ((acc, out), value) in self
            .accumulator
            .iter_mut()
            .zip(self.reference.pixels_mut())
            .zip(current.as_raw())
        {
            *acc = rate * f32::from(*value) + keep * *acc;
            *out = Luma([acc.round().clamp(0.0, 255.0) as u8]);
        }

        Ok(())
    }

    /// Replaces the reference outright with `current`, including a change of
    /// resolution.
    pub fn reset(&mut self, current: &GrayImage) {
        *self = Self::new(current);
    }

    fn check_dimensions(&self, current: &GrayImage) -> Result<()> {
        if current.dimensions() != self.reference.dimensions() {
            return Err(MotionAlarmError::DimensionMismatch {
                expected: self.reference.dimensions(),
                actual: current.dimensions(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat(value: u8) -> GrayImage {
        GrayImage::from_pixel(4, 4, Luma([value]))
    }

    #[test]
    fn blends_towards_current_frame() {
        let mut model = BackgroundModel::new(&flat(100));
        model.update(&flat(200), 0.2).unwrap();

        assert!(model.reference().pixels().all(|p| p.0[0] == 120));
    }

    #[test]
    fn slow_rates_still_converge() {
        let mut model = BackgroundModel::new(&flat(100));
        for _ in 0..100 {
            model.update(&flat(120), 0.01).unwrap();
        }

        // 100 + 20 * (1 - 0.99^100) ~= 112.7
        assert_eq!(model.reference().get_pixel(0, 0).0[0], 113);
    }

    #[test]
    fn reset_copies_frame_exactly() {
        let mut model = BackgroundModel::new(&flat(10));
        model.update(&flat(250), 0.5).unwrap();

        let mut current = flat(33);
        current.put_pixel(1, 2, Luma([201]));
        model.reset(&current);

        assert_eq!(model.reference(), &current);
        model.update(&current, 0.08).unwrap();
        assert_eq!(model.reference(), &current);
    }

    #[test]
    fn rejects_mismatched_dimensions() {
        let mut model = BackgroundModel::new(&flat(0));
        let err = model.update(&GrayImage::new(2, 2), 0.1).unwrap_err();

        assert!(matches!(
            err,
            MotionAlarmError::DimensionMismatch {
                expected: (4, 4),
                actual: (2, 2)
            }
        ));
    }
}
