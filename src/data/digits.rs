//! Synthetic digit images
//!
//! Each sample is a blank canvas with one 6x6 digit bitmap stamped at a random
//! offset. Labels are one-hot over the ten digits.

use super::BatchSource;
use crate::error::{EngineError, KernelError, Phase, Result};
use crate::tensor::Tensor;
use crate::utils::SimpleRng;

/// Edge length of a digit bitmap.
pub const DIGIT_SIZE: usize = 6;

const CLASSES: usize = 10;

/// Row-major 6x6 bitmaps of the digits 0 to 9.
#[rustfmt::skip]
pub const DIGIT_BITMAPS: [[u8; DIGIT_SIZE * DIGIT_SIZE]; CLASSES] = [
    [0, 0, 1, 1, 0, 0,
     0, 1, 0, 0, 1, 0,
     0, 1, 0, 0, 1, 0,
     0, 1, 0, 0, 1, 0,
     0, 1, 0, 0, 1, 0,
     0, 0, 1, 1, 0, 0],
    [0, 0, 0, 1, 0, 0,
     0, 0, 1, 1, 0, 0,
     0, 1, 0, 1, 0, 0,
     0, 0, 0, 1, 0, 0,
     0, 0, 0, 1, 0, 0,
     0, 0, 0, 1, 0, 0],
    [0, 0, 0, 1, 1, 0,
     0, 0, 1, 0, 1, 0,
     0, 1, 0, 0, 1, 0,
     0, 0, 0, 1, 0, 0,
     0, 0, 1, 0, 0, 0,
     0, 1, 1, 1, 1, 0],
    [0, 1, 1, 1, 1, 0,
     0, 0, 0, 0, 1, 0,
     0, 1, 1, 1, 1, 0,
     0, 0, 0, 0, 1, 0,
     0, 1, 1, 1, 1, 0,
     0, 0, 0, 0, 0, 0],
    [0, 0, 1, 1, 0, 0,
     0, 1, 0, 1, 0, 0,
     1, 0, 0, 1, 0, 0,
     1, 1, 1, 1, 1, 1,
     0, 0, 0, 1, 0, 0,
     0, 0, 0, 1, 0, 0],
    [0, 1, 1, 1, 1, 0,
     0, 1, 0, 0, 0, 0,
     0, 1, 1, 1, 1, 0,
     0, 0, 0, 0, 1, 0,
     0, 1, 1, 1, 1, 0,
     0, 0, 0, 0, 0, 0],
    [0, 1, 1, 1, 1, 0,
     0, 1, 0, 0, 0, 0,
     0, 1, 0, 0, 0, 0,
     0, 1, 1, 1, 1, 0,
     0, 1, 0, 0, 1, 0,
     0, 1, 1, 1, 1, 0],
    [0, 1, 1, 1, 0, 0,
     0, 0, 0, 1, 0, 0,
     0, 0, 0, 1, 0, 0,
     0, 0, 1, 1, 1, 0,
     0, 0, 0, 1, 0, 0,
     0, 0, 0, 1, 0, 0],
    [0, 1, 1, 1, 1, 0,
     0, 1, 0, 0, 1, 0,
     0, 1, 0, 0, 1, 0,
     0, 1, 1, 1, 1, 0,
     0, 1, 0, 0, 1, 0,
     0, 1, 1, 1, 1, 0],
    [0, 0, 1, 1, 1, 0,
     0, 0, 1, 0, 1, 0,
     0, 0, 1, 1, 1, 0,
     0, 0, 0, 0, 1, 0,
     0, 0, 0, 0, 1, 0,
     0, 0, 0, 0, 1, 0],
];

/// Random digit placement on a single-channel `height x width` canvas.
#[derive(Debug, Clone)]
pub struct SyntheticDigits {
    rng: SimpleRng,
    height: usize,
    width: usize,
}

impl SyntheticDigits {
    /// Fails if the canvas cannot hold a bitmap.
    pub fn new(height: usize, width: usize, rng: SimpleRng) -> Result<Self> {
        if height < DIGIT_SIZE || width < DIGIT_SIZE {
            return Err(EngineError::InvalidConfig(format!(
                "digit canvas {height}x{width} is smaller than {DIGIT_SIZE}x{DIGIT_SIZE}"
            )));
        }
        Ok(Self { rng, height, width })
    }

    pub fn classes(&self) -> usize {
        CLASSES
    }

    /// Clear one sample and stamp `digit` with its top-left corner at `(row, col)`.
    fn draw(&self, sample: &mut [f32], digit: usize, row: usize, col: usize) {
        sample.iter_mut().for_each(|v| *v = 0.0);
        let bitmap = &DIGIT_BITMAPS[digit];
        for (r, bits) in bitmap.chunks_exact(DIGIT_SIZE).enumerate() {
            let start = (row + r) * self.width + col;
            for (dst, &bit) in sample[start..start + DIGIT_SIZE].iter_mut().zip(bits) {
                *dst = f32::from(bit);
            }
        }
    }
}

impl BatchSource for SyntheticDigits {
    fn generate_batch(
        &mut self,
        batch_size: usize,
        input: &mut Tensor,
        labels: &mut Tensor,
    ) -> Result<()> {
        let fail = |e: KernelError| e.during(Phase::Forward, "digit_generator");
        let sample_len = self.height * self.width;

        let images = input
            .batch_view_mut("input", sample_len, batch_size)
            .map_err(fail)?;
        let one_hot = labels
            .batch_view_mut("labels", CLASSES, batch_size)
            .map_err(fail)?;
        one_hot.iter_mut().for_each(|v| *v = 0.0);

        for (sample, label) in images
            .chunks_exact_mut(sample_len)
            .zip(one_hot.chunks_exact_mut(CLASSES))
        {
            let col = self.rng.gen_usize(self.width - DIGIT_SIZE);
            let row = self.rng.gen_usize(self.height - DIGIT_SIZE);
            let digit = self.rng.gen_usize(CLASSES);
            self.draw(sample, digit, row, col);
            label[digit] = 1.0;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Shape;
    use crate::utils::argmax;

    fn buffers(batch: usize) -> (Tensor, Tensor) {
        let input = Tensor::allocate(
            Shape::ImageChw {
                channels: 1,
                height: 20,
                width: 20,
            },
            batch,
            crate::tensor::Fill::Constant(9.0),
        )
        .unwrap();
        let labels = Tensor::zeros(Shape::Vector(CLASSES), batch).unwrap();
        (input, labels)
    }

    #[test]
    fn test_each_sample_holds_its_labelled_digit() {
        let mut source = SyntheticDigits::new(20, 20, SimpleRng::new(11)).unwrap();
        let (mut input, mut labels) = buffers(16);
        source.generate_batch(16, &mut input, &mut labels).unwrap();

        for i in 0..16 {
            let label = labels.sample(i);
            assert_eq!(label.iter().sum::<f32>(), 1.0);
            let digit = argmax(label);
            let ink: u32 = DIGIT_BITMAPS[digit].iter().map(|&b| u32::from(b)).sum();
            let image = input.sample(i);
            assert_eq!(image.iter().sum::<f32>(), ink as f32);
            assert!(image.iter().all(|v| *v == 0.0 || *v == 1.0));
        }
    }

    #[test]
    fn test_digit_stays_inside_the_placement_band() {
        let mut source = SyntheticDigits::new(20, 20, SimpleRng::new(5)).unwrap();
        let (mut input, mut labels) = buffers(32);
        source.generate_batch(32, &mut input, &mut labels).unwrap();

        // Offsets are drawn from [0, 14), so the last row and column stay blank.
        for i in 0..32 {
            let image = input.sample(i);
            assert!(image[19 * 20..].iter().all(|v| *v == 0.0));
            assert!((0..20).all(|r| image[r * 20 + 19] == 0.0));
        }
    }

    #[test]
    fn test_same_seed_same_batch() {
        let (mut a_in, mut a_lab) = buffers(4);
        let (mut b_in, mut b_lab) = buffers(4);
        SyntheticDigits::new(20, 20, SimpleRng::new(3))
            .unwrap()
            .generate_batch(4, &mut a_in, &mut a_lab)
            .unwrap();
        SyntheticDigits::new(20, 20, SimpleRng::new(3))
            .unwrap()
            .generate_batch(4, &mut b_in, &mut b_lab)
            .unwrap();
        assert_eq!(a_in, b_in);
        assert_eq!(a_lab, b_lab);
    }

    #[test]
    fn test_partial_batch_leaves_tail_untouched() {
        let mut source = SyntheticDigits::new(20, 20, SimpleRng::new(8)).unwrap();
        let (mut input, mut labels) = buffers(4);
        source.generate_batch(2, &mut input, &mut labels).unwrap();
        assert!(input.sample(3).iter().all(|v| *v == 9.0));
    }

    #[test]
    fn test_canvas_too_small() {
        assert!(SyntheticDigits::new(5, 20, SimpleRng::new(1)).is_err());
    }
}
