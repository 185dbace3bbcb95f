//! Batch normalisation fused with ReLU
//!
//! Statistics are per channel over `batch * spatial` elements. Variance is the
//! biased (population) estimate. Data is laid out `[batch][channels][spatial]`.

use rayon::prelude::*;

use super::check_len;
use crate::error::KernelError;

/// Per-channel layout of a feature-map batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormGeometry {
    pub channels: usize,
    pub spatial: usize,
}

impl NormGeometry {
    pub fn sample_len(&self) -> usize {
        self.channels * self.spatial
    }
}

/// Per-channel batch mean and biased variance.
pub fn batch_statistics(
    geom: &NormGeometry,
    batch_size: usize,
    data: &[f32],
    mean: &mut [f32],
    variance: &mut [f32],
) -> Result<(), KernelError> {
    check_len("pre_norm", batch_size * geom.sample_len(), data.len())?;
    check_len("mean", geom.channels, mean.len())?;
    check_len("variance", geom.channels, variance.len())?;

    let count = (batch_size * geom.spatial) as f32;
    mean.par_iter_mut()
        .zip(variance.par_iter_mut())
        .enumerate()
        .for_each(|(c, (m, v))| {
            let channel = |b: usize| {
                let start = b * geom.sample_len() + c * geom.spatial;
                &data[start..start + geom.spatial]
            };
            let sum: f32 = (0..batch_size).map(|b| channel(b).iter().sum::<f32>()).sum();
            let mu = sum / count;
            let sq: f32 = (0..batch_size)
                .map(|b| channel(b).iter().map(|x| (x - mu) * (x - mu)).sum::<f32>())
                .sum();
            *m = mu;
            *v = sq / count;
        });
    Ok(())
}

/// Blend batch statistics into the moving statistics:
/// `moving = momentum * moving + (1 - momentum) * batch`.
pub fn update_moving_statistics(
    momentum: f32,
    batch_mean: &[f32],
    batch_variance: &[f32],
    moving_mean: &mut [f32],
    moving_variance: &mut [f32],
) -> Result<(), KernelError> {
    check_len("moving_mean", batch_mean.len(), moving_mean.len())?;
    check_len("moving_variance", batch_variance.len(), moving_variance.len())?;

    for (moving, batch) in moving_mean.iter_mut().zip(batch_mean) {
        *moving = momentum * *moving + (1.0 - momentum) * batch;
    }
    for (moving, batch) in moving_variance.iter_mut().zip(batch_variance) {
        *moving = momentum * *moving + (1.0 - momentum) * batch;
    }
    Ok(())
}

/// Operands shared by the forward normalisation calls.
pub struct NormAffine<'a> {
    pub mean: &'a [f32],
    pub variance: &'a [f32],
    pub gamma: &'a [f32],
    pub beta: &'a [f32],
    pub epsilon: f32,
}

/// `output = relu(gamma * (x - mean) / sqrt(variance + epsilon) + beta)`.
///
/// When `normalized` is given, the normalised values `x_hat` are stored there for
/// the backward pass. Returns the per-channel `1 / sqrt(variance + epsilon)`.
pub fn normalize_relu_forward(
    geom: &NormGeometry,
    batch_size: usize,
    pre_norm: &[f32],
    affine: &NormAffine<'_>,
    normalized: Option<&mut [f32]>,
    output: &mut [f32],
) -> Result<Vec<f32>, KernelError> {
    let total = batch_size * geom.sample_len();
    check_len("pre_norm", total, pre_norm.len())?;
    check_len("output", total, output.len())?;
    for (name, values) in [
        ("mean", affine.mean),
        ("variance", affine.variance),
        ("gamma", affine.gamma),
        ("beta", affine.beta),
    ] {
        check_len(name, geom.channels, values.len())?;
    }

    let inv_std: Vec<f32> = affine
        .variance
        .iter()
        .map(|v| 1.0 / (v + affine.epsilon).sqrt())
        .collect();

    let apply = |x: &[f32], x_hat: Option<&mut [f32]>, y: &mut [f32]| {
        let mut x_hat = x_hat;
        for c in 0..geom.channels {
            let range = c * geom.spatial..(c + 1) * geom.spatial;
            for i in range {
                let n = (x[i] - affine.mean[c]) * inv_std[c];
                if let Some(buf) = x_hat.as_deref_mut() {
                    buf[i] = n;
                }
                y[i] = (affine.gamma[c] * n + affine.beta[c]).max(0.0);
            }
        }
    };

    match normalized {
        Some(x_hat) => {
            check_len("normalized", total, x_hat.len())?;
            output
                .par_chunks_mut(geom.sample_len())
                .zip(x_hat.par_chunks_mut(geom.sample_len()))
                .zip(pre_norm.par_chunks(geom.sample_len()))
                .for_each(|((y, n), x)| apply(x, Some(n), y));
        }
        None => {
            output
                .par_chunks_mut(geom.sample_len())
                .zip(pre_norm.par_chunks(geom.sample_len()))
                .for_each(|(y, x)| apply(x, None, y));
        }
    }

    if output.iter().any(|v| !v.is_finite()) {
        return Err(KernelError::NonFiniteValue { tensor: "output" });
    }
    Ok(inv_std)
}

/// Operands for the batch-norm + ReLU backward pass.
pub struct NormBackward<'a> {
    pub output: &'a [f32],
    pub grad_output: &'a [f32],
    pub normalized: &'a [f32],
    pub inv_std: &'a [f32],
    pub gamma: &'a [f32],
}

/// Backward through ReLU and training-mode batch normalisation.
///
/// Writes the gradient with respect to the pre-normalisation input into
/// `grad_pre_norm` and the per-channel gamma/beta gradients. All three outputs are
/// overwritten.
pub fn normalize_relu_backward(
    geom: &NormGeometry,
    batch_size: usize,
    ops: &NormBackward<'_>,
    grad_pre_norm: &mut [f32],
    grad_gamma: &mut [f32],
    grad_beta: &mut [f32],
) -> Result<(), KernelError> {
    let total = batch_size * geom.sample_len();
    check_len("output", total, ops.output.len())?;
    check_len("output_gradient", total, ops.grad_output.len())?;
    check_len("normalized", total, ops.normalized.len())?;
    check_len("pre_norm_gradient", total, grad_pre_norm.len())?;
    check_len("inv_std", geom.channels, ops.inv_std.len())?;
    check_len("gamma", geom.channels, ops.gamma.len())?;
    check_len("gamma_gradient", geom.channels, grad_gamma.len())?;
    check_len("beta_gradient", geom.channels, grad_beta.len())?;

    // ReLU passes gradient only where the activation was positive.
    let masked = |i: usize| {
        if ops.output[i] > 0.0 {
            ops.grad_output[i]
        } else {
            0.0
        }
    };

    grad_gamma
        .par_iter_mut()
        .zip(grad_beta.par_iter_mut())
        .enumerate()
        .for_each(|(c, (g_gamma, g_beta))| {
            let mut sum_dy = 0.0f32;
            let mut sum_dy_xhat = 0.0f32;
            for b in 0..batch_size {
                let start = b * geom.sample_len() + c * geom.spatial;
                for i in start..start + geom.spatial {
                    let dy = masked(i);
                    sum_dy += dy;
                    sum_dy_xhat += dy * ops.normalized[i];
                }
            }
            *g_gamma = sum_dy_xhat;
            *g_beta = sum_dy;
        });

    let count = (batch_size * geom.spatial) as f32;
    let sums: Vec<(f32, f32)> = grad_beta
        .iter()
        .copied()
        .zip(grad_gamma.iter().copied())
        .collect();

    grad_pre_norm
        .par_chunks_mut(geom.sample_len())
        .enumerate()
        .for_each(|(b, g)| {
            let base = b * geom.sample_len();
            for c in 0..geom.channels {
                let (sum_dy, sum_dy_xhat) = sums[c];
                let scale = ops.gamma[c] * ops.inv_std[c] / count;
                for s in 0..geom.spatial {
                    let local = c * geom.spatial + s;
                    let i = base + local;
                    g[local] =
                        scale * (count * masked(i) - sum_dy - ops.normalized[i] * sum_dy_xhat);
                }
            }
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_batch_statistics_per_channel() {
        let geom = NormGeometry {
            channels: 2,
            spatial: 2,
        };
        // batch of 2: channel 0 gets {1,3,5,7}, channel 1 gets {2,2,2,2}
        let data = vec![1.0, 3.0, 2.0, 2.0, 5.0, 7.0, 2.0, 2.0];
        let mut mean = vec![0.0; 2];
        let mut var = vec![0.0; 2];
        batch_statistics(&geom, 2, &data, &mut mean, &mut var).unwrap();
        assert_relative_eq!(mean[0], 4.0);
        assert_relative_eq!(var[0], 5.0);
        assert_relative_eq!(mean[1], 2.0);
        assert_relative_eq!(var[1], 0.0);
    }

    #[test]
    fn test_moving_statistics_blend() {
        let mut moving_mean = vec![1.0, 1.0];
        let mut moving_var = vec![1.0, 1.0];
        update_moving_statistics(0.9, &[2.0, 0.0], &[3.0, 1.0], &mut moving_mean, &mut moving_var)
            .unwrap();
        assert_relative_eq!(moving_mean[0], 1.1, epsilon = 1e-6);
        assert_relative_eq!(moving_mean[1], 0.9, epsilon = 1e-6);
        assert_relative_eq!(moving_var[0], 1.2, epsilon = 1e-6);
        assert_relative_eq!(moving_var[1], 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_forward_normalises_then_clamps() {
        let geom = NormGeometry {
            channels: 1,
            spatial: 4,
        };
        let x = vec![1.0, 2.0, 3.0, 4.0];
        let mut mean = vec![0.0];
        let mut var = vec![0.0];
        batch_statistics(&geom, 1, &x, &mut mean, &mut var).unwrap();

        let mut x_hat = vec![0.0; 4];
        let mut y = vec![0.0; 4];
        let affine = NormAffine {
            mean: &mean,
            variance: &var,
            gamma: &[1.0],
            beta: &[0.0],
            epsilon: 1e-7,
        };
        normalize_relu_forward(&geom, 1, &x, &affine, Some(&mut x_hat), &mut y).unwrap();

        assert_relative_eq!(x_hat.iter().sum::<f32>(), 0.0, epsilon = 1e-5);
        assert_eq!(y[0], 0.0);
        assert_eq!(y[1], 0.0);
        assert_relative_eq!(y[2], x_hat[2]);
        assert_relative_eq!(y[3], x_hat[3]);
    }

    #[test]
    fn test_backward_matches_finite_difference() {
        let geom = NormGeometry {
            channels: 2,
            spatial: 3,
        };
        let batch = 2;
        let x: Vec<f32> = vec![0.3, -1.2, 2.0, 0.5, 0.1, -0.7, 1.1, 0.4, -0.2, 1.5, -0.9, 0.8];
        let gamma = vec![1.3, 0.7];
        let beta = vec![0.2, 0.3];
        let upstream: Vec<f32> = vec![0.5, -0.3, 0.8, 0.1, -0.6, 0.4, 0.2, 0.9, -0.5, 0.3, 0.7, -0.2];

        let run = |x: &[f32], gamma: &[f32], beta: &[f32]| {
            let mut mean = vec![0.0; 2];
            let mut var = vec![0.0; 2];
            batch_statistics(&geom, batch, x, &mut mean, &mut var).unwrap();
            let mut x_hat = vec![0.0; x.len()];
            let mut y = vec![0.0; x.len()];
            let affine = NormAffine {
                mean: &mean,
                variance: &var,
                gamma,
                beta,
                epsilon: 1e-7,
            };
            let inv_std =
                normalize_relu_forward(&geom, batch, x, &affine, Some(&mut x_hat), &mut y).unwrap();
            (y, x_hat, inv_std)
        };
        let loss = |x: &[f32], gamma: &[f32], beta: &[f32]| -> f64 {
            let (y, _, _) = run(x, gamma, beta);
            y.iter().zip(&upstream).map(|(a, b)| (*a as f64) * (*b as f64)).sum()
        };

        let (y, x_hat, inv_std) = run(&x, &gamma, &beta);
        let mut g_x = vec![0.0; x.len()];
        let mut g_gamma = vec![0.0; 2];
        let mut g_beta = vec![0.0; 2];
        let ops = NormBackward {
            output: &y,
            grad_output: &upstream,
            normalized: &x_hat,
            inv_std: &inv_std,
            gamma: &gamma,
        };
        normalize_relu_backward(&geom, batch, &ops, &mut g_x, &mut g_gamma, &mut g_beta).unwrap();

        let h = 1e-3f32;
        for i in 0..x.len() {
            let mut plus = x.clone();
            plus[i] += h;
            let mut minus = x.clone();
            minus[i] -= h;
            let numeric = (loss(&plus, &gamma, &beta) - loss(&minus, &gamma, &beta)) / (2.0 * h as f64);
            assert_relative_eq!(g_x[i], numeric as f32, epsilon = 2e-2);
        }
        for c in 0..2 {
            let mut plus = gamma.clone();
            plus[c] += h;
            let mut minus = gamma.clone();
            minus[c] -= h;
            let numeric = (loss(&x, &plus, &beta) - loss(&x, &minus, &beta)) / (2.0 * h as f64);
            assert_relative_eq!(g_gamma[c], numeric as f32, epsilon = 2e-2);

            let mut plus = beta.clone();
            plus[c] += h;
            let mut minus = beta.clone();
            minus[c] -= h;
            let numeric = (loss(&x, &gamma, &plus) - loss(&x, &gamma, &minus)) / (2.0 * h as f64);
            assert_relative_eq!(g_beta[c], numeric as f32, epsilon = 2e-2);
        }
    }
}
