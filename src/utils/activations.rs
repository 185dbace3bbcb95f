//! Row-wise helpers for classifier outputs
//!
//! - Softmax with max-subtraction for numerical stability
//! - Arg-max with a first-wins tie rule

/// Softmax applied row-wise, in place.
///
/// Subtracts each row's maximum before exponentiating so large logits cannot overflow.
///
/// # Arguments
/// * `outputs` - Flat row-major matrix data
/// * `rows` - Number of rows
/// * `cols` - Number of columns
pub fn softmax_rows(outputs: &mut [f32], rows: usize, cols: usize) {
    if cols == 0 {
        return;
    }
    assert_eq!(outputs.len(), rows * cols, "outputs length mismatch in softmax_rows");

    for row in outputs.chunks_exact_mut(cols).take(rows) {
        let max_value = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        let mut sum = 0.0f32;
        for value in row.iter_mut() {
            *value = (*value - max_value).exp();
            sum += *value;
        }

        let inv_sum = 1.0f32 / sum;
        for value in row.iter_mut() {
            *value *= inv_sum;
        }
    }
}

/// Index of the largest element. Ties go to the lowest index; empty input gives 0.
pub fn argmax(values: &[f32]) -> usize {
    let mut best = 0usize;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPSILON_F32: f32 = 1e-6;

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let mut data = vec![1.0, 2.0, 3.0, -1.0, 0.0, 1.0];
        softmax_rows(&mut data, 2, 3);
        for row in data.chunks(3) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < EPSILON_F32);
        }
    }

    #[test]
    fn test_softmax_large_logits_stay_finite() {
        let mut data = vec![1000.0, 1001.0, 1002.0];
        softmax_rows(&mut data, 1, 3);
        assert!(data.iter().all(|v| v.is_finite()));
        assert!(data[2] > data[1] && data[1] > data[0]);
    }

    #[test]
    fn test_argmax_first_wins_on_tie() {
        assert_eq!(argmax(&[0.1, 0.7, 0.7, 0.2]), 1);
        assert_eq!(argmax(&[3.0, 1.0]), 0);
        assert_eq!(argmax(&[]), 0);
    }
}
