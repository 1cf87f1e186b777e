// math.rs
// ============================================================================
// Note:     Numerics: Adam with gradient accumulation, sigmoid / binary cross
//           entropy, accuracy, weight initialisers and dropout masks.
// ============================================================================

#![forbid(unsafe_code)]

use ndarray::{Array2, Zip};
use rand::Rng;
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};

/// Probability clip used by the loss, same as the common Keras epsilon.
pub const EPSILON: f32 = 1e-7;

// ---------------- Optimizer: Adam (with accumulation) ----------------

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Adam {
    m: Array2<f32>,
    v: Array2<f32>,
    t: usize,
    i_accumulate: usize,
    i_since_update: usize,
    grad_buf: Array2<f32>,
    beta1: f32,
    beta2: f32,
    eps: f32,
}

impl Adam {
    /// Shape of the moment buffers, `None` when they disagree.
    pub fn state_shape(&self) -> Option<(usize, usize)> {
        let shape = self.m.dim();
        (self.v.dim() == shape && self.grad_buf.dim() == shape).then_some(shape)
    }

    pub fn new(shape: (usize, usize)) -> Self {
        Adam {
            m: Array2::zeros(shape),
            v: Array2::zeros(shape),
            t: 0,
            i_accumulate: 1,
            i_since_update: 0,
            grad_buf: Array2::zeros(shape),
            beta1: 0.9,
            beta2: 0.999,
            eps: EPSILON,
        }
    }

    /// Number of per-sample gradients averaged into one update (the batch size).
    pub fn set_accumulate_steps(&mut self, steps: usize) {
        self.i_accumulate = steps.max(1);
        self.i_since_update = 0;
        self.grad_buf.fill(0.0);
    }

    pub fn pending(&self) -> usize {
        self.i_since_update
    }

    pub fn step(&mut self, w: &mut Array2<f32>, grad: &Array2<f32>, lr: f32) {
        Zip::from(&mut self.grad_buf).and(grad).for_each(|gb, &g| *gb += g);

        self.i_since_update += 1;
        if self.i_since_update < self.i_accumulate {
            return;
        }
        self.apply(w, lr);
    }

    /// Applies a trailing partial batch, no-op when nothing is pending.
    pub fn flush(&mut self, w: &mut Array2<f32>, lr: f32) {
        if self.i_since_update > 0 {
            self.apply(w, lr);
        }
    }

    fn apply(&mut self, w: &mut Array2<f32>, lr: f32) {
        let scale = 1.0 / (self.i_since_update as f32);

        self.t += 1;
        let t = self.t as i32;
        let b1 = self.beta1;
        let b2 = self.beta2;
        let eps = self.eps;

        Zip::from(&mut self.m)
            .and(&self.grad_buf)
            .for_each(|m, &g| *m = b1 * *m + (1.0 - b1) * g * scale);
        Zip::from(&mut self.v)
            .and(&self.grad_buf)
            .for_each(|v, &g| *v = b2 * *v + (1.0 - b2) * (g * scale) * (g * scale));

        let bias_c1 = 1.0 - b1.powi(t);
        let bias_c2 = 1.0 - b2.powi(t);

        Zip::from(w).and(&self.m).and(&self.v).for_each(|w_ij, &m_ij, &v_ij| {
            let m_hat = m_ij / bias_c1;
            let v_hat = v_ij / bias_c2;
            *w_ij -= lr * m_hat / (v_hat.sqrt() + eps);
        });

        self.grad_buf.fill(0.0);
        self.i_since_update = 0;
    }
}

// ---------------- Activations, loss, metrics ----------------

pub fn sigmoid(x: f32) -> f32 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

pub fn binary_cross_entropy(d_prob: f32, d_target: f32) -> f32 {
    let p = d_prob.clamp(EPSILON, 1.0 - EPSILON);
    -(d_target * p.ln() + (1.0 - d_target) * (1.0 - p).ln())
}

/// Share of predictions on the right side of 0.5.
pub fn accuracy(v_probs: &[f32], v_targets: &[f32]) -> f32 {
    if v_probs.is_empty() {
        return 0.0;
    }
    let i_correct = v_probs
        .iter()
        .zip(v_targets.iter())
        .filter(|(&p, &y)| (p > 0.5) == (y > 0.5))
        .count();
    i_correct as f32 / v_probs.len() as f32
}

pub fn mean(v: &[f32]) -> f32 {
    if v.is_empty() {
        0.0
    } else {
        v.iter().sum::<f32>() / v.len() as f32
    }
}

// ---------------- Initialisers ----------------

/// Glorot / Xavier uniform: U(-l, l) with l = sqrt(6 / (fan_in + fan_out)).
pub fn glorot_uniform<R: Rng + ?Sized>(
    shape: (usize, usize),
    i_fan_in: usize,
    i_fan_out: usize,
    rng: &mut R,
) -> Array2<f32> {
    let d_limit = (6.0 / (i_fan_in + i_fan_out).max(1) as f32).sqrt();
    uniform_init(shape, d_limit, rng)
}

pub fn uniform_init<R: Rng + ?Sized>(shape: (usize, usize), d_limit: f32, rng: &mut R) -> Array2<f32> {
    if d_limit <= 0.0 {
        return Array2::zeros(shape);
    }
    let dist = Uniform::new_inclusive(-d_limit, d_limit);
    Array2::from_shape_fn(shape, |_| dist.sample(rng))
}

// ---------------- Dropout ----------------

/// Inverted dropout mask: 0 for dropped units, 1/(1-p) for kept ones.
pub fn dropout_mask<R: Rng + ?Sized>(shape: (usize, usize), f_rate: f32, rng: &mut R) -> Array2<f32> {
    let p_drop = f_rate.clamp(0.0, 1.0);
    let scale = if p_drop < 1.0 { 1.0 / (1.0 - p_drop) } else { 0.0 };
    Array2::from_shape_fn(shape, |_| {
        if rng.gen::<f32>() < p_drop {
            0.0
        } else {
            scale
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn adam_moves_against_gradient() {
        let mut w = Array2::from_elem((1, 2), 1.0f32);
        let mut opt = Adam::new((1, 2));
        let g = Array2::from_shape_vec((1, 2), vec![1.0, -1.0]).unwrap();
        opt.step(&mut w, &g, 0.1);
        assert!((w[(0, 0)] - 0.9).abs() < 1e-4);
        assert!((w[(0, 1)] - 1.1).abs() < 1e-4);
    }

    #[test]
    fn adam_accumulates_until_batch_is_full() {
        let mut w = Array2::zeros((1, 1));
        let mut opt = Adam::new((1, 1));
        opt.set_accumulate_steps(3);
        let g = Array2::from_elem((1, 1), 1.0f32);
        opt.step(&mut w, &g, 0.1);
        opt.step(&mut w, &g, 0.1);
        assert_eq!(w[(0, 0)], 0.0);
        assert_eq!(opt.pending(), 2);

        opt.flush(&mut w, 0.1);
        assert!(w[(0, 0)] < 0.0);
        assert_eq!(opt.pending(), 0);

        let before = w[(0, 0)];
        opt.flush(&mut w, 0.1);
        assert_eq!(w[(0, 0)], before);
    }

    #[test]
    fn sigmoid_is_stable_at_extremes() {
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-6);
        assert!(sigmoid(100.0) <= 1.0);
        assert!(sigmoid(-100.0) >= 0.0);
        assert!(sigmoid(-100.0).is_finite());
    }

    #[test]
    fn bce_is_clipped() {
        assert!(binary_cross_entropy(0.0, 1.0).is_finite());
        assert!(binary_cross_entropy(1.0, 0.0).is_finite());
        assert!(binary_cross_entropy(0.9, 1.0) < binary_cross_entropy(0.6, 1.0));
    }

    #[test]
    fn accuracy_uses_half_threshold() {
        let acc = accuracy(&[0.9, 0.2, 0.6, 0.4], &[1.0, 0.0, 0.0, 0.0]);
        assert!((acc - 0.75).abs() < 1e-6);
        assert_eq!(accuracy(&[], &[]), 0.0);
    }

    #[test]
    fn dropout_mask_keeps_expectation() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mask = dropout_mask((100, 100), 0.5, &mut rng);
        assert!(mask.iter().all(|&m| m == 0.0 || (m - 2.0).abs() < 1e-6));
        let d_mean = mask.mean().unwrap();
        assert!((d_mean - 1.0).abs() < 0.1, "mean {d_mean}");
    }

    #[test]
    fn glorot_respects_limit() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let w = glorot_uniform((10, 20), 10, 20, &mut rng);
        let d_limit = (6.0f32 / 30.0).sqrt();
        assert!(w.iter().all(|&x| x.abs() <= d_limit));
    }
}
