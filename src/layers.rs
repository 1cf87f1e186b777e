// layers.rs
// ============================================================================
// Note:     Layer trait and the building blocks of the text CNN:
//           Embedding, Dropout, Conv1D + MaxPool1D + Flatten branches, the
//           parallel branch block and Dense. Every layer works on a single
//           sample; mini batches are formed by the optimizers' gradient
//           accumulation.
// ============================================================================

#![forbid(unsafe_code)]

use ndarray::{concatenate, Array2, ArrayView2, Axis, Slice, Zip};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};
use std::any::Any;

use crate::math::{dropout_mask, glorot_uniform, Adam};

// ---------------------------------------------------------------------------
// Trait: Layer
// ---------------------------------------------------------------------------

pub trait Layer: Send {
    fn layer_type(&self) -> &str;
    fn parameter_count(&self) -> usize;
    /// Output shape for a given input shape, both `(rows, cols)`.
    fn output_shape(&self, input: (usize, usize)) -> (usize, usize);
    fn forward(&mut self, input: &Array2<f32>) -> Array2<f32>;
    fn backward(&mut self, grads: &Array2<f32>, d_lr: f32) -> Array2<f32>;

    fn set_train_mode(&mut self, _b_train: bool) {}
    fn set_accumulate_steps(&mut self, _i_steps: usize) {}
    /// Applies gradients still buffered from an incomplete batch.
    fn flush(&mut self, _d_lr: f32) {}
    /// Shapes of the parameter matrices and their optimizer state; used to
    /// check decoded checkpoints against the header.
    fn param_shapes(&self) -> Vec<Option<(usize, usize)>> {
        Vec::new()
    }

    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

fn fresh_rng() -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(0)
}

// ---------------------------------------------------------------------------
// Embedding
// ---------------------------------------------------------------------------

/// `[1, seq]` token ids (stored as f32) -> `[seq, dim]` vectors.
#[derive(Serialize, Deserialize)]
pub struct Embedding {
    pub weights: Array2<f32>, // [vocab, dim]
    pub trainable: bool,
    optimizer: Adam,

    #[serde(skip)]
    cached_ids: Option<Vec<usize>>,
}

impl Embedding {
    pub fn new(weights: Array2<f32>, trainable: bool) -> Self {
        let shape = weights.dim();
        Self {
            weights,
            trainable,
            optimizer: Adam::new(shape),
            cached_ids: None,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.weights.nrows()
    }

    pub fn dim(&self) -> usize {
        self.weights.ncols()
    }

    fn lookup(&self, v_ids: &[usize]) -> Array2<f32> {
        let mut m_out = Array2::<f32>::zeros((v_ids.len(), self.dim()));
        for (i_row, &i_id) in v_ids.iter().enumerate() {
            assert!(i_id < self.vocab_size(), "token id {} out of bounds for vocab size {}", i_id, self.vocab_size());
            m_out.row_mut(i_row).assign(&self.weights.row(i_id));
        }
        m_out
    }
}

impl Layer for Embedding {
    fn layer_type(&self) -> &str {
        "Embedding"
    }

    fn parameter_count(&self) -> usize {
        self.weights.len()
    }

    fn output_shape(&self, input: (usize, usize)) -> (usize, usize) {
        (input.1, self.dim())
    }

    fn forward(&mut self, input: &Array2<f32>) -> Array2<f32> {
        let v_ids: Vec<usize> = input.iter().map(|&x| x as usize).collect();
        let m_out = self.lookup(&v_ids);
        self.cached_ids = Some(v_ids);
        m_out
    }

    fn backward(&mut self, grads: &Array2<f32>, d_lr: f32) -> Array2<f32> {
        let v_ids = self.cached_ids.as_ref().expect("forward before backward");
        if self.trainable {
            let mut m_grad = Array2::<f32>::zeros(self.weights.dim());
            for (i_row, &i_id) in v_ids.iter().enumerate() {
                let mut row = m_grad.row_mut(i_id);
                row += &grads.row(i_row);
            }
            self.optimizer.step(&mut self.weights, &m_grad, d_lr);
        }
        // ids have no gradient
        Array2::zeros((1, v_ids.len()))
    }

    fn set_accumulate_steps(&mut self, i_steps: usize) {
        self.optimizer.set_accumulate_steps(i_steps);
    }

    fn flush(&mut self, d_lr: f32) {
        if self.trainable {
            self.optimizer.flush(&mut self.weights, d_lr);
        }
    }

    fn param_shapes(&self) -> Vec<Option<(usize, usize)>> {
        vec![Some(self.weights.dim()), self.optimizer.state_shape()]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Dropout
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
pub struct Dropout {
    pub f_rate: f32,
    #[serde(skip)]
    b_train_mode: bool,
    #[serde(skip, default = "fresh_rng")]
    rng: ChaCha8Rng,
    #[serde(skip)]
    cached_mask: Option<Array2<f32>>,
}

impl Dropout {
    pub fn new(f_rate: f32, seed: u64) -> Self {
        Self {
            f_rate,
            b_train_mode: true,
            rng: ChaCha8Rng::seed_from_u64(seed),
            cached_mask: None,
        }
    }
}

impl Layer for Dropout {
    fn layer_type(&self) -> &str {
        "Dropout"
    }

    fn parameter_count(&self) -> usize {
        0
    }

    fn output_shape(&self, input: (usize, usize)) -> (usize, usize) {
        input
    }

    fn forward(&mut self, input: &Array2<f32>) -> Array2<f32> {
        if !self.b_train_mode || self.f_rate <= 0.0 {
            self.cached_mask = None;
            return input.clone();
        }
        let m_mask = dropout_mask(input.dim(), self.f_rate, &mut self.rng);
        let m_out = input * &m_mask;
        self.cached_mask = Some(m_mask);
        m_out
    }

    fn backward(&mut self, grads: &Array2<f32>, _d_lr: f32) -> Array2<f32> {
        match self.cached_mask.as_ref() {
            Some(m_mask) => grads * m_mask,
            None => grads.clone(),
        }
    }

    fn set_train_mode(&mut self, b_train: bool) {
        self.b_train_mode = b_train;
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// ConvBranch: Conv1D(valid, stride 1, ReLU) -> MaxPool1D(2) -> Flatten
// ---------------------------------------------------------------------------

pub const POOL_SIZE: usize = 2;

#[derive(Serialize, Deserialize)]
pub struct ConvBranch {
    pub i_kernel: usize,
    pub i_filters: usize,
    pub i_channels: usize,
    w: Array2<f32>, // [kernel * channels, filters]
    b: Array2<f32>, // [1, filters]
    opt_w: Adam,
    opt_b: Adam,

    #[serde(skip)]
    cached_input_rows: usize,
    #[serde(skip)]
    cached_patches: Option<Array2<f32>>,
    #[serde(skip)]
    cached_pre: Option<Array2<f32>>,
    /// winning conv row per (pooled row, filter)
    #[serde(skip)]
    cached_argmax: Option<Array2<usize>>,
}

impl ConvBranch {
    pub fn new(i_kernel: usize, i_filters: usize, i_channels: usize, rng: &mut ChaCha8Rng) -> Self {
        assert!(i_kernel > 0 && i_filters > 0 && i_channels > 0, "invalid conv dims");
        let i_fan_in = i_kernel * i_channels;
        let i_fan_out = i_kernel * i_filters;
        Self {
            i_kernel,
            i_filters,
            i_channels,
            w: glorot_uniform((i_fan_in, i_filters), i_fan_in, i_fan_out, rng),
            b: Array2::zeros((1, i_filters)),
            opt_w: Adam::new((i_fan_in, i_filters)),
            opt_b: Adam::new((1, i_filters)),
            cached_input_rows: 0,
            cached_patches: None,
            cached_pre: None,
            cached_argmax: None,
        }
    }

    /// Length after convolution, 0 when the kernel does not fit.
    pub fn conv_len(&self, i_seq: usize) -> usize {
        (i_seq + 1).saturating_sub(self.i_kernel)
    }

    pub fn pooled_len(&self, i_seq: usize) -> usize {
        self.conv_len(i_seq) / POOL_SIZE
    }

    fn im2col(&self, m_x: &ArrayView2<f32>) -> Array2<f32> {
        let i_out = self.conv_len(m_x.nrows());
        let i_width = self.i_kernel * self.i_channels;
        let mut m_patches = Array2::<f32>::zeros((i_out, i_width));
        for t in 0..i_out {
            let window = m_x.slice_axis(Axis(0), Slice::from(t..t + self.i_kernel));
            for (dst, &src) in m_patches.row_mut(t).iter_mut().zip(window.iter()) {
                *dst = src;
            }
        }
        m_patches
    }
}

impl Layer for ConvBranch {
    fn layer_type(&self) -> &str {
        "ConvBranch"
    }

    fn parameter_count(&self) -> usize {
        self.w.len() + self.b.len()
    }

    fn output_shape(&self, input: (usize, usize)) -> (usize, usize) {
        (1, self.pooled_len(input.0) * self.i_filters)
    }

    fn forward(&mut self, input: &Array2<f32>) -> Array2<f32> {
        assert_eq!(input.ncols(), self.i_channels, "conv channel mismatch");
        let m_patches = self.im2col(&input.view());
        let m_pre = m_patches.dot(&self.w) + &self.b;

        let i_pooled = m_pre.nrows() / POOL_SIZE;
        let mut m_pooled = Array2::<f32>::zeros((i_pooled, self.i_filters));
        let mut m_argmax = Array2::<usize>::zeros((i_pooled, self.i_filters));
        for p in 0..i_pooled {
            for f in 0..self.i_filters {
                let mut i_best = p * POOL_SIZE;
                let mut d_best = m_pre[(i_best, f)].max(0.0);
                for r in (p * POOL_SIZE + 1)..((p + 1) * POOL_SIZE) {
                    let d_val = m_pre[(r, f)].max(0.0);
                    if d_val > d_best {
                        d_best = d_val;
                        i_best = r;
                    }
                }
                m_pooled[(p, f)] = d_best;
                m_argmax[(p, f)] = i_best;
            }
        }

        self.cached_input_rows = input.nrows();
        self.cached_patches = Some(m_patches);
        self.cached_pre = Some(m_pre);
        self.cached_argmax = Some(m_argmax);

        // flatten row major: index p * filters + f
        let v_flat: Vec<f32> = m_pooled.iter().copied().collect();
        Array2::from_shape_vec((1, v_flat.len()), v_flat).expect("flatten shape")
    }

    fn backward(&mut self, grads: &Array2<f32>, d_lr: f32) -> Array2<f32> {
        let m_patches = self.cached_patches.as_ref().expect("forward before backward");
        let m_pre = self.cached_pre.as_ref().expect("pre activation missing");
        let m_argmax = self.cached_argmax.as_ref().expect("pool indices missing");

        // unpool + ReLU gate
        let mut m_grad_conv = Array2::<f32>::zeros(m_pre.dim());
        for ((p, f), &i_row) in m_argmax.indexed_iter() {
            if m_pre[(i_row, f)] > 0.0 {
                m_grad_conv[(i_row, f)] += grads[(0, p * self.i_filters + f)];
            }
        }

        let m_grad_w = m_patches.t().dot(&m_grad_conv);
        let m_grad_b = m_grad_conv.sum_axis(Axis(0)).insert_axis(Axis(0));
        let m_grad_patches = m_grad_conv.dot(&self.w.t());

        // col2im
        let mut m_grad_x = Array2::<f32>::zeros((self.cached_input_rows, self.i_channels));
        for t in 0..m_grad_patches.nrows() {
            let row = m_grad_patches.row(t);
            for k in 0..self.i_kernel {
                let part = row.slice_axis(Axis(0), Slice::from(k * self.i_channels..(k + 1) * self.i_channels));
                let mut dst = m_grad_x.row_mut(t + k);
                dst += &part;
            }
        }

        self.opt_w.step(&mut self.w, &m_grad_w, d_lr);
        self.opt_b.step(&mut self.b, &m_grad_b, d_lr);
        m_grad_x
    }

    fn set_accumulate_steps(&mut self, i_steps: usize) {
        self.opt_w.set_accumulate_steps(i_steps);
        self.opt_b.set_accumulate_steps(i_steps);
    }

    fn flush(&mut self, d_lr: f32) {
        self.opt_w.flush(&mut self.w, d_lr);
        self.opt_b.flush(&mut self.b, d_lr);
    }

    fn param_shapes(&self) -> Vec<Option<(usize, usize)>> {
        vec![
            Some((self.i_kernel * self.i_channels, self.i_filters)),
            Some(self.w.dim()),
            self.opt_w.state_shape(),
            Some(self.b.dim()),
            self.opt_b.state_shape(),
        ]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// ParallelConv: one ConvBranch per filter size, outputs concatenated
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize)]
pub struct ParallelConv {
    pub branches: Vec<ConvBranch>,
    #[serde(skip)]
    cached_widths: Vec<usize>,
}

impl ParallelConv {
    pub fn new(v_kernels: &[usize], i_filters: usize, i_channels: usize, rng: &mut ChaCha8Rng) -> Self {
        assert!(!v_kernels.is_empty(), "at least one filter size required");
        Self {
            branches: v_kernels
                .iter()
                .map(|&k| ConvBranch::new(k, i_filters, i_channels, rng))
                .collect(),
            cached_widths: Vec::new(),
        }
    }

    pub fn kernel_sizes(&self) -> Vec<usize> {
        self.branches.iter().map(|b| b.i_kernel).collect()
    }
}

impl Layer for ParallelConv {
    fn layer_type(&self) -> &str {
        "ParallelConv"
    }

    fn parameter_count(&self) -> usize {
        self.branches.iter().map(|b| b.parameter_count()).sum()
    }

    fn output_shape(&self, input: (usize, usize)) -> (usize, usize) {
        let i_cols = self.branches.iter().map(|b| b.output_shape(input).1).sum();
        (1, i_cols)
    }

    fn forward(&mut self, input: &Array2<f32>) -> Array2<f32> {
        let v_outs: Vec<Array2<f32>> = self.branches.iter_mut().map(|b| b.forward(input)).collect();
        self.cached_widths = v_outs.iter().map(|o| o.ncols()).collect();
        if v_outs.len() == 1 {
            return v_outs.into_iter().next().expect("one branch");
        }
        let v_views: Vec<ArrayView2<f32>> = v_outs.iter().map(|o| o.view()).collect();
        concatenate(Axis(1), &v_views).expect("branch outputs share one row")
    }

    fn backward(&mut self, grads: &Array2<f32>, d_lr: f32) -> Array2<f32> {
        let mut m_grad_x: Option<Array2<f32>> = None;
        let mut i_offset = 0;
        for (branch, &i_width) in self.branches.iter_mut().zip(self.cached_widths.iter()) {
            let part = grads
                .slice_axis(Axis(1), Slice::from(i_offset..i_offset + i_width))
                .to_owned();
            i_offset += i_width;
            let m_g = branch.backward(&part, d_lr);
            match m_grad_x.as_mut() {
                Some(acc) => Zip::from(acc).and(&m_g).for_each(|a, &g| *a += g),
                None => m_grad_x = Some(m_g),
            }
        }
        m_grad_x.expect("at least one branch")
    }

    fn set_accumulate_steps(&mut self, i_steps: usize) {
        for b in &mut self.branches {
            b.set_accumulate_steps(i_steps);
        }
    }

    fn flush(&mut self, d_lr: f32) {
        for b in &mut self.branches {
            b.flush(d_lr);
        }
    }

    fn param_shapes(&self) -> Vec<Option<(usize, usize)>> {
        self.branches.iter().flat_map(|b| b.param_shapes()).collect()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

// ---------------------------------------------------------------------------
// Dense
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Activation {
    Linear,
    Relu,
}

#[derive(Serialize, Deserialize)]
pub struct Dense {
    w: Array2<f32>, // [in, units]
    b: Array2<f32>, // [1, units]
    pub activation: Activation,
    opt_w: Adam,
    opt_b: Adam,

    #[serde(skip)]
    cached_input: Option<Array2<f32>>,
    #[serde(skip)]
    cached_pre: Option<Array2<f32>>,
}

impl Dense {
    pub fn new(i_in: usize, i_units: usize, activation: Activation, rng: &mut ChaCha8Rng) -> Self {
        assert!(i_in > 0 && i_units > 0, "invalid dense dims");
        Self {
            w: glorot_uniform((i_in, i_units), i_in, i_units, rng),
            b: Array2::zeros((1, i_units)),
            activation,
            opt_w: Adam::new((i_in, i_units)),
            opt_b: Adam::new((1, i_units)),
            cached_input: None,
            cached_pre: None,
        }
    }

    pub fn units(&self) -> usize {
        self.w.ncols()
    }
}

impl Layer for Dense {
    fn layer_type(&self) -> &str {
        "Dense"
    }

    fn parameter_count(&self) -> usize {
        self.w.len() + self.b.len()
    }

    fn output_shape(&self, input: (usize, usize)) -> (usize, usize) {
        (input.0, self.units())
    }

    fn forward(&mut self, input: &Array2<f32>) -> Array2<f32> {
        let m_pre = input.dot(&self.w) + &self.b;
        let m_out = match self.activation {
            Activation::Linear => m_pre.clone(),
            Activation::Relu => m_pre.mapv(|x| x.max(0.0)),
        };
        self.cached_input = Some(input.clone());
        self.cached_pre = Some(m_pre);
        m_out
    }

    fn backward(&mut self, grads: &Array2<f32>, d_lr: f32) -> Array2<f32> {
        let m_input = self.cached_input.as_ref().expect("forward before backward");
        let m_pre = self.cached_pre.as_ref().expect("pre activation missing");

        let m_grad_pre = match self.activation {
            Activation::Linear => grads.clone(),
            Activation::Relu => {
                let mut g = grads.clone();
                Zip::from(&mut g).and(m_pre).for_each(|g, &x| {
                    if x <= 0.0 {
                        *g = 0.0;
                    }
                });
                g
            }
        };

        let m_grad_w = m_input.t().dot(&m_grad_pre);
        let m_grad_b = m_grad_pre.sum_axis(Axis(0)).insert_axis(Axis(0));
        let m_grad_input = m_grad_pre.dot(&self.w.t());

        self.opt_w.step(&mut self.w, &m_grad_w, d_lr);
        self.opt_b.step(&mut self.b, &m_grad_b, d_lr);
        m_grad_input
    }

    fn set_accumulate_steps(&mut self, i_steps: usize) {
        self.opt_w.set_accumulate_steps(i_steps);
        self.opt_b.set_accumulate_steps(i_steps);
    }

    fn flush(&mut self, d_lr: f32) {
        self.opt_w.flush(&mut self.w, d_lr);
        self.opt_b.flush(&mut self.b, d_lr);
    }

    fn param_shapes(&self) -> Vec<Option<(usize, usize)>> {
        vec![
            Some(self.w.dim()),
            self.opt_w.state_shape(),
            Some(self.b.dim()),
            self.opt_b.state_shape(),
        ]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
