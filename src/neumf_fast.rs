use std::collections::HashMap;

use ndarray::{s, Array, Array1, Array2, ArrayView, ArrayView1, ArrayViewMut, Dimension, Ix1, Ix2, Zip};
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::Rng;

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::neumf::{Flt, Learner};

static EPSILON: Flt = 1e-7;
static EMBEDDING_SCALE: Flt = 0.01;
static ADAM_BETA_1: Flt = 0.9;
static ADAM_BETA_2: Flt = 0.999;
static RMSPROP_RHO: Flt = 0.9;
static ADAGRAD_INITIAL_ACCUMULATOR: Flt = 0.1;

/// A fully connected layer; `kernel` is `[inputs, outputs]`.
#[derive(Debug, Clone)]
pub(crate) struct Dense {
    pub(crate) kernel: Array2<Flt>,
    pub(crate) bias: Array1<Flt>,
}

impl Dense {
    fn zeros(inputs: usize, outputs: usize) -> Dense {
        Dense {
            kernel: Array2::zeros((inputs, outputs)),
            bias: Array1::zeros(outputs),
        }
    }

    fn glorot_uniform<R: Rng + ?Sized>(inputs: usize, outputs: usize, rng: &mut R) -> Dense {
        let limit = (6.0 / (inputs + outputs) as Flt).sqrt();
        Dense {
            kernel: Array2::random_using((inputs, outputs), Uniform::new(-limit, limit), rng),
            bias: Array1::zeros(outputs),
        }
    }

    fn lecun_uniform<R: Rng + ?Sized>(inputs: usize, outputs: usize, rng: &mut R) -> Dense {
        let limit = (3.0 / inputs as Flt).sqrt();
        Dense {
            kernel: Array2::random_using((inputs, outputs), Uniform::new(-limit, limit), rng),
            bias: Array1::zeros(outputs),
        }
    }

    #[inline(always)]
    fn forward(&self, input: ArrayView1<Flt>) -> Array1<Flt> {
        input.dot(&self.kernel) + &self.bias
    }
}

pub(crate) struct FastNeuMF {
    pub(crate) mf_user: Array2<Flt>,
    pub(crate) mf_item: Array2<Flt>,
    pub(crate) mlp_user: Array2<Flt>,
    pub(crate) mlp_item: Array2<Flt>,
    pub(crate) layers: Vec<Dense>,
    pub(crate) prediction: Dense,
}

impl FastNeuMF {
    pub(crate) fn new<R: Rng + ?Sized>(
        user_rows: usize,
        item_rows: usize,
        config: &ModelConfig,
        rng: &mut R,
    ) -> Result<FastNeuMF> {
        let mlp_dim = config.mlp_embedding_dim();
        let layers = config
            .layers
            .windows(2)
            .map(|w| Dense::glorot_uniform(w[0], w[1], rng))
            .collect::<Vec<_>>();
        Ok(FastNeuMF {
            mf_user: variance_scaling(user_rows, config.mf_dim, rng)?,
            mf_item: variance_scaling(item_rows, config.mf_dim, rng)?,
            mlp_user: variance_scaling(user_rows, mlp_dim, rng)?,
            mlp_item: variance_scaling(item_rows, mlp_dim, rng)?,
            layers,
            prediction: Dense::lecun_uniform(config.predictive_factors(), 1, rng),
        })
    }

    pub(crate) fn user_rows(&self) -> usize {
        self.mf_user.nrows()
    }

    pub(crate) fn item_rows(&self) -> usize {
        self.mf_item.nrows()
    }

    pub(crate) fn mf_dim(&self) -> usize {
        self.mf_user.ncols()
    }

    pub(crate) fn forward(&self, user: usize, item: usize) -> Activations {
        let mf_vector = &self.mf_user.row(user) * &self.mf_item.row(item);

        let half = self.mlp_user.ncols();
        let mut mlp_input = Array1::zeros(2 * half);
        mlp_input.slice_mut(s![..half]).assign(&self.mlp_user.row(user));
        mlp_input.slice_mut(s![half..]).assign(&self.mlp_item.row(item));

        let mut hidden: Vec<Array1<Flt>> = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let input = hidden.last().unwrap_or(&mlp_input);
            let output = layer.forward(input.view()).mapv(|v| v.max(0.0));
            hidden.push(output);
        }

        let mlp_vector = hidden.last().unwrap_or(&mlp_input);
        let mf_dim = mf_vector.len();
        let mut predict_vector = Array1::zeros(mf_dim + mlp_vector.len());
        predict_vector.slice_mut(s![..mf_dim]).assign(&mf_vector);
        predict_vector.slice_mut(s![mf_dim..]).assign(mlp_vector);

        let logit = predict_vector.dot(&self.prediction.kernel.column(0)) + self.prediction.bias[0];
        Activations {
            mlp_input,
            hidden,
            predict_vector,
            score: sigmoid(logit),
        }
    }

    #[inline(always)]
    pub(crate) fn score(&self, user: usize, item: usize) -> Flt {
        self.forward(user, item).score
    }
}

/// Intermediate values of one forward pass, kept for the backward pass.
pub(crate) struct Activations {
    mlp_input: Array1<Flt>,
    hidden: Vec<Array1<Flt>>,
    predict_vector: Array1<Flt>,
    pub(crate) score: Flt,
}

/// Gradients accumulated over a mini-batch. Embedding gradients are sparse:
/// only rows seen in the batch are stored.
pub(crate) struct Gradients {
    mf_user: HashMap<usize, Array1<Flt>>,
    mf_item: HashMap<usize, Array1<Flt>>,
    mlp_user: HashMap<usize, Array1<Flt>>,
    mlp_item: HashMap<usize, Array1<Flt>>,
    layers: Vec<Dense>,
    prediction: Dense,
    pub(crate) loss: f64,
    pub(crate) correct: usize,
    pub(crate) count: usize,
}

impl Gradients {
    pub(crate) fn zeros(model: &FastNeuMF) -> Gradients {
        Gradients {
            mf_user: HashMap::new(),
            mf_item: HashMap::new(),
            mlp_user: HashMap::new(),
            mlp_item: HashMap::new(),
            layers: model
                .layers
                .iter()
                .map(|l| Dense::zeros(l.kernel.nrows(), l.kernel.ncols()))
                .collect(),
            prediction: Dense::zeros(model.prediction.kernel.nrows(), 1),
            loss: 0.0,
            correct: 0,
            count: 0,
        }
    }

    /// Runs forward and backward for one instance of binary cross-entropy.
    /// `scale` is `1 / batch_size` so the batch gradient is a mean.
    pub(crate) fn accumulate(&mut self, model: &FastNeuMF, user: usize, item: usize, label: Flt, scale: Flt) {
        let act = model.forward(user, item);

        let clipped = act.score.clamp(EPSILON, 1.0 - EPSILON);
        self.loss -= (label * clipped.ln() + (1.0 - label) * (1.0 - clipped).ln()) as f64;
        if (act.score >= 0.5) == (label >= 0.5) {
            self.correct += 1;
        }
        self.count += 1;

        // sigmoid + cross-entropy collapse to (p - y) at the logit
        let d_logit = (act.score - label) * scale;
        self.prediction
            .kernel
            .column_mut(0)
            .scaled_add(d_logit, &act.predict_vector);
        self.prediction.bias[0] += d_logit;

        let d_predict = model.prediction.kernel.column(0).mapv(|w| w * d_logit);
        let mf_dim = model.mf_dim();
        let d_mf = d_predict.slice(s![..mf_dim]);
        let mut d_hidden = d_predict.slice(s![mf_dim..]).to_owned();

        for idx in (0..model.layers.len()).rev() {
            let input = if idx == 0 { &act.mlp_input } else { &act.hidden[idx - 1] };
            let d_z = Zip::from(&d_hidden)
                .and(&act.hidden[idx])
                .map_collect(|&d, &out| if out > 0.0 { d } else { 0.0 });
            let grad = &mut self.layers[idx];
            for (r, &x) in input.iter().enumerate() {
                if x != 0.0 {
                    grad.kernel.row_mut(r).scaled_add(x, &d_z);
                }
            }
            grad.bias += &d_z;
            d_hidden = model.layers[idx].kernel.dot(&d_z);
        }

        let half = model.mlp_user.ncols();
        add_row(&mut self.mlp_user, user, d_hidden.slice(s![..half]));
        add_row(&mut self.mlp_item, item, d_hidden.slice(s![half..]));
        add_row(&mut self.mf_user, user, (&d_mf * &model.mf_item.row(item)).view());
        add_row(&mut self.mf_item, item, (&d_mf * &model.mf_user.row(user)).view());
    }

    pub(crate) fn merge(mut self, other: Gradients) -> Gradients {
        merge_rows(&mut self.mf_user, other.mf_user);
        merge_rows(&mut self.mf_item, other.mf_item);
        merge_rows(&mut self.mlp_user, other.mlp_user);
        merge_rows(&mut self.mlp_item, other.mlp_item);
        for (mine, theirs) in self.layers.iter_mut().zip(other.layers.iter()) {
            mine.kernel += &theirs.kernel;
            mine.bias += &theirs.bias;
        }
        self.prediction.kernel += &other.prediction.kernel;
        self.prediction.bias += &other.prediction.bias;
        self.loss += other.loss;
        self.correct += other.correct;
        self.count += other.count;
        self
    }
}

#[inline(always)]
fn add_row(grads: &mut HashMap<usize, Array1<Flt>>, row: usize, grad: ArrayView1<Flt>) {
    grads
        .entry(row)
        .and_modify(|acc| *acc += &grad)
        .or_insert_with(|| grad.to_owned());
}

fn merge_rows(into: &mut HashMap<usize, Array1<Flt>>, from: HashMap<usize, Array1<Flt>>) {
    for (row, grad) in from {
        add_row(into, row, grad.view());
    }
}

/// First and second moment accumulators for one parameter tensor.
pub(crate) struct Moments<D: Dimension> {
    first: Array<Flt, D>,
    second: Array<Flt, D>,
}

impl<D: Dimension> Moments<D> {
    fn like(param: &Array<Flt, D>, learner: Learner) -> Moments<D> {
        let initial = match learner {
            Learner::Adagrad => ADAGRAD_INITIAL_ACCUMULATOR,
            _ => 0.0,
        };
        Moments {
            first: Array::zeros(param.raw_dim()),
            second: Array::from_elem(param.raw_dim(), initial),
        }
    }
}

/// Per-coordinate update rule for one optimizer step.
#[derive(Clone, Copy)]
struct Step {
    learner: Learner,
    learning_rate: Flt,
}

impl Step {
    #[inline(always)]
    fn apply(&self, param: &mut Flt, grad: Flt, first: &mut Flt, second: &mut Flt) {
        match self.learner {
            Learner::Sgd => {
                *param -= self.learning_rate * grad;
            }
            Learner::Adagrad => {
                *second += grad * grad;
                *param -= self.learning_rate * grad / (second.sqrt() + EPSILON);
            }
            Learner::RmsProp => {
                *second = RMSPROP_RHO * *second + (1.0 - RMSPROP_RHO) * grad * grad;
                *param -= self.learning_rate * grad / (second.sqrt() + EPSILON);
            }
            Learner::Adam => {
                *first = ADAM_BETA_1 * *first + (1.0 - ADAM_BETA_1) * grad;
                *second = ADAM_BETA_2 * *second + (1.0 - ADAM_BETA_2) * grad * grad;
                *param -= self.learning_rate * *first / (second.sqrt() + EPSILON);
            }
        }
    }

    fn update<D: Dimension>(
        &self,
        param: ArrayViewMut<Flt, D>,
        grad: ArrayView<Flt, D>,
        first: ArrayViewMut<Flt, D>,
        second: ArrayViewMut<Flt, D>,
    ) {
        Zip::from(param)
            .and(grad)
            .and(first)
            .and(second)
            .for_each(|p, &g, m, v| self.apply(p, g, m, v));
    }
}

pub(crate) struct Optimizer {
    learner: Learner,
    learning_rate: Flt,
    iterations: i32,
    mf_user: Moments<Ix2>,
    mf_item: Moments<Ix2>,
    mlp_user: Moments<Ix2>,
    mlp_item: Moments<Ix2>,
    layers: Vec<(Moments<Ix2>, Moments<Ix1>)>,
    prediction: (Moments<Ix2>, Moments<Ix1>),
}

impl Optimizer {
    pub(crate) fn new(model: &FastNeuMF, learner: Learner, learning_rate: Flt) -> Optimizer {
        Optimizer {
            learner,
            learning_rate,
            iterations: 0,
            mf_user: Moments::like(&model.mf_user, learner),
            mf_item: Moments::like(&model.mf_item, learner),
            mlp_user: Moments::like(&model.mlp_user, learner),
            mlp_item: Moments::like(&model.mlp_item, learner),
            layers: model
                .layers
                .iter()
                .map(|l| (Moments::like(&l.kernel, learner), Moments::like(&l.bias, learner)))
                .collect(),
            prediction: (
                Moments::like(&model.prediction.kernel, learner),
                Moments::like(&model.prediction.bias, learner),
            ),
        }
    }

    pub(crate) fn learner(&self) -> Learner {
        self.learner
    }

    fn next_step(&mut self) -> Step {
        self.iterations += 1;
        let learning_rate = match self.learner {
            Learner::Adam => {
                let t = self.iterations;
                self.learning_rate * (1.0 - ADAM_BETA_2.powi(t)).sqrt() / (1.0 - ADAM_BETA_1.powi(t))
            }
            _ => self.learning_rate,
        };
        Step {
            learner: self.learner,
            learning_rate,
        }
    }

    /// Applies one batch of gradients plus L2 penalties. Returns the penalty
    /// term for the parameters it touched.
    pub(crate) fn step(&mut self, model: &mut FastNeuMF, grads: &Gradients, config: &ModelConfig) -> Flt {
        let step = self.next_step();
        let mut penalty = 0.0;

        penalty += update_embedding(&mut model.mf_user, &grads.mf_user, &mut self.mf_user, config.reg_mf, step);
        penalty += update_embedding(&mut model.mf_item, &grads.mf_item, &mut self.mf_item, config.reg_mf, step);
        penalty += update_embedding(&mut model.mlp_user, &grads.mlp_user, &mut self.mlp_user, config.reg_layers[0], step);
        penalty += update_embedding(&mut model.mlp_item, &grads.mlp_item, &mut self.mlp_item, config.reg_layers[0], step);

        for (idx, (layer, grad)) in model.layers.iter_mut().zip(grads.layers.iter()).enumerate() {
            let reg = config.reg_layers[idx + 1];
            let mut kernel_grad = grad.kernel.clone();
            if reg > 0.0 {
                penalty += reg * layer.kernel.mapv(|w| w * w).sum();
                kernel_grad.scaled_add(2.0 * reg, &layer.kernel);
            }
            let (kernel_moments, bias_moments) = &mut self.layers[idx];
            step.update(
                layer.kernel.view_mut(),
                kernel_grad.view(),
                kernel_moments.first.view_mut(),
                kernel_moments.second.view_mut(),
            );
            step.update(
                layer.bias.view_mut(),
                grad.bias.view(),
                bias_moments.first.view_mut(),
                bias_moments.second.view_mut(),
            );
        }

        let (kernel_moments, bias_moments) = &mut self.prediction;
        step.update(
            model.prediction.kernel.view_mut(),
            grads.prediction.kernel.view(),
            kernel_moments.first.view_mut(),
            kernel_moments.second.view_mut(),
        );
        step.update(
            model.prediction.bias.view_mut(),
            grads.prediction.bias.view(),
            bias_moments.first.view_mut(),
            bias_moments.second.view_mut(),
        );
        penalty
    }
}

/// Updates only the rows present in `grads`; moments of other rows stay as they are.
fn update_embedding(
    table: &mut Array2<Flt>,
    grads: &HashMap<usize, Array1<Flt>>,
    moments: &mut Moments<Ix2>,
    reg: Flt,
    step: Step,
) -> Flt {
    let mut penalty = 0.0;
    for (&row, grad) in grads {
        let mut grad = grad.clone();
        if reg > 0.0 {
            let weights = table.row(row);
            penalty += reg * weights.dot(&weights);
            grad.scaled_add(2.0 * reg, &weights);
        }
        step.update(
            table.row_mut(row),
            grad.view(),
            moments.first.row_mut(row),
            moments.second.row_mut(row),
        );
    }
    penalty
}

/// Normal(0, sqrt(scale / fan_in)) where an embedding table's fan-in is its row count.
fn variance_scaling<R: Rng + ?Sized>(rows: usize, cols: usize, rng: &mut R) -> Result<Array2<Flt>> {
    let std_dev = (EMBEDDING_SCALE / rows.max(1) as Flt).sqrt();
    let normal = Normal::new(0.0, std_dev).map_err(|err| Error::Config(err.to_string()))?;
    Ok(Array2::random_using((rows, cols), normal, rng))
}

#[inline(always)]
pub(crate) fn sigmoid(x: Flt) -> Flt {
    1.0 / (1.0 + (-x).exp())
}
