use ndarray::ArrayD;

use crate::config::GroupOptions;

/// A gradient stored as indices into the flattened parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct SparseGradient {
    pub shape: Vec<usize>,
    pub indices: Vec<usize>,
    pub values: Vec<f32>,
}

/// The gradient of a parameter as handed over by the training loop.
#[derive(Debug, Clone, PartialEq)]
pub enum Gradient {
    Dense(ArrayD<f32>),
    Sparse(SparseGradient),
}

impl Gradient {
    /// Returns the shape of the parameter this gradient belongs to.
    pub fn shape(&self) -> &[usize] {
        match self {
            Gradient::Dense(grad) => grad.shape(),
            Gradient::Sparse(grad) => &grad.shape,
        }
    }
}

impl From<ArrayD<f32>> for Gradient {
    fn from(value: ArrayD<f32>) -> Self {
        Self::Dense(value)
    }
}

/// A trainable tensor and its latest gradient.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub data: ArrayD<f32>,
    pub grad: Option<Gradient>,
}

impl Parameter {
    /// Creates a new `Parameter` without a gradient.
    pub fn new(data: ArrayD<f32>) -> Self {
        Self { data, grad: None }
    }

    /// Returns the amount of elements in this parameter.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Stores a dense gradient for the next step.
    pub fn set_grad(&mut self, grad: ArrayD<f32>) {
        self.grad = Some(Gradient::Dense(grad));
    }

    pub fn clear_grad(&mut self) {
        self.grad = None;
    }
}

/// A set of parameters sharing their hyperparameters.
#[derive(Debug, Clone)]
pub struct ParamGroup {
    pub params: Vec<Parameter>,
    pub options: GroupOptions,
    /// Multiplied into the momentum of every parameter in the group after each
    /// compressed reduction, it must broadcast to the parameters' shapes.
    pub exp_avg_mask: Option<ArrayD<f32>>,
}

impl ParamGroup {
    /// Creates a new `ParamGroup`.
    ///
    /// # Arguments
    /// * `params` - The parameters of the group, their order fixes the fused momentum layout.
    /// * `options` - The hyperparameters of the group.
    ///
    /// # Returns
    /// A new `ParamGroup` instance without a momentum mask.
    pub fn new(params: Vec<Parameter>, options: GroupOptions) -> Self {
        Self {
            params,
            options,
            exp_avg_mask: None,
        }
    }

    pub fn with_lr(mut self, lr: f32) -> Self {
        self.options.lr = lr;
        self
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.options.betas = (beta1, beta2);
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.options.weight_decay = weight_decay;
        self
    }

    pub fn with_coeff_bounds(mut self, min_coeff: f32, max_coeff: f32) -> Self {
        self.options.min_coeff = min_coeff;
        self.options.max_coeff = max_coeff;
        self
    }

    pub fn with_exp_avg_mask(mut self, mask: ArrayD<f32>) -> Self {
        self.exp_avg_mask = Some(mask);
        self
    }
}
