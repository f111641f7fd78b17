/*!

  The network-level forward reasoner, as seen from the engine.

  The engine never walks network layers itself; when a caller has a
  layered model behind the query it supplies a `NetworkOracle`, and the
  SoI input-assignment initialization classifies constraint phases from a
  forward-propagated concretization of the input variables. Without an
  oracle the initialization falls back to the current LP assignment.

  `LayeredNetwork` is the bundled implementation: a plain feed-forward
  stack of weighted sums and element-wise activations whose neurons are
  wired to query variables.

*/

use crate::Variable;

pub trait NetworkOracle: Send {
  /// Concretizes the input variables from their current intervals and
  /// forward-evaluates the model, returning a value for every variable.
  fn concretize_input_assignment(&self, lower: &[f64], upper: &[f64]) -> Vec<f64>;
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Activation {
  Linear,
  Relu,
  Abs,
  Sign,
  Clip { floor: f64, ceiling: f64 },
}

impl Activation {
  fn apply(self, x: f64) -> f64 {
    match self {
      Activation::Linear => x,
      Activation::Relu   => x.max(0.0),
      Activation::Abs    => x.abs(),
      Activation::Sign   => if x >= 0.0 { 1.0 } else { -1.0 },
      Activation::Clip { floor, ceiling } => x.max(floor).min(ceiling),
    }
  }
}

/// One layer: `post = activation(W * previous + b)`, with the pre- and
/// post-activation neurons wired to query variables so a forward pass
/// fills in an assignment.
#[derive(Clone, Debug)]
pub struct Layer {
  pub weights       : Vec<Vec<f64>>,
  pub biases        : Vec<f64>,
  pub activation    : Activation,
  pub pre_variables : Vec<Variable>,
  pub post_variables: Vec<Variable>,
}

#[derive(Clone, Debug, Default)]
pub struct LayeredNetwork {
  input_variables: Vec<Variable>,
  layers         : Vec<Layer>,
}

impl LayeredNetwork {
  pub fn new(input_variables: Vec<Variable>) -> Self {
    LayeredNetwork {
      input_variables,
      layers: Vec::new(),
    }
  }

  pub fn add_layer(&mut self, layer: Layer) {
    debug_assert!(layer.weights.len() == layer.biases.len());
    debug_assert!(layer.weights.len() == layer.pre_variables.len());
    debug_assert!(layer.weights.len() == layer.post_variables.len());
    self.layers.push(layer);
  }

  /// Forward-evaluates from concrete input values, writing every wired
  /// variable into `assignment`.
  pub fn forward(&self, inputs: &[f64], assignment: &mut [f64]) {
    debug_assert!(inputs.len() == self.input_variables.len());

    for (variable, value) in self.input_variables.iter().zip(inputs) {
      assignment[*variable] = *value;
    }

    let mut previous: Vec<f64> = inputs.to_vec();
    for layer in &self.layers {
      let mut post = Vec::with_capacity(layer.weights.len());
      for (neuron, row) in layer.weights.iter().enumerate() {
        debug_assert!(row.len() == previous.len());
        let pre: f64 = layer.biases[neuron]
                       + row.iter().zip(&previous).map(|(w, x)| w * x).sum::<f64>();
        assignment[layer.pre_variables[neuron]] = pre;
        let value = layer.activation.apply(pre);
        assignment[layer.post_variables[neuron]] = value;
        post.push(value);
      }
      previous = post;
    }
  }
}

impl NetworkOracle for LayeredNetwork {
  fn concretize_input_assignment(&self, lower: &[f64], upper: &[f64]) -> Vec<f64> {
    // Inputs at interval midpoints where finite; a half-open interval
    // concretizes at its finite end.
    let inputs: Vec<f64> = self.input_variables
                               .iter()
                               .map(|&v| match (lower[v].is_finite(), upper[v].is_finite()) {
                                 (true, true)   => (lower[v] + upper[v]) / 2.0,
                                 (true, false)  => lower[v],
                                 (false, true)  => upper[v],
                                 (false, false) => 0.0,
                               })
                               .collect();

    let mut assignment = vec![0.0; lower.len()];
    self.forward(&inputs, &mut assignment);
    assignment
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  /// x0 -> pre x1 = 2 x0 - 1, post x2 = relu(x1).
  fn single_relu_network() -> LayeredNetwork {
    let mut network = LayeredNetwork::new(vec![0]);
    network.add_layer(Layer {
      weights       : vec![vec![2.0]],
      biases        : vec![-1.0],
      activation    : Activation::Relu,
      pre_variables : vec![1],
      post_variables: vec![2],
    });
    network
  }

  #[test]
  fn forward_fills_pre_and_post_activations() {
    let network = single_relu_network();
    let mut assignment = vec![0.0; 3];

    network.forward(&[2.0], &mut assignment);
    assert_eq!(assignment, vec![2.0, 3.0, 3.0]);

    network.forward(&[0.0], &mut assignment);
    assert_eq!(assignment, vec![0.0, -1.0, 0.0]);
  }

  #[test]
  fn concretization_takes_interval_midpoints() {
    let network = single_relu_network();
    let lower = vec![1.0, f64::NEG_INFINITY, f64::NEG_INFINITY];
    let upper = vec![3.0, f64::INFINITY, f64::INFINITY];

    let assignment = network.concretize_input_assignment(&lower, &upper);
    assert_eq!(assignment[0], 2.0);
    assert_eq!(assignment[1], 3.0);
    assert_eq!(assignment[2], 3.0);
  }

  #[test]
  fn layers_chain() {
    // x0 -> relu(x0) at (x1, x2) -> sign(x2 - 1) at (x3, x4).
    let mut network = LayeredNetwork::new(vec![0]);
    network.add_layer(Layer {
      weights       : vec![vec![1.0]],
      biases        : vec![0.0],
      activation    : Activation::Relu,
      pre_variables : vec![1],
      post_variables: vec![2],
    });
    network.add_layer(Layer {
      weights       : vec![vec![1.0]],
      biases        : vec![-1.0],
      activation    : Activation::Sign,
      pre_variables : vec![3],
      post_variables: vec![4],
    });

    let mut assignment = vec![0.0; 5];
    network.forward(&[0.5], &mut assignment);
    assert_eq!(assignment[2], 0.5);
    assert_eq!(assignment[3], -0.5);
    assert_eq!(assignment[4], -1.0);
  }
}
