//! Dense Network Kernel
//!
//! A small fully-connected network with ReLU hidden layers, a sigmoid head,
//! inverted dropout, binary cross-entropy loss, and an Adam optimizer. The
//! importance model and the retrieval ranker are both instances of this
//! kernel; the layer stacks involved are a few thousand parameters, so a
//! hand-rolled implementation over flat `f32` buffers keeps the crate free
//! of a tensor framework.
//!
//! Weight initialization is derived from a fixed seed via splitmix64, so a
//! freshly constructed model is identical across processes: the same inputs
//! produce the same outputs.

/// Adam first-moment decay
const ADAM_BETA1: f32 = 0.9;
/// Adam second-moment decay
const ADAM_BETA2: f32 = 0.999;
/// Adam denominator epsilon
const ADAM_EPS: f32 = 1e-8;
/// Probability clamp for the BCE loss
const PROB_EPS: f32 = 1e-7;

// ============================================================================
// DETERMINISTIC RNG
// ============================================================================

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

fn next_uniform(state: &mut u64) -> f32 {
    // 24 high bits give a uniform in [0, 1)
    (splitmix64(state) >> 40) as f32 / (1u64 << 24) as f32
}

// ============================================================================
// LAYERS
// ============================================================================

struct Layer {
    in_dim: usize,
    out_dim: usize,
    /// Row-major `[out_dim][in_dim]`
    weights: Vec<f32>,
    bias: Vec<f32>,
    // Adam moments
    weight_m: Vec<f32>,
    weight_v: Vec<f32>,
    bias_m: Vec<f32>,
    bias_v: Vec<f32>,
}

impl Layer {
    fn new(in_dim: usize, out_dim: usize, rng: &mut u64) -> Self {
        // Xavier-uniform init
        let limit = (6.0 / (in_dim + out_dim) as f32).sqrt();
        let weights = (0..in_dim * out_dim)
            .map(|_| (next_uniform(rng) * 2.0 - 1.0) * limit)
            .collect();
        Self {
            in_dim,
            out_dim,
            weights,
            bias: vec![0.0; out_dim],
            weight_m: vec![0.0; in_dim * out_dim],
            weight_v: vec![0.0; in_dim * out_dim],
            bias_m: vec![0.0; out_dim],
            bias_v: vec![0.0; out_dim],
        }
    }

    fn forward(&self, input: &[f32], output: &mut Vec<f32>) {
        output.clear();
        for row in 0..self.out_dim {
            let offset = row * self.in_dim;
            let mut sum = self.bias[row];
            for (col, x) in input.iter().enumerate() {
                sum += self.weights[offset + col] * x;
            }
            output.push(sum);
        }
    }
}

fn adam_update(
    params: &mut [f32],
    grads: &[f32],
    m: &mut [f32],
    v: &mut [f32],
    learning_rate: f32,
    step: u64,
) {
    let bias1 = 1.0 - ADAM_BETA1.powi(step as i32);
    let bias2 = 1.0 - ADAM_BETA2.powi(step as i32);
    for i in 0..params.len() {
        m[i] = ADAM_BETA1 * m[i] + (1.0 - ADAM_BETA1) * grads[i];
        v[i] = ADAM_BETA2 * v[i] + (1.0 - ADAM_BETA2) * grads[i] * grads[i];
        let m_hat = m[i] / bias1;
        let v_hat = v[i] / bias2;
        params[i] -= learning_rate * m_hat / (v_hat.sqrt() + ADAM_EPS);
    }
}

// ============================================================================
// NETWORK
// ============================================================================

/// Feed-forward network with ReLU hidden layers and a single sigmoid output
pub struct FeedForwardNet {
    layers: Vec<Layer>,
    dropout: f32,
    learning_rate: f32,
    step: u64,
    rng_state: u64,
    /// Input the network is constrained to be non-decreasing in
    monotone_input: Option<usize>,
}

impl FeedForwardNet {
    /// Build a network for the given layer dimensions, e.g. `[384, 256, 128, 1]`.
    /// The final dimension must be 1.
    pub fn new(dims: &[usize], dropout: f32, learning_rate: f32, seed: u64) -> Self {
        debug_assert!(dims.len() >= 2);
        debug_assert_eq!(*dims.last().unwrap_or(&1), 1);
        let mut rng_state = seed;
        let layers = dims
            .windows(2)
            .map(|pair| Layer::new(pair[0], pair[1], &mut rng_state))
            .collect();
        Self {
            layers,
            dropout: dropout.clamp(0.0, 0.9),
            learning_rate,
            step: 0,
            rng_state,
            monotone_input: None,
        }
    }

    /// Constrain the output to be non-decreasing in one input. The input's
    /// first-layer column and every later layer are kept non-negative
    /// (projected after each optimizer step), which makes every
    /// input→output path sign-consistent under ReLU, so raising that input
    /// can never lower the prediction. Initial weights are folded to their
    /// absolute values so a fresh model already satisfies the constraint.
    pub fn with_monotone_input(mut self, input_index: usize) -> Self {
        self.monotone_input = Some(input_index);
        if let Some(first) = self.layers.first_mut() {
            for row in 0..first.out_dim {
                let index = row * first.in_dim + input_index;
                first.weights[index] = first.weights[index].abs();
            }
        }
        for layer in self.layers.iter_mut().skip(1) {
            for weight in layer.weights.iter_mut() {
                *weight = weight.abs();
            }
        }
        self
    }

    /// Input dimension expected by the first layer
    pub fn input_dim(&self) -> usize {
        self.layers.first().map(|layer| layer.in_dim).unwrap_or(0)
    }

    /// Forward pass without dropout; returns the sigmoid output in [0, 1]
    pub fn predict(&self, input: &[f32]) -> f32 {
        let mut current = input.to_vec();
        let mut next = Vec::new();
        let last = self.layers.len() - 1;
        for (index, layer) in self.layers.iter().enumerate() {
            layer.forward(&current, &mut next);
            if index < last {
                for value in next.iter_mut() {
                    *value = value.max(0.0);
                }
            }
            std::mem::swap(&mut current, &mut next);
        }
        sigmoid(current[0])
    }

    /// One Adam step over the batch with BCE loss against targets in [0, 1].
    /// Returns the pre-step batch loss.
    pub fn train_batch(&mut self, inputs: &[Vec<f32>], targets: &[f32]) -> f32 {
        if inputs.is_empty() || inputs.len() != targets.len() {
            return 0.0;
        }
        let batch = inputs.len() as f32;
        let last = self.layers.len() - 1;

        // Gradient accumulators
        let mut weight_grads: Vec<Vec<f32>> = self
            .layers
            .iter()
            .map(|layer| vec![0.0; layer.weights.len()])
            .collect();
        let mut bias_grads: Vec<Vec<f32>> = self
            .layers
            .iter()
            .map(|layer| vec![0.0; layer.bias.len()])
            .collect();

        let mut loss = 0.0;
        for (input, &target) in inputs.iter().zip(targets.iter()) {
            // Forward, keeping post-activation values and dropout masks
            let mut activations: Vec<Vec<f32>> = Vec::with_capacity(self.layers.len() + 1);
            let mut masks: Vec<Vec<f32>> = Vec::with_capacity(self.layers.len());
            activations.push(input.clone());
            for (index, layer) in self.layers.iter().enumerate() {
                let mut z = Vec::new();
                layer.forward(activations.last().map(|a| a.as_slice()).unwrap_or(&[]), &mut z);
                if index < last {
                    let mut mask = vec![1.0; z.len()];
                    for value in z.iter_mut() {
                        *value = value.max(0.0);
                    }
                    if self.dropout > 0.0 {
                        let keep = 1.0 - self.dropout;
                        for (value, slot) in z.iter_mut().zip(mask.iter_mut()) {
                            if next_uniform(&mut self.rng_state) < self.dropout {
                                *value = 0.0;
                                *slot = 0.0;
                            } else {
                                // Inverted dropout keeps expectations unchanged
                                *value /= keep;
                                *slot = 1.0 / keep;
                            }
                        }
                    }
                    masks.push(mask);
                }
                activations.push(z);
            }

            let logit = activations[self.layers.len()][0];
            let prob = sigmoid(logit).clamp(PROB_EPS, 1.0 - PROB_EPS);
            loss += -(target * prob.ln() + (1.0 - target) * (1.0 - prob).ln());

            // Backward; for sigmoid + BCE the output delta is (p - t)
            let mut delta = vec![(prob - target) / batch];
            for index in (0..self.layers.len()).rev() {
                let layer = &self.layers[index];
                let prev = &activations[index];
                for row in 0..layer.out_dim {
                    let offset = row * layer.in_dim;
                    for col in 0..layer.in_dim {
                        weight_grads[index][offset + col] += delta[row] * prev[col];
                    }
                    bias_grads[index][row] += delta[row];
                }
                if index > 0 {
                    let mut next_delta = vec![0.0; layer.in_dim];
                    for row in 0..layer.out_dim {
                        let offset = row * layer.in_dim;
                        for col in 0..layer.in_dim {
                            next_delta[col] += layer.weights[offset + col] * delta[row];
                        }
                    }
                    // ReLU derivative on the previous layer's activation,
                    // composed with its dropout mask
                    let mask = &masks[index - 1];
                    for (col, value) in next_delta.iter_mut().enumerate() {
                        if activations[index][col] <= 0.0 {
                            *value = 0.0;
                        } else {
                            *value *= mask[col];
                        }
                    }
                    delta = next_delta;
                }
            }
        }

        self.step += 1;
        for (index, layer) in self.layers.iter_mut().enumerate() {
            adam_update(
                &mut layer.weights,
                &weight_grads[index],
                &mut layer.weight_m,
                &mut layer.weight_v,
                self.learning_rate,
                self.step,
            );
            adam_update(
                &mut layer.bias,
                &bias_grads[index],
                &mut layer.bias_m,
                &mut layer.bias_v,
                self.learning_rate,
                self.step,
            );
        }
        self.apply_monotone_projection();

        loss / batch
    }

    /// Project the constrained weights back to the non-negative orthant
    fn apply_monotone_projection(&mut self) {
        let Some(input_index) = self.monotone_input else {
            return;
        };
        if let Some(first) = self.layers.first_mut() {
            for row in 0..first.out_dim {
                let index = row * first.in_dim + input_index;
                if first.weights[index] < 0.0 {
                    first.weights[index] = 0.0;
                }
            }
        }
        for layer in self.layers.iter_mut().skip(1) {
            for weight in layer.weights.iter_mut() {
                if *weight < 0.0 {
                    *weight = 0.0;
                }
            }
        }
    }
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_models_are_identical() {
        let a = FeedForwardNet::new(&[4, 8, 1], 0.0, 1e-3, 42);
        let b = FeedForwardNet::new(&[4, 8, 1], 0.0, 1e-3, 42);
        let input = vec![0.3, -0.2, 0.9, 0.1];
        assert_eq!(a.predict(&input), b.predict(&input));
    }

    #[test]
    fn test_prediction_in_unit_interval() {
        let net = FeedForwardNet::new(&[6, 16, 1], 0.1, 1e-3, 7);
        for seed in 0..10 {
            let input: Vec<f32> = (0..6).map(|i| ((i + seed) as f32).sin()).collect();
            let output = net.predict(&input);
            assert!((0.0..=1.0).contains(&output));
        }
    }

    #[test]
    fn test_training_reduces_loss_on_separable_data() {
        let mut net = FeedForwardNet::new(&[2, 16, 1], 0.0, 5e-2, 3);
        let inputs: Vec<Vec<f32>> = vec![
            vec![1.0, 0.0],
            vec![0.9, 0.1],
            vec![0.0, 1.0],
            vec![0.1, 0.9],
        ];
        let targets = vec![1.0, 1.0, 0.0, 0.0];
        let first = net.train_batch(&inputs, &targets);
        let mut last = first;
        for _ in 0..200 {
            last = net.train_batch(&inputs, &targets);
        }
        assert!(last < first, "loss did not improve: {first} -> {last}");
        assert!(net.predict(&[1.0, 0.0]) > 0.5);
        assert!(net.predict(&[0.0, 1.0]) < 0.5);
    }

    #[test]
    fn test_empty_batch_is_a_no_op() {
        let mut net = FeedForwardNet::new(&[2, 4, 1], 0.0, 1e-3, 1);
        assert_eq!(net.train_batch(&[], &[]), 0.0);
    }

    fn assert_monotone_in_input(net: &FeedForwardNet, input_index: usize) {
        let mut input = vec![0.3_f32, -0.4, 0.1];
        input[input_index] = -1.0;
        let mut previous = net.predict(&input);
        for step in 1..=20 {
            input[input_index] = -1.0 + step as f32 * 0.1;
            let output = net.predict(&input);
            assert!(
                output >= previous,
                "prediction dropped from {previous} to {output} at step {step}"
            );
            previous = output;
        }
    }

    #[test]
    fn test_monotone_input_holds_on_fresh_model() {
        let net = FeedForwardNet::new(&[3, 8, 1], 0.0, 1e-2, 11).with_monotone_input(0);
        assert_monotone_in_input(&net, 0);
    }

    #[test]
    fn test_monotone_input_survives_adversarial_training() {
        // Labels anti-correlated with input 0 push the weights toward a
        // decreasing fit; the projection must keep every step monotone
        let mut net = FeedForwardNet::new(&[3, 8, 1], 0.0, 5e-2, 11).with_monotone_input(0);
        let inputs: Vec<Vec<f32>> = vec![
            vec![1.0, 0.2, -0.1],
            vec![0.8, -0.3, 0.4],
            vec![-0.8, 0.1, 0.2],
            vec![-1.0, -0.2, -0.3],
        ];
        let targets = vec![0.0, 0.0, 1.0, 1.0];
        for _ in 0..100 {
            net.train_batch(&inputs, &targets);
            assert_monotone_in_input(&net, 0);
        }
    }
}
