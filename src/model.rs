use burn::{
    module::{Module, Param},
    nn::{
        Dropout, DropoutConfig, Embedding, EmbeddingConfig, Initializer, Linear, LinearConfig,
    },
    prelude::*,
    tensor::{
        Tensor,
        activation::{log_softmax, relu, softmax},
        backend::Backend,
    },
    train::ClassificationOutput,
};

use crate::data::{NUM_CLASSES, ReviewClassificationInference, ReviewClassificationTraining};

const HIDDEN_SIZE: usize = 64;
const HIDDEN_DROPOUT: f64 = 0.3;
const BOTTLENECK_SIZE: usize = 16;
const BOTTLENECK_DROPOUT: f64 = 0.2;

#[derive(Config, Debug)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub embed_dim: usize,
}

impl ModelConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> Model<B> {
        let dense = |d_input, d_output| {
            LinearConfig::new(d_input, d_output)
                .with_initializer(Initializer::XavierUniform { gain: 1.0 })
                .init(device)
        };

        Model {
            embedding: EmbeddingConfig::new(self.vocab_size, self.embed_dim).init(device),
            hidden: dense(self.embed_dim, HIDDEN_SIZE),
            hidden_dropout: DropoutConfig::new(HIDDEN_DROPOUT).init(),
            bottleneck: dense(HIDDEN_SIZE, BOTTLENECK_SIZE),
            bottleneck_dropout: DropoutConfig::new(BOTTLENECK_DROPOUT).init(),
            output: dense(BOTTLENECK_SIZE, NUM_CLASSES),
        }
    }
}

/// Sentence embedding followed by a two-block dense head over the five ratings.
#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    embedding: Embedding<B>,
    hidden: Linear<B>,
    hidden_dropout: Dropout,
    bottleneck: Linear<B>,
    bottleneck_dropout: Dropout,
    output: Linear<B>,
}

impl<B: Backend> Model<B> {
    /// Replaces the token table with pretrained vectors. The table stays trainable.
    pub fn with_embedding_weights(mut self, weights: Tensor<B, 2>) -> Self {
        self.embedding.weight = Param::from_tensor(weights);
        self
    }

    /// Returns unnormalized class scores of shape `[batch_size, NUM_CLASSES]`.
    pub fn forward(&self, input: Tensor<B, 2, Int>, mask_pad: Tensor<B, 2, Bool>) -> Tensor<B, 2> {
        let sentence = self.embed(input, mask_pad);

        let hidden = self.hidden_dropout.forward(relu(self.hidden.forward(sentence)));
        let hidden = self
            .bottleneck_dropout
            .forward(relu(self.bottleneck.forward(hidden)));

        self.output.forward(hidden)
    }

    /// sqrt(n) combiner: the sum of the non-padding token vectors divided by
    /// the square root of their count.
    fn embed(&self, input: Tensor<B, 2, Int>, mask_pad: Tensor<B, 2, Bool>) -> Tensor<B, 2> {
        let embedded_tokens = self.embedding.forward(input);
        let keep = mask_pad.bool_not().float().unsqueeze_dim::<3>(2);

        let summed = (embedded_tokens * keep.clone()).sum_dim(1).squeeze::<2>(1);
        let counts = keep.sum_dim(1).squeeze::<2>(1).clamp_min(1.0).sqrt();

        summed / counts
    }

    pub fn forward_classification(
        &self,
        item: ReviewClassificationTraining<B>,
        class_weights: Option<&Tensor<B, 1>>,
    ) -> ClassificationOutput<B> {
        let targets = item.labels;
        let output = self.forward(item.tokens, item.mask_pad);
        let loss = weighted_cross_entropy(output.clone(), targets.clone(), class_weights);

        ClassificationOutput {
            loss,
            output,
            targets,
        }
    }

    /// Class probabilities for unlabeled reviews.
    pub fn infer(&self, item: ReviewClassificationInference<B>) -> Tensor<B, 2> {
        softmax(self.forward(item.tokens, item.mask_pad), 1)
    }
}

/// Sparse categorical cross-entropy averaged over the batch, each sample
/// scaled by the weight of its target class.
pub fn weighted_cross_entropy<B: Backend>(
    logits: Tensor<B, 2>,
    targets: Tensor<B, 1, Int>,
    class_weights: Option<&Tensor<B, 1>>,
) -> Tensor<B, 1> {
    let per_sample = log_softmax(logits, 1)
        .gather(1, targets.clone().unsqueeze_dim::<2>(1))
        .squeeze::<1>(1)
        .neg();

    let per_sample = match class_weights {
        Some(weights) => per_sample * weights.clone().select(0, targets),
        None => per_sample,
    };

    per_sample.mean()
}
