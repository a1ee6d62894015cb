use super::{dataset::ReviewClassificationItem, tokenizer::Tokenizer};
use burn::{data::dataloader::batcher::Batcher, nn::attention::generate_padding_mask, prelude::*};
use std::sync::Arc;

#[derive(Clone, derive_new::new)]
pub struct ReviewClassificationBatcher<B: Backend> {
    tokenizer: Arc<dyn Tokenizer>,
    device: B::Device,
    max_seq_len: usize,
}

#[derive(Debug, Clone, derive_new::new)]
pub struct ReviewClassificationTraining<B: Backend> {
    pub tokens: Tensor<B, 2, Int>,
    pub labels: Tensor<B, 1, Int>,
    pub mask_pad: Tensor<B, 2, Bool>,
}

#[derive(Debug, Clone, derive_new::new)]
pub struct ReviewClassificationInference<B: Backend> {
    pub tokens: Tensor<B, 2, Int>,
    pub mask_pad: Tensor<B, 2, Bool>,
}

impl<B: Backend> ReviewClassificationBatcher<B> {
    /// Blank reviews become a single padding token, so every row keeps at
    /// least one position and is fully masked.
    fn encode_all<'a>(&self, texts: impl Iterator<Item = &'a str>) -> Vec<Vec<usize>> {
        texts
            .map(|text| {
                let tokens = self.tokenizer.encode(text);
                if tokens.is_empty() {
                    vec![self.tokenizer.pad_token()]
                } else {
                    tokens
                }
            })
            .collect()
    }
}

impl<B: Backend> Batcher<ReviewClassificationItem, ReviewClassificationTraining<B>>
    for ReviewClassificationBatcher<B>
{
    fn batch(&self, items: Vec<ReviewClassificationItem>) -> ReviewClassificationTraining<B> {
        let tokens_list = self.encode_all(items.iter().map(|item| item.text.as_str()));
        let labels = items
            .iter()
            .map(|item| (item.label as i64).elem::<B::IntElem>())
            .collect::<Vec<_>>();
        let batch_size = labels.len();

        let mask = generate_padding_mask(
            self.tokenizer.pad_token(),
            tokens_list,
            Some(self.max_seq_len),
            &self.device,
        );

        ReviewClassificationTraining {
            tokens: mask.tensor,
            labels: Tensor::from_data(TensorData::new(labels, [batch_size]), &self.device),
            mask_pad: mask.mask,
        }
    }
}

impl<B: Backend> Batcher<String, ReviewClassificationInference<B>>
    for ReviewClassificationBatcher<B>
{
    fn batch(&self, items: Vec<String>) -> ReviewClassificationInference<B> {
        let tokens_list = self.encode_all(items.iter().map(String::as_str));

        let mask = generate_padding_mask(
            self.tokenizer.pad_token(),
            tokens_list,
            Some(self.max_seq_len),
            &self.device,
        );

        ReviewClassificationInference {
            tokens: mask.tensor.to_device(&self.device),
            mask_pad: mask.mask.to_device(&self.device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::tokenizer::TextTokenizer;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn pads_reviews_and_masks_padding() {
        let tokenizer = Arc::new(TextTokenizer::from_corpus(["super parc", "trop cher hélas"]).unwrap());
        let batcher = ReviewClassificationBatcher::<TestBackend>::new(tokenizer, Default::default(), 8);

        let batch: ReviewClassificationTraining<TestBackend> = batcher.batch(vec![
            ReviewClassificationItem::new(4, "super parc".to_string()),
            ReviewClassificationItem::new(0, "trop cher hélas".to_string()),
        ]);

        assert_eq!(batch.tokens.dims(), [2, 3]);
        assert_eq!(batch.labels.into_data().iter::<i64>().collect::<Vec<_>>(), vec![4, 0]);
        let padded = batch.mask_pad.into_data().iter::<bool>().collect::<Vec<_>>();
        assert_eq!(padded, vec![false, false, true, false, false, false]);
    }

    #[test]
    fn blank_review_is_a_fully_masked_row() {
        let tokenizer = Arc::new(TextTokenizer::from_corpus(["super parc"]).unwrap());
        let batcher = ReviewClassificationBatcher::<TestBackend>::new(tokenizer, Default::default(), 8);

        let batch: ReviewClassificationTraining<TestBackend> = batcher.batch(vec![
            ReviewClassificationItem::new(4, "super parc".to_string()),
            ReviewClassificationItem::new(1, "   ".to_string()),
        ]);

        assert_eq!(batch.tokens.dims(), [2, 2]);
        let padded = batch.mask_pad.into_data().iter::<bool>().collect::<Vec<_>>();
        assert_eq!(padded, vec![false, false, true, true]);
    }

    #[test]
    fn batch_of_only_blank_reviews_has_one_position() {
        let tokenizer = Arc::new(TextTokenizer::from_corpus(["super parc"]).unwrap());
        let batcher = ReviewClassificationBatcher::<TestBackend>::new(tokenizer, Default::default(), 8);

        let batch: ReviewClassificationInference<TestBackend> =
            batcher.batch(vec![String::new(), " ".to_string()]);

        assert_eq!(batch.tokens.dims(), [2, 1]);
    }

    #[test]
    fn truncates_to_max_sequence_length() {
        let tokenizer = Arc::new(TextTokenizer::from_corpus(["a b c d e"]).unwrap());
        let batcher = ReviewClassificationBatcher::<TestBackend>::new(tokenizer, Default::default(), 3);

        let batch: ReviewClassificationInference<TestBackend> =
            batcher.batch(vec!["a b c d e".to_string()]);

        assert_eq!(batch.tokens.dims(), [1, 3]);
    }
}
