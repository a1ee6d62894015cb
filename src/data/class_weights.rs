use std::collections::BTreeMap;

use super::dataset::{DataError, NUM_CLASSES};

/// Loss multiplier per class, `total / (NUM_CLASSES * count)`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassWeights {
    weights: BTreeMap<usize, f64>,
}

impl ClassWeights {
    /// Computes the weights from every label of the dataset.
    ///
    /// The observed labels must cover `0..k` without a gap; a class that never
    /// occurs below the highest observed label has no finite weight.
    pub fn from_labels<I>(labels: I) -> Result<Self, DataError>
    where
        I: IntoIterator<Item = usize>,
    {
        let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
        for label in labels {
            *counts.entry(label).or_default() += 1;
        }

        let total: usize = counts.values().sum();
        if total == 0 {
            return Err(DataError::EmptyDataset);
        }
        if let Some(label) = (0..counts.len()).find(|label| !counts.contains_key(label)) {
            return Err(DataError::MissingClass { label });
        }

        let weights = counts
            .into_iter()
            .map(|(label, count)| {
                let weight = total as f64 / (NUM_CLASSES as f64 * count as f64);
                (label, weight)
            })
            .collect();

        Ok(Self { weights })
    }

    pub fn get(&self, label: usize) -> Option<f64> {
        self.weights.get(&label).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.weights.iter().map(|(label, weight)| (*label, *weight))
    }

    /// Dense weight vector over all classes. Classes absent from the data
    /// never appear as targets and get a neutral 1.0.
    pub fn to_vec(&self) -> Vec<f32> {
        (0..NUM_CLASSES)
            .map(|label| self.get(label).unwrap_or(1.0) as f32)
            .collect()
    }
}

impl std::fmt::Display for ClassWeights {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries: Vec<String> = self
            .iter()
            .map(|(label, weight)| format!("{label}: {weight}"))
            .collect();
        write!(f, "{{{}}}", entries.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels_with_counts(counts: &[usize]) -> Vec<usize> {
        counts
            .iter()
            .enumerate()
            .flat_map(|(label, count)| std::iter::repeat(label).take(*count))
            .collect()
    }

    #[test]
    fn weights_are_total_over_five_times_count() {
        let counts = [10, 20, 30, 15, 25];
        let weights = ClassWeights::from_labels(labels_with_counts(&counts)).unwrap();

        let total: usize = counts.iter().sum();
        for (label, count) in counts.iter().enumerate() {
            let expected = total as f64 / (5.0 * *count as f64);
            let actual = weights.get(label).unwrap();
            assert!((actual - expected).abs() < 1e-12, "label {label}");
        }
    }

    #[test]
    fn missing_interior_class_fails() {
        // No review with three stars (label 2).
        let labels = labels_with_counts(&[4, 4, 0, 4, 4]);

        let err = ClassWeights::from_labels(labels).unwrap_err();

        assert!(matches!(err, DataError::MissingClass { label: 2 }));
    }

    #[test]
    fn leading_classes_only_are_accepted() {
        let weights = ClassWeights::from_labels(labels_with_counts(&[5, 3, 2])).unwrap();

        assert_eq!(weights.get(0), Some(10.0 / 25.0));
        assert_eq!(weights.get(3), None);
        assert_eq!(weights.to_vec()[3], 1.0);
        assert_eq!(weights.to_vec().len(), NUM_CLASSES);
    }

    #[test]
    fn empty_labels_fail() {
        let err = ClassWeights::from_labels(Vec::new()).unwrap_err();
        assert!(matches!(err, DataError::EmptyDataset));
    }
}
