use rand::Rng;
use rand::seq::SliceRandom;

/// Share of the shuffled reviews cut into the training split.
pub const TRAIN_FRACTION: f64 = 0.7;

/// Shuffles `records` with the thread RNG and cuts them into (train, test).
pub fn split_train_test<T: Clone>(records: Vec<T>, train_fraction: f64) -> (Vec<T>, Vec<T>) {
    split_train_test_with(records, train_fraction, &mut rand::thread_rng())
}

/// Shuffles `records` and cuts them at `floor(train_fraction * len)`.
///
/// The cut is inclusive on the training side: train holds permuted rows
/// `0..=train_size` and test holds `train_size..`, so the boundary row lands
/// in both splits and `train.len() + test.len() == records.len() + 1` for any
/// non-empty input.
pub fn split_train_test_with<T: Clone, R: Rng + ?Sized>(
    mut records: Vec<T>,
    train_fraction: f64,
    rng: &mut R,
) -> (Vec<T>, Vec<T>) {
    records.shuffle(rng);

    let total = records.len();
    let train_size = ((total as f64) * train_fraction) as usize;
    let train_end = (train_size + 1).min(total);

    let test = records[train_size.min(total)..].to_vec();
    records.truncate(train_end);

    log::info!(
        "Split {} reviews into {} train / {} test (boundary row at position {})",
        total,
        records.len(),
        test.len(),
        train_size
    );

    (records, test)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_row_is_counted_in_both_splits() {
        for total in [1usize, 2, 10, 11, 100] {
            let items: Vec<usize> = (0..total).collect();
            let (train, test) = split_train_test(items, TRAIN_FRACTION);
            assert_eq!(train.len() + test.len() - 1, total, "total = {total}");
            assert_eq!(train.last(), test.first());
        }
    }

    #[test]
    fn split_sizes_follow_floor_of_fraction() {
        let items: Vec<usize> = (0..10).collect();
        let (train, test) = split_train_test(items, 0.7);
        assert_eq!(train.len(), 8);
        assert_eq!(test.len(), 3);
    }

    #[test]
    fn every_record_is_kept() {
        let items: Vec<usize> = (0..50).collect();
        let (train, test) = split_train_test(items, TRAIN_FRACTION);

        let mut seen: Vec<usize> = train.into_iter().chain(test).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());
    }

    #[test]
    fn empty_input_gives_empty_splits() {
        let (train, test) = split_train_test(Vec::<usize>::new(), TRAIN_FRACTION);
        assert!(train.is_empty());
        assert!(test.is_empty());
    }

    #[test]
    fn repeated_splits_are_not_pinned_to_one_order() {
        let items: Vec<usize> = (0..100).collect();
        let (first, _) = split_train_test(items.clone(), TRAIN_FRACTION);

        // 100! orderings: twenty identical draws in a row would mean the
        // shuffle is seeded.
        let differs = (0..20).any(|_| split_train_test(items.clone(), TRAIN_FRACTION).0 != first);
        assert!(differs);
    }
}
