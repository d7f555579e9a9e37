//! Fold generation for the outer (calibration) and inner (regularization)
//! cross-validation loops.

use ndarray::ArrayView1;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use thiserror::Error;

/// A single train/test partition of the sample indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldSplit {
    pub fold_index: usize,
    pub train_indices: Vec<usize>,
    pub test_indices: Vec<usize>,
}

#[derive(Error, Debug, PartialEq)]
pub enum FoldError {
    #[error("Cross-validation needs at least 2 folds, but {0} were requested.")]
    InvalidSplitCount(usize),

    #[error("Cannot split {n_samples} samples into {n_splits} non-empty folds.")]
    TooFewSamples { n_samples: usize, n_splits: usize },
}

/// Splits samples into `n_splits` folds that each preserve the class ratio of
/// `labels` as closely as integer counts allow.
///
/// Indices of each class are (optionally shuffled with `rng` and) dealt
/// round-robin into the folds. The deal continues across classes, so overall
/// fold sizes differ by at most one. Every index lands in exactly one test fold.
pub fn stratified_k_fold(
    labels: ArrayView1<f64>,
    n_splits: usize,
    mut rng: Option<&mut StdRng>,
) -> Result<Vec<FoldSplit>, FoldError> {
    check_split_request(labels.len(), n_splits)?;

    let mut classes: Vec<f64> = labels.to_vec();
    classes.sort_unstable_by(f64::total_cmp);
    classes.dedup();

    let mut folds: Vec<Vec<usize>> = vec![Vec::new(); n_splits];
    let mut dealt = 0;
    for class in classes {
        let mut members: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|&(_, &label)| label == class)
            .map(|(idx, _)| idx)
            .collect();
        if let Some(rng) = rng.as_deref_mut() {
            members.shuffle(rng);
        }
        for idx in members {
            folds[dealt % n_splits].push(idx);
            dealt += 1;
        }
    }

    Ok(assemble_splits(folds))
}

/// Contiguous, unshuffled folds. The first `n_samples % n_splits` folds hold
/// one extra sample.
pub fn k_fold(n_samples: usize, n_splits: usize) -> Result<Vec<FoldSplit>, FoldError> {
    check_split_request(n_samples, n_splits)?;

    let base = n_samples / n_splits;
    let remainder = n_samples % n_splits;
    let mut folds = Vec::with_capacity(n_splits);
    let mut start = 0;
    for fold in 0..n_splits {
        let size = base + usize::from(fold < remainder);
        folds.push((start..start + size).collect());
        start += size;
    }

    Ok(assemble_splits(folds))
}

fn check_split_request(n_samples: usize, n_splits: usize) -> Result<(), FoldError> {
    if n_splits < 2 {
        return Err(FoldError::InvalidSplitCount(n_splits));
    }
    if n_samples < n_splits {
        return Err(FoldError::TooFewSamples {
            n_samples,
            n_splits,
        });
    }
    Ok(())
}

fn assemble_splits(mut folds: Vec<Vec<usize>>) -> Vec<FoldSplit> {
    for fold in folds.iter_mut() {
        fold.sort_unstable();
    }
    (0..folds.len())
        .map(|fold_index| {
            let mut train_indices: Vec<usize> = folds
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != fold_index)
                .flat_map(|(_, f)| f.iter().copied())
                .collect();
            train_indices.sort_unstable();
            FoldSplit {
                fold_index,
                train_indices,
                test_indices: folds[fold_index].clone(),
            }
        })
        .collect()
}
