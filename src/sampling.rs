use log::warn;
use nalgebra_sparse::CsrMatrix;
use rand::Rng;

use crate::datasets::Dataset;
use crate::error::{Error, Result};
use crate::neumf::{Flt, RandomState};

/// Parallel `(user, item, label)` columns fed to `NeuMF::fit_epoch`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrainingInstances {
    pub users: Vec<usize>,
    pub items: Vec<usize>,
    pub labels: Vec<Flt>,
}

impl TrainingInstances {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    fn push(&mut self, user: usize, item: usize, label: Flt) {
        self.users.push(user);
        self.items.push(item);
        self.labels.push(label);
    }

    pub(crate) fn validate(&self, user_rows: usize, item_rows: usize) -> Result<()> {
        if self.users.len() != self.labels.len() || self.items.len() != self.labels.len() {
            return Err(Error::Shape(format!(
                "instance columns differ in length: {} users, {} items, {} labels",
                self.users.len(),
                self.items.len(),
                self.labels.len()
            )));
        }
        if let Some(&u) = self.users.iter().find(|&&u| u >= user_rows) {
            return Err(Error::Shape(format!("user id {} out of range ({} rows)", u, user_rows)));
        }
        if let Some(&i) = self.items.iter().find(|&&i| i >= item_rows) {
            return Err(Error::Shape(format!("item id {} out of range ({} rows)", i, item_rows)));
        }
        Ok(())
    }
}

/// Maps a rating onto (0, 1): `2 / (1 + e^-r) - 1`. A rating of 0 maps to 0.
#[inline(always)]
pub fn soft_label(rating: Flt) -> Flt {
    2.0 / (1.0 + (-rating).exp()) - 1.0
}

/// Draws negatives for a user by rejection: an item is admissible when it is
/// neither a train positive nor one of the user's held-out test negatives.
pub struct NegativeSampler<'a> {
    train: &'a CsrMatrix<Flt>,
    excluded: Vec<Vec<usize>>,
    admissible: Vec<usize>,
}

impl<'a> NegativeSampler<'a> {
    pub fn new(dataset: &'a Dataset) -> NegativeSampler<'a> {
        let train = &dataset.train;
        let mut excluded = vec![Vec::new(); train.nrows()];
        for ((user, _), negatives) in dataset.test_ratings.iter().zip(dataset.test_negatives.iter()) {
            if *user < excluded.len() {
                excluded[*user].extend(negatives.iter().copied());
            }
        }
        let admissible = excluded
            .iter_mut()
            .enumerate()
            .map(|(user, items)| {
                items.sort_unstable();
                items.dedup();
                let row = train.row(user);
                let positives = row.col_indices();
                let extra = items.iter().filter(|i| positives.binary_search(i).is_err()).count();
                train.ncols().saturating_sub(positives.len() + extra)
            })
            .collect::<Vec<_>>();

        for (user, &count) in admissible.iter().enumerate() {
            if count == 0 && train.row(user).nnz() > 0 {
                warn!("user {} has no admissible negative items; its negatives are skipped", user);
            }
        }

        NegativeSampler {
            train,
            excluded,
            admissible,
        }
    }

    pub fn is_admissible(&self, user: usize, item: usize) -> bool {
        self.train.row(user).col_indices().binary_search(&item).is_err()
            && self.excluded[user].binary_search(&item).is_err()
    }

    /// `None` when the user has no admissible item at all.
    pub fn sample<R: Rng + ?Sized>(&self, user: usize, rng: &mut R) -> Option<usize> {
        if self.admissible[user] == 0 {
            return None;
        }
        loop {
            let item = rng.gen_range(0..self.train.ncols());
            if self.is_admissible(user, item) {
                return Some(item);
            }
        }
    }

    /// One positive instance per train entry, each followed by
    /// `num_negatives` sampled negatives with label 0.
    pub fn train_instances(&self, num_negatives: usize, random_state: &mut RandomState) -> TrainingInstances {
        let nnz = self.train.nnz();
        let mut instances = TrainingInstances {
            users: Vec::with_capacity(nnz * (num_negatives + 1)),
            items: Vec::with_capacity(nnz * (num_negatives + 1)),
            labels: Vec::with_capacity(nnz * (num_negatives + 1)),
        };
        for (user, row) in self.train.row_iter().enumerate() {
            for (&item, &rating) in row.col_indices().iter().zip(row.values().iter()) {
                instances.push(user, item, soft_label(rating.trunc()));
                for _ in 0..num_negatives {
                    match self.sample(user, &mut random_state.rng) {
                        Some(negative) => instances.push(user, negative, 0.0),
                        None => break,
                    }
                }
            }
        }
        instances
    }
}

/// Builds a fresh set of training instances for one epoch.
pub fn get_train_instances(dataset: &Dataset, num_negatives: usize, random_state: &mut RandomState) -> TrainingInstances {
    NegativeSampler::new(dataset).train_instances(num_negatives, random_state)
}
