//! Grouped k-fold partitioning.
//!
//! Distinct group values (subjects, sessions, series) are shuffled with a
//! seeded RNG and dealt round-robin into `k` buckets. Bucket `f` is the test
//! set of fold `f`; the remaining buckets are split into train and validation
//! groups. A group therefore never appears on both sides of a fold.

use std::collections::HashMap;

use emg_core::{Error, FoldIndex, Result};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::index::SampleIndex;

/// Partition of distinct groups into `k` disjoint buckets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldAssignment {
    buckets: Vec<Vec<String>>,
    bucket_of: HashMap<String, usize>,
    seed: u64,
}

/// Group split of one fold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoldGroups {
    pub train: Vec<String>,
    pub val: Vec<String>,
    pub test: Vec<String>,
}

impl FoldAssignment {
    /// Assigns every group of `index` to one of `k` buckets.
    ///
    /// Fails with [`Error::Configuration`] when `k < 2` or the index has
    /// fewer than `k` distinct groups.
    pub fn build(index: &SampleIndex, k: usize, seed: u64) -> Result<Self> {
        let groups: Vec<String> = index.groups().into_iter().map(str::to_owned).collect();
        Self::from_groups(groups, k, seed)
    }

    /// Same as [`FoldAssignment::build`] over an explicit group list
    pub fn from_groups(mut groups: Vec<String>, k: usize, seed: u64) -> Result<Self> {
        if k < 2 {
            return Err(Error::Configuration(format!(
                "k-fold cross-validation needs k >= 2, got {k}"
            )));
        }
        groups.sort();
        groups.dedup();
        if groups.len() < k {
            return Err(Error::Configuration(format!(
                "{} distinct groups cannot fill {k} folds",
                groups.len()
            )));
        }

        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        groups.shuffle(&mut rng);

        let mut buckets = vec![Vec::new(); k];
        let mut bucket_of = HashMap::with_capacity(groups.len());
        for (i, group) in groups.into_iter().enumerate() {
            bucket_of.insert(group.clone(), i % k);
            buckets[i % k].push(group);
        }
        for bucket in &mut buckets {
            bucket.sort();
        }

        Ok(Self {
            buckets,
            bucket_of,
            seed,
        })
    }

    pub fn k(&self) -> usize {
        self.buckets.len()
    }

    pub fn buckets(&self) -> &[Vec<String>] {
        &self.buckets
    }

    pub fn bucket_of(&self, group: &str) -> Option<usize> {
        self.bucket_of.get(group).copied()
    }

    fn check(&self, fold: FoldIndex) -> Result<()> {
        if fold.get() >= self.k() {
            return Err(Error::Configuration(format!(
                "fold {fold} out of range for {} folds",
                self.k()
            )));
        }
        Ok(())
    }

    /// Groups held out for testing in `fold`
    pub fn test_groups(&self, fold: FoldIndex) -> Result<&[String]> {
        self.check(fold)?;
        Ok(&self.buckets[fold.get()])
    }

    /// Splits the non-test groups of `fold` into train and validation groups.
    ///
    /// With at least two non-test groups both sides get one or more groups.
    /// A single remaining group goes to train and `val` stays empty; the data
    /// module then carves validation samples out of it.
    pub fn split(&self, fold: FoldIndex, train_ratio: f64) -> Result<FoldGroups> {
        self.check(fold)?;
        let test = self.buckets[fold.get()].clone();
        let mut rest: Vec<String> = self
            .buckets
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != fold.get())
            .flat_map(|(_, bucket)| bucket.iter().cloned())
            .collect();
        rest.sort();

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(fold.get() as u64 + 1));
        rest.shuffle(&mut rng);

        let n_val = if rest.len() < 2 {
            0
        } else {
            let wanted = (rest.len() as f64 * (1.0 - train_ratio)).round() as usize;
            wanted.clamp(1, rest.len() - 1)
        };
        let mut val = rest.split_off(rest.len() - n_val);
        let mut train = rest;
        train.sort();
        val.sort();

        Ok(FoldGroups { train, val, test })
    }
}
