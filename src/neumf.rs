use std::fmt;
use std::str::FromStr;

use log::debug;
use nalgebra_sparse::CsrMatrix;
use rand::SeedableRng;
use rand_isaac::Isaac64Rng;
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use shuffle::fy::FisherYates;
use shuffle::shuffler::Shuffler;
use tqdm::Iter;

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::neumf_fast::{FastNeuMF, Gradients, Optimizer};
use crate::sampling::TrainingInstances;

pub type Flt = f32;

/// Optimizer used to fit the network.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Learner {
    Adagrad,
    Adam,
    RmsProp,
    Sgd,
}

impl FromStr for Learner {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "adagrad" => Ok(Learner::Adagrad),
            "adam" => Ok(Learner::Adam),
            "rmsprop" => Ok(Learner::RmsProp),
            "sgd" => Ok(Learner::Sgd),
            _ => Err(Error::Config(format!("invalid learner: {}", s))),
        }
    }
}

impl fmt::Display for Learner {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Learner::Adagrad => "adagrad",
            Learner::Adam => "adam",
            Learner::RmsProp => "rmsprop",
            Learner::Sgd => "sgd",
        };
        f.write_str(name)
    }
}

pub struct RandomState {
    pub(crate) fy: FisherYates,
    pub(crate) rng: Isaac64Rng,
}

impl RandomState {
    pub fn new(seed: Option<u64>) -> RandomState {
        RandomState {
            fy: FisherYates::default(),
            rng: match seed {
                Some(seed) => Isaac64Rng::seed_from_u64(seed),
                None => Isaac64Rng::from_entropy(),
            },
        }
    }

    pub(crate) fn shuffle(&mut self, indices: &mut Vec<usize>) -> Result<()> {
        self.fy
            .shuffle(indices, &mut self.rng)
            .map_err(|err| Error::Sampling(err.to_string()))
    }
}

impl Default for RandomState {
    fn default() -> RandomState {
        RandomState::new(None)
    }
}

/// Loss and accuracy of one pass over the training instances.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct History {
    pub loss: Flt,
    pub accuracy: Flt,
    pub batches: usize,
}

/// Neural matrix factorization: a GMF branch and an MLP branch over separate
/// user/item embeddings, joined by a sigmoid prediction layer.
pub struct NeuMF {
    num_users: usize,
    num_items: usize,
    id_headroom: usize,
    config: ModelConfig,
    pub(crate) data: FastNeuMF,
    optimizer: Option<Optimizer>,
}

/// Builds a freshly initialised model for `num_users` by `num_items`.
pub fn get_model(num_users: usize, num_items: usize, config: ModelConfig) -> Result<NeuMF> {
    NeuMF::new(num_users, num_items, 0, config, &mut RandomState::default())
}

impl NeuMF {
    /// Embedding tables get `num + id_headroom` rows so ids issued after the
    /// dataset snapshot still have a slot.
    pub fn new(
        num_users: usize,
        num_items: usize,
        id_headroom: usize,
        config: ModelConfig,
        random_state: &mut RandomState,
    ) -> Result<NeuMF> {
        config.validate()?;
        if num_users == 0 || num_items == 0 {
            return Err(Error::Config(format!(
                "model needs at least one user and one item, got {} x {}",
                num_users, num_items
            )));
        }
        let data = FastNeuMF::new(
            num_users + id_headroom,
            num_items + id_headroom,
            &config,
            &mut random_state.rng,
        )?;
        Ok(NeuMF {
            num_users,
            num_items,
            id_headroom,
            config,
            data,
            optimizer: None,
        })
    }

    pub(crate) fn from_parts(
        num_users: usize,
        num_items: usize,
        id_headroom: usize,
        config: ModelConfig,
        data: FastNeuMF,
    ) -> NeuMF {
        NeuMF {
            num_users,
            num_items,
            id_headroom,
            config,
            data,
            optimizer: None,
        }
    }

    /// Selects the optimizer. Any accumulated optimizer state is discarded.
    pub fn compile(&mut self, learner: Learner, learning_rate: Flt) {
        self.optimizer = Some(Optimizer::new(&self.data, learner, learning_rate));
    }

    pub fn learner(&self) -> Option<Learner> {
        self.optimizer.as_ref().map(|o| o.learner())
    }

    pub fn num_users(&self) -> usize {
        self.num_users
    }

    pub fn num_items(&self) -> usize {
        self.num_items
    }

    pub fn id_headroom(&self) -> usize {
        self.id_headroom
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    /// One shuffled pass of mini-batch training over `instances`.
    pub fn fit_epoch(
        &mut self,
        instances: &TrainingInstances,
        batch_size: usize,
        num_threads: usize,
        progress: bool,
        random_state: &mut RandomState,
    ) -> Result<History> {
        if batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than 0".into()));
        }
        instances.validate(self.data.user_rows(), self.data.item_rows())?;
        let NeuMF {
            data,
            optimizer,
            config,
            ..
        } = self;
        let optimizer = optimizer
            .as_mut()
            .ok_or_else(|| Error::Config("model must be compiled before fitting".into()))?;
        if instances.is_empty() {
            return Ok(History::default());
        }

        let mut shuffled = (0..instances.len()).collect::<Vec<_>>();
        random_state.shuffle(&mut shuffled)?;
        let batches = shuffled.chunks(batch_size).collect::<Vec<_>>();
        let pool = ThreadPoolBuilder::new().num_threads(num_threads).build()?;

        let mut loss_sum = 0.0;
        let mut correct = 0;
        for b in Self::process(batches.len(), progress) {
            let batch = batches[b];
            let scale = 1.0 / batch.len() as Flt;
            let model: &FastNeuMF = data;
            let grads = pool.install(|| {
                batch
                    .par_iter()
                    .fold(
                        || Gradients::zeros(model),
                        |mut g, &row| {
                            g.accumulate(model, instances.users[row], instances.items[row], instances.labels[row], scale);
                            g
                        },
                    )
                    .reduce(|| Gradients::zeros(model), Gradients::merge)
            });
            let penalty = optimizer.step(data, &grads, config);
            loss_sum += grads.loss / grads.count as f64 + penalty as f64;
            correct += grads.correct;
        }

        let history = History {
            loss: (loss_sum / batches.len() as f64) as Flt,
            accuracy: correct as Flt / instances.len() as Flt,
            batches: batches.len(),
        };
        debug!(
            "fitted {} instances in {} batches: loss = {:.4}, acc = {:.4}",
            instances.len(),
            history.batches,
            history.loss,
            history.accuracy
        );
        Ok(history)
    }

    fn process(n: usize, progress: bool) -> Box<dyn Iterator<Item = usize>> {
        if progress {
            Box::new((0..n).tqdm())
        } else {
            Box::new(0..n)
        }
    }

    /// Scores aligned `(user, item)` pairs.
    pub fn predict(&self, user_ids: &[usize], item_ids: &[usize]) -> Result<Vec<Flt>> {
        if user_ids.len() != item_ids.len() {
            return Err(Error::Shape(format!(
                "user_ids and item_ids must be the same length ({} != {})",
                user_ids.len(),
                item_ids.len()
            )));
        }
        self.check_ids(user_ids, item_ids)?;
        Ok(user_ids
            .iter()
            .zip(item_ids.iter())
            .map(|(&u, &i)| self.data.score(u, i))
            .collect())
    }

    /// Scores `items` for one user.
    pub fn predict_user(&self, user: usize, items: &[usize]) -> Result<Vec<Flt>> {
        self.check_ids(&[user], items)?;
        Ok(items.iter().map(|&i| self.data.score(user, i)).collect())
    }

    /// Top `k` known items for `user` by score, skipping the items the user
    /// already has in `exclude`.
    pub fn recommend(&self, user: usize, k: usize, exclude: Option<&CsrMatrix<Flt>>) -> Result<Vec<(usize, Flt)>> {
        self.check_ids(&[user], &[])?;
        let seen = exclude
            .filter(|m| user < m.nrows())
            .and_then(|m| m.get_row(user))
            .map(|row| row.col_indices().to_vec())
            .unwrap_or_default();
        let mut scored = (0..self.num_items)
            .filter(|item| seen.binary_search(item).is_err())
            .map(|item| (item, self.data.score(user, item)))
            .collect::<Vec<_>>();
        scored.sort_unstable_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);
        Ok(scored)
    }

    fn check_ids(&self, user_ids: &[usize], item_ids: &[usize]) -> Result<()> {
        if let Some(&u) = user_ids.iter().find(|&&u| u >= self.data.user_rows()) {
            return Err(Error::Shape(format!(
                "user id {} out of range (embedding rows: {})",
                u,
                self.data.user_rows()
            )));
        }
        if let Some(&i) = item_ids.iter().find(|&&i| i >= self.data.item_rows()) {
            return Err(Error::Shape(format!(
                "item id {} out of range (embedding rows: {})",
                i,
                self.data.item_rows()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_ok::assert_ok;
    use nalgebra_sparse::CooMatrix;

    fn config() -> ModelConfig {
        ModelConfig {
            mf_dim: 4,
            layers: vec![8, 4],
            reg_layers: vec![0.0, 0.0],
            reg_mf: 0.0,
        }
    }

    fn model(seed: u64) -> NeuMF {
        NeuMF::new(4, 6, 0, config(), &mut RandomState::new(Some(seed))).unwrap()
    }

    #[test]
    fn test_learner_from_str() {
        assert_eq!("Adam".parse::<Learner>().unwrap(), Learner::Adam);
        assert_eq!("rmsprop".parse::<Learner>().unwrap(), Learner::RmsProp);
        assert_eq!("SGD".parse::<Learner>().unwrap(), Learner::Sgd);
        assert_eq!("adagrad".parse::<Learner>().unwrap(), Learner::Adagrad);
        assert!("adadelta".parse::<Learner>().is_err());
        assert_eq!(Learner::RmsProp.to_string(), "rmsprop");
    }

    #[test]
    fn test_new_rejects_bad_config() {
        let bad = ModelConfig {
            reg_layers: vec![0.0],
            ..config()
        };
        assert!(NeuMF::new(4, 6, 0, bad, &mut RandomState::new(Some(1))).is_err());
        assert!(NeuMF::new(0, 6, 0, config(), &mut RandomState::new(Some(1))).is_err());
    }

    #[test]
    fn test_same_seed_same_weights() {
        let a = model(11);
        let b = model(11);
        assert_eq!(a.data.mf_user, b.data.mf_user);
        assert_eq!(a.data.prediction.kernel, b.data.prediction.kernel);
        let c = model(12);
        assert_ne!(a.data.mf_user, c.data.mf_user);
    }

    #[test]
    fn test_headroom_rows() {
        let m = NeuMF::new(4, 6, 3, config(), &mut RandomState::new(Some(1))).unwrap();
        assert_eq!(m.data.user_rows(), 7);
        assert_eq!(m.data.item_rows(), 9);
        assert_ok!(m.predict(&[6], &[8]));
        assert!(m.predict(&[7], &[0]).is_err());
    }

    #[test]
    fn test_predict() {
        let m = model(3);
        let scores = m.predict(&[0, 1, 3], &[5, 2, 0]).unwrap();
        assert_eq!(scores.len(), 3);
        assert!(scores.iter().all(|&s| s > 0.0 && s < 1.0));
        assert!(m.predict(&[0, 1], &[0]).is_err());
        assert!(m.predict(&[0], &[6]).is_err());
    }

    #[test]
    fn test_fit_requires_compile() {
        let mut m = model(3);
        let instances = TrainingInstances {
            users: vec![0],
            items: vec![1],
            labels: vec![1.0],
        };
        let result = m.fit_epoch(&instances, 4, 1, false, &mut RandomState::new(Some(1)));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_fit_epoch_learns_pattern() {
        let mut m = model(5);
        m.compile(Learner::Adam, 0.05);
        assert_eq!(m.learner(), Some(Learner::Adam));
        // users 0,1 like items 0..3; users 2,3 like items 3..6
        let mut instances = TrainingInstances::default();
        for u in 0..4 {
            for i in 0..6 {
                let liked = (u < 2) == (i < 3);
                instances.users.push(u);
                instances.items.push(i);
                instances.labels.push(if liked { 1.0 } else { 0.0 });
            }
        }
        let mut random_state = RandomState::new(Some(9));
        let first = m.fit_epoch(&instances, 4, 2, false, &mut random_state).unwrap();
        assert_eq!(first.batches, 6);
        let mut last = first;
        for _ in 0..100 {
            last = m.fit_epoch(&instances, 4, 2, false, &mut random_state).unwrap();
        }
        assert!(last.loss < first.loss);
        assert!(last.accuracy > 0.9);
        let scores = m.predict(&[0, 0, 3, 3], &[1, 4, 1, 4]).unwrap();
        assert!(scores[0] > scores[1]);
        assert!(scores[3] > scores[2]);
    }

    #[test]
    fn test_recommend_excludes_seen_items() {
        let m = model(8);
        let mut coo = CooMatrix::new(4, 6);
        coo.push(1, 0, 1.0);
        coo.push(1, 3, 1.0);
        let seen = CsrMatrix::from(&coo);
        let recs = m.recommend(1, 3, Some(&seen)).unwrap();
        assert_eq!(recs.len(), 3);
        assert!(recs.iter().all(|(item, _)| *item != 0 && *item != 3));
        assert!(recs.windows(2).all(|w| w[0].1 >= w[1].1));
        assert_eq!(m.recommend(1, 10, None).unwrap().len(), 6);
        assert!(m.recommend(4, 3, None).is_err());
    }
}
