use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use crate::error::{Error, Result};
use crate::neumf::{Flt, NeuMF};

/// Per-case hit (0/1) and NDCG values of a leave-one-out evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub hits: Vec<Flt>,
    pub ndcgs: Vec<Flt>,
}

impl Evaluation {
    /// Mean hit ratio; 0 for an empty test set.
    pub fn hit_ratio(&self) -> Flt {
        mean(&self.hits)
    }

    pub fn ndcg(&self) -> Flt {
        mean(&self.ndcgs)
    }
}

fn mean(values: &[Flt]) -> Flt {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<Flt>() / values.len() as Flt
    }
}

/// Ranks each held-out item against its negatives and scores the top-k list.
pub fn evaluate_model(
    model: &NeuMF,
    test_ratings: &[(usize, usize)],
    test_negatives: &[Vec<usize>],
    k: usize,
    num_threads: usize,
) -> Result<Evaluation> {
    if num_threads == 0 {
        return Err(Error::Config("num_threads must be greater than 0".into()));
    }
    if test_ratings.len() != test_negatives.len() {
        return Err(Error::Shape(format!(
            "{} test ratings but {} negative lists",
            test_ratings.len(),
            test_negatives.len()
        )));
    }
    let pool = ThreadPoolBuilder::new().num_threads(num_threads).build()?;
    let results = pool.install(|| {
        test_ratings
            .par_iter()
            .zip(test_negatives.par_iter())
            .map(|(&rating, negatives)| eval_one_rating(model, rating, negatives, k))
            .collect::<Result<Vec<_>>>()
    })?;
    let (hits, ndcgs) = results.into_iter().unzip();
    Ok(Evaluation { hits, ndcgs })
}

fn eval_one_rating(model: &NeuMF, (user, gt_item): (usize, usize), negatives: &[usize], k: usize) -> Result<(Flt, Flt)> {
    let mut items = negatives.to_vec();
    items.push(gt_item);
    let scores = model.predict_user(user, &items)?;
    let rank_list = top_k(&items, &scores, k);
    Ok((hit_ratio(&rank_list, gt_item), ndcg(&rank_list, gt_item)))
}

/// Items with the `k` highest scores, best first. Ties keep list order.
pub fn top_k(items: &[usize], scores: &[Flt], k: usize) -> Vec<usize> {
    let mut order = (0..items.len()).collect::<Vec<_>>();
    order.sort_by(|&a, &b| scores[b].total_cmp(&scores[a]));
    order.into_iter().take(k).map(|idx| items[idx]).collect()
}

pub fn hit_ratio(rank_list: &[usize], gt_item: usize) -> Flt {
    if rank_list.contains(&gt_item) {
        1.0
    } else {
        0.0
    }
}

pub fn ndcg(rank_list: &[usize], gt_item: usize) -> Flt {
    match rank_list.iter().position(|&item| item == gt_item) {
        Some(pos) => (2.0 as Flt).ln() / ((pos + 2) as Flt).ln(),
        None => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModelConfig;
    use crate::neumf::RandomState;

    #[test]
    fn test_top_k() {
        let items = [10, 11, 12, 13];
        let scores = [0.1, 0.9, 0.5, 0.9];
        assert_eq!(top_k(&items, &scores, 3), vec![11, 13, 12]);
        assert_eq!(top_k(&items, &scores, 10).len(), 4);
        assert!(top_k(&items, &scores, 0).is_empty());
    }

    #[test]
    fn test_hit_ratio_and_ndcg() {
        let list = [7, 3, 9];
        assert_eq!(hit_ratio(&list, 3), 1.0);
        assert_eq!(hit_ratio(&list, 4), 0.0);
        assert!((ndcg(&list, 7) - 1.0).abs() < 1e-6);
        assert!((ndcg(&list, 3) - 0.630_93).abs() < 1e-5);
        assert!((ndcg(&list, 9) - 0.5).abs() < 1e-6);
        assert_eq!(ndcg(&list, 4), 0.0);
    }

    #[test]
    fn test_empty_evaluation() {
        let evaluation = Evaluation::default();
        assert_eq!(evaluation.hit_ratio(), 0.0);
        assert_eq!(evaluation.ndcg(), 0.0);
    }

    #[test]
    fn test_evaluate_model() {
        let config = ModelConfig {
            mf_dim: 2,
            layers: vec![4, 2],
            reg_layers: vec![0.0, 0.0],
            reg_mf: 0.0,
        };
        let model = NeuMF::new(3, 20, 0, config, &mut RandomState::new(Some(3))).unwrap();
        let test_ratings = vec![(0, 1), (1, 2), (2, 3)];
        let test_negatives: Vec<Vec<usize>> = vec![(4..10).collect(), (4..14).collect(), vec![]];

        // k covers every candidate, so every case is a hit
        let all = evaluate_model(&model, &test_ratings, &test_negatives, 20, 2).unwrap();
        assert_eq!(all.hits, vec![1.0, 1.0, 1.0]);
        assert_eq!(all.hit_ratio(), 1.0);
        // a case with no negatives ranks its item first
        assert!((all.ndcgs[2] - 1.0).abs() < 1e-6);

        let top1 = evaluate_model(&model, &test_ratings, &test_negatives, 1, 1).unwrap();
        assert_eq!(top1.hits.len(), 3);
        for (hit, ndcg) in top1.hits.iter().zip(top1.ndcgs.iter()) {
            assert_eq!(hit, ndcg);
        }

        assert!(evaluate_model(&model, &test_ratings, &test_negatives[..2], 10, 1).is_err());
        assert!(evaluate_model(&model, &[(0, 25)], &[vec![]], 10, 1).is_err());
        assert!(matches!(
            evaluate_model(&model, &test_ratings, &test_negatives, 10, 0),
            Err(Error::Config(_))
        ));
    }
}
