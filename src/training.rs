use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use log::info;

use crate::config::{ModelConfig, TrainConfig};
use crate::datasets::Dataset;
use crate::error::Result;
use crate::evaluation::evaluate_model;
use crate::neumf::{Flt, History, NeuMF, RandomState};
use crate::sampling::NegativeSampler;

/// Result of a training run. `best_iter` is `None` when no epoch beat the
/// untrained model.
pub struct TrainOutcome {
    pub model: NeuMF,
    pub best_iter: Option<usize>,
    pub best_hr: Flt,
    pub best_ndcg: Flt,
    pub histories: Vec<History>,
    pub out_file: Option<PathBuf>,
}

/// `<out_dir>/<dataset>_NeuMF_<mf_dim>_<layers>_<unix-time>.weights`
pub fn default_output_path<P: AsRef<Path>>(out_dir: P, dataset_name: &str, config: &ModelConfig) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    out_dir.as_ref().join(format!(
        "{}_NeuMF_{}_{}_{}.weights",
        dataset_name,
        config.mf_dim,
        config.layers_label(),
        now
    ))
}

pub fn train(dataset: &Dataset, model_config: &ModelConfig, config: &TrainConfig) -> Result<TrainOutcome> {
    model_config.validate()?;
    config.validate()?;
    let mut random_state = RandomState::new(config.seed);
    let mut model = NeuMF::new(
        dataset.num_users(),
        dataset.num_items(),
        config.id_headroom,
        model_config.clone(),
        &mut random_state,
    )?;
    model.compile(config.learner, config.learning_rate);
    if config.mf_pretrain.is_some() || config.mlp_pretrain.is_some() {
        model.load_pretrain(config.mf_pretrain.as_deref(), config.mlp_pretrain.as_deref())?;
        info!(
            "Load pretrained GMF ({:?}) and MLP ({:?}) models done.",
            config.mf_pretrain, config.mlp_pretrain
        );
    }

    let t1 = Instant::now();
    let init = evaluate_model(
        &model,
        &dataset.test_ratings,
        &dataset.test_negatives,
        config.top_k,
        config.num_threads,
    )?;
    let (mut best_hr, mut best_ndcg) = (init.hit_ratio(), init.ndcg());
    info!(
        "Init: HR = {:.4}, NDCG = {:.4} [{:.1} s]",
        best_hr,
        best_ndcg,
        t1.elapsed().as_secs_f32()
    );
    if let Some(out) = &config.out {
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        model.save(out)?;
    }

    let sampler = NegativeSampler::new(dataset);
    let mut best_iter = None;
    let mut histories = Vec::with_capacity(config.epochs);
    for epoch in 0..config.epochs {
        let t1 = Instant::now();
        let instances = sampler.train_instances(config.num_negatives, &mut random_state);
        let history = model.fit_epoch(
            &instances,
            config.batch_size,
            config.num_threads,
            config.progress,
            &mut random_state,
        )?;
        let t2 = Instant::now();

        if epoch % config.verbose == 0 {
            let evaluation = evaluate_model(
                &model,
                &dataset.test_ratings,
                &dataset.test_negatives,
                config.top_k,
                config.num_threads,
            )?;
            let (hr, ndcg) = (evaluation.hit_ratio(), evaluation.ndcg());
            info!(
                "Iteration {} [{:.1} s]: HR = {:.4}, NDCG = {:.4}, loss = {:.4} [{:.1} s], acc={:.4}",
                epoch,
                (t2 - t1).as_secs_f32(),
                hr,
                ndcg,
                history.loss,
                t2.elapsed().as_secs_f32(),
                history.accuracy
            );
            if hr > best_hr {
                best_hr = hr;
                best_ndcg = ndcg;
                best_iter = Some(epoch);
                if let Some(out) = &config.out {
                    model.save(out)?;
                }
            }
        }
        histories.push(history);
    }

    match best_iter {
        Some(epoch) => info!("End. Best Iteration {}:  HR = {:.4}, NDCG = {:.4}. ", epoch, best_hr, best_ndcg),
        None => info!("End. No iteration improved on HR = {:.4}, NDCG = {:.4}. ", best_hr, best_ndcg),
    }
    if let Some(out) = &config.out {
        info!("The best NeuMF model is saved to {}", out.display());
    }

    Ok(TrainOutcome {
        model,
        best_iter,
        best_hr,
        best_ndcg,
        histories,
        out_file: config.out.clone(),
    })
}
