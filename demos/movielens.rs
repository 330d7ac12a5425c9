extern crate neumf;

use neumf::{Learner, ModelConfig, TrainConfig};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let data = neumf::fetch_dataset(None, "ml-1m", true)?;
    let model_config = ModelConfig::default();
    let config = TrainConfig {
        epochs: 5,
        learner: Learner::Adam,
        num_threads: 4,
        seed: Some(42),
        progress: true,
        ..TrainConfig::default()
    };
    let outcome = neumf::train(&data, &model_config, &config)?;
    println!("HR@{}:{:.4},NDCG@{}:{:.4}", config.top_k, outcome.best_hr, config.top_k, outcome.best_ndcg);

    let top = outcome.model.recommend(0, 10, Some(&data.train))?;
    println!("user 0: {:?}", top.iter().map(|(item, _)| item).collect::<Vec<_>>());
    Ok(())
}
