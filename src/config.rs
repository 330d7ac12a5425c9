use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::neumf::{Flt, Learner};

/// Shape and regularization of a NeuMF network.
///
/// `layers[0]` is the width of the concatenated user/item MLP embeddings, so
/// each MLP embedding is `layers[0] / 2` wide. `reg_layers[0]` regularizes
/// those embeddings and `reg_layers[idx]` the kernel of dense layer `idx`.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub mf_dim: usize,
    pub layers: Vec<usize>,
    pub reg_layers: Vec<Flt>,
    pub reg_mf: Flt,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelConfig {
            mf_dim: 8,
            layers: vec![64, 32, 16, 8],
            reg_layers: vec![0.0; 4],
            reg_mf: 0.0,
        }
    }
}

impl ModelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.mf_dim == 0 {
            return Err(Error::Config("num_factors must be greater than 0".into()));
        }
        if self.layers.is_empty() {
            return Err(Error::Config("layers must not be empty".into()));
        }
        if self.layers.len() != self.reg_layers.len() {
            return Err(Error::Config(format!(
                "layers and reg_layers must have the same length ({} != {})",
                self.layers.len(),
                self.reg_layers.len()
            )));
        }
        if self.layers[0] == 0 || self.layers[0] % 2 != 0 {
            return Err(Error::Config(format!(
                "layers[0] must be a positive even number, got {}",
                self.layers[0]
            )));
        }
        if self.layers.iter().any(|&w| w == 0) {
            return Err(Error::Config("every MLP layer needs at least one unit".into()));
        }
        if self.reg_mf < 0.0 || self.reg_layers.iter().any(|&r| r < 0.0) {
            return Err(Error::Config("regularization must be non-negative".into()));
        }
        Ok(())
    }

    /// Width of one MLP embedding.
    pub fn mlp_embedding_dim(&self) -> usize {
        self.layers[0] / 2
    }

    /// Width of the vector fed to the prediction layer.
    pub fn predictive_factors(&self) -> usize {
        self.mf_dim + self.layers[self.layers.len() - 1]
    }

    /// The layer list in the bracketed form used on the command line.
    pub fn layers_label(&self) -> String {
        format_list(&self.layers)
    }
}

/// Everything the training loop needs besides the network shape.
#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub epochs: usize,
    pub batch_size: usize,
    pub num_negatives: usize,
    pub learning_rate: Flt,
    pub learner: Learner,
    /// Evaluate every `verbose` epochs.
    pub verbose: usize,
    pub top_k: usize,
    pub num_threads: usize,
    /// Extra embedding rows reserved beyond the known users and items.
    pub id_headroom: usize,
    pub seed: Option<u64>,
    /// Where the best weights are written; `None` disables saving.
    pub out: Option<PathBuf>,
    pub mf_pretrain: Option<PathBuf>,
    pub mlp_pretrain: Option<PathBuf>,
    pub progress: bool,
}

impl Default for TrainConfig {
    fn default() -> Self {
        TrainConfig {
            epochs: 100,
            batch_size: 256,
            num_negatives: 4,
            learning_rate: 0.001,
            learner: Learner::Adam,
            verbose: 1,
            top_k: 10,
            num_threads: 1,
            id_headroom: 10000,
            seed: None,
            out: None,
            mf_pretrain: None,
            mlp_pretrain: None,
            progress: false,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::Config("batch_size must be greater than 0".into()));
        }
        if self.verbose == 0 {
            return Err(Error::Config("verbose must be greater than 0".into()));
        }
        if self.top_k == 0 {
            return Err(Error::Config("top_k must be greater than 0".into()));
        }
        if self.num_threads == 0 {
            return Err(Error::Config("num_threads must be greater than 0".into()));
        }
        if !(self.learning_rate > 0.0) {
            return Err(Error::Config(format!(
                "learning rate must be positive, got {}",
                self.learning_rate
            )));
        }
        Ok(())
    }
}

/// Parses a list such as `[64,32,16,8]`. Brackets are optional and an empty
/// pair of brackets yields an empty list.
pub fn parse_list<T>(s: &str) -> Result<Vec<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let trimmed = s.trim();
    let inner = trimmed
        .strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(trimmed);
    if inner.trim().is_empty() {
        return Ok(Vec::new());
    }
    inner
        .split(',')
        .map(|part| {
            part.trim()
                .parse::<T>()
                .map_err(|err| Error::Config(format!("invalid list element {:?} in {}: {}", part.trim(), s, err)))
        })
        .collect()
}

pub fn format_list<T: Display>(values: &[T]) -> String {
    let parts = values.iter().map(|v| v.to_string()).collect::<Vec<_>>();
    format!("[{}]", parts.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        assert_eq!(parse_list::<usize>("[64,32,16,8]").unwrap(), vec![64, 32, 16, 8]);
        assert_eq!(parse_list::<usize>(" 64, 32 ").unwrap(), vec![64, 32]);
        assert_eq!(parse_list::<Flt>("[0,0.01]").unwrap(), vec![0.0, 0.01]);
        assert!(parse_list::<usize>("[]").unwrap().is_empty());
        assert!(parse_list::<usize>("[64,x]").is_err());
    }

    #[test]
    fn test_format_list() {
        assert_eq!(format_list(&[64usize, 32, 16, 8]), "[64,32,16,8]");
        assert_eq!(ModelConfig::default().layers_label(), "[64,32,16,8]");
    }

    #[test]
    fn test_validate_model_config() {
        assert!(ModelConfig::default().validate().is_ok());

        let mismatched = ModelConfig {
            reg_layers: vec![0.0; 3],
            ..ModelConfig::default()
        };
        assert!(matches!(mismatched.validate(), Err(Error::Config(_))));

        let odd = ModelConfig {
            layers: vec![7, 4],
            reg_layers: vec![0.0, 0.0],
            ..ModelConfig::default()
        };
        assert!(odd.validate().is_err());

        let negative = ModelConfig {
            reg_mf: -0.1,
            ..ModelConfig::default()
        };
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_dimensions() {
        let config = ModelConfig::default();
        assert_eq!(config.mlp_embedding_dim(), 32);
        assert_eq!(config.predictive_factors(), 16);
    }

    #[test]
    fn test_validate_train_config() {
        assert!(TrainConfig::default().validate().is_ok());
        let zero_batch = TrainConfig {
            batch_size: 0,
            ..TrainConfig::default()
        };
        assert!(zero_batch.validate().is_err());
    }
}
