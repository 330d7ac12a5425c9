mod config;
mod cross_validation;
mod datasets;
mod error;
mod evaluation;
mod mapping;
mod neumf;
mod neumf_fast;
mod persistence;
mod sampling;
mod training;

pub use config::*;
pub use cross_validation::*;
pub use datasets::*;
pub use error::*;
pub use evaluation::*;
pub use mapping::*;
pub use neumf::*;
pub use sampling::*;
pub use training::*;
