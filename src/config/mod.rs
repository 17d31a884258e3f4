//! Application configuration: process env plus the hot-reloadable
//! per-component YAML repository.

mod env;
mod repo;

pub use env::EnvConfig;
pub use repo::{component, ConfigRepo, Reloadable};
