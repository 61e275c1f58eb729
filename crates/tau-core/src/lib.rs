//! Foundational low-level utilities shared across Tau crates.
//!
//! Provides the cooperative cancellation token every subscriber and blocked
//! requester is scoped by, plus env-map parsing helpers used by runtime configs.

pub mod cancellation;
pub mod env_config;

pub use cancellation::{CancelRegistration, CooperativeCancellationToken};
pub use env_config::{
    bool_from_env, env_value, integer_from_env, list_from_env, parse_bool_env,
    positive_usize_from_env, EnvConfigError,
};
