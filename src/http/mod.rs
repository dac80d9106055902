/// HTTP surface of the runner: JSON models, conversions to and from the
/// core types, and the axum router.
pub mod mappers;
pub mod models;
pub mod services;
