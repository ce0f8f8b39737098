pub mod clock;
pub mod config;
pub mod embedding;
pub mod error;
pub mod index;
pub mod lifecycle;
pub mod persistence;
pub mod retrieval;
pub mod service;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
