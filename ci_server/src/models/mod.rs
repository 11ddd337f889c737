//! CI data models.

pub mod build;
pub mod hook;
pub mod repository;
