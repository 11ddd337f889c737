//! CI runner services — build orchestration and the pieces it drives.

pub mod build_service;
pub mod cancel;
pub mod checkout;
pub mod hook_service;
pub mod output_stream;
pub mod registry;
pub mod repository_service;
pub mod store;
pub mod supervisor;
