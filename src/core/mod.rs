pub mod domain;
pub mod errors;
pub mod registry;
pub mod store;
pub mod traits;
