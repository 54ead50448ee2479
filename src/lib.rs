pub mod corpus;
pub mod error;
pub mod handlers;
pub mod tables;
pub mod train;

pub use error::{AlignError, Result};
