pub mod domain;
pub mod pipeline;
pub mod traits;
