pub mod executing;
pub mod grading;
pub mod validating;
