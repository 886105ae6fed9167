pub mod handlers;
pub mod mappers;
pub mod models;
