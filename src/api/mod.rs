pub mod messaging;
pub mod models;
