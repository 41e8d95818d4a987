pub mod classifier;
pub mod history;
pub mod models;
pub mod settings;
