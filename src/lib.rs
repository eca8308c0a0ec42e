pub mod bus;
pub mod models;
pub mod repositories;
pub mod services;
pub mod settings;
