pub mod buttons;
pub mod fusion;
pub mod mapper;
pub mod models;
pub mod roles;
pub mod settings;
