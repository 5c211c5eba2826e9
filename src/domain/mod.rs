pub mod codec;
pub mod models;
pub mod resources;
pub mod settings;
