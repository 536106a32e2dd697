pub mod budget;
pub mod config;
pub mod identity;
pub mod model;
pub mod tool;
