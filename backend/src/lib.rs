pub mod config;
pub mod error;
pub mod model;
pub mod preprocess;
pub mod routes;
pub mod upload;
