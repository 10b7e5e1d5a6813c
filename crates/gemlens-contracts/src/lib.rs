pub mod context;
pub mod detection;
pub mod models;
pub mod response;
