pub mod enforcement;
pub mod engine;
pub mod integrity;
