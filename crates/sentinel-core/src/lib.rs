pub mod baseline;
pub mod database;
pub mod exclusions;
pub mod fingerprint;
pub mod paths;
pub mod settings;
pub mod storage;
pub mod store;
pub mod version_store;
