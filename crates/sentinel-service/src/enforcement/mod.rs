pub mod accept;
pub mod restore;
