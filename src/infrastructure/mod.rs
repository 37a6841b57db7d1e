pub mod backends;
pub mod remote;
pub mod stores;
