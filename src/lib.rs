pub mod mqtt;
pub mod persistence;
