pub mod config;
pub mod params;
pub mod simulate;
