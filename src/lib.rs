// Public API - the runner plus the building blocks it is made of
pub mod runner;

pub mod config;
pub mod coordination;
pub mod db;
pub mod error;
pub mod formats;
pub mod io;
pub mod telemetry;

#[cfg(test)]
mod integ_tests;
