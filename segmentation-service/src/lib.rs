//! HTTP front end for the TotalSegmentator CLI.
pub mod config;
pub mod dtos;
pub mod handlers;
pub mod models;
pub mod nifti;
pub mod services;
pub mod startup;
pub mod workers;
