//! Decay-weighted migraine risk scoring with a two-stage calibration pipeline.

pub mod calibration;
pub mod config;
pub mod db;
pub mod error;
pub mod mapper;
pub mod models;
pub mod report;
pub mod review;
pub mod risk;

pub use error::RiskError;
