pub mod client;
pub mod dto;

pub use client::{Classifier, HttpClassifier};
pub use dto::{Classification, Nutrition, ScanResult, ScoringMetadata, Signal, CONNECT_ERROR};
