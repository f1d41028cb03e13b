//! Domain models for the ingest & index service

mod face_cluster;

pub use face_cluster::{FaceCluster, FaceClusterRegistry};

// Shared item models live in pml-common so events can carry them
pub use pml_common::models::{Fingerprint, ItemAttrs, MediaItem, MediaKind, ProcessingState};
