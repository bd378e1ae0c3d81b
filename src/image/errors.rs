use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("failed to fetch base image from {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("failed to resize {}: {reason}", path.display())]
    Resize { path: PathBuf, reason: String },

    #[error("failed to generate cloud-init seed for VM '{name}': {reason}")]
    SeedGeneration { name: String, reason: String },

    #[error("removed {} but not {}: {source}", display_paths(removed), path.display())]
    PartialRemoval {
        removed: Vec<PathBuf>,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
