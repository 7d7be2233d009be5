use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::oci::{OciCompression, OpaqueWhiteoutPolicy};

#[derive(Parser)]
#[command(
    name = "layercache",
    version,
    about = "Repack container image layers and move them through the GitHub Actions cache",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CompressionArg {
    None,
    Gzip,
    Zstd,
}

impl CompressionArg {
    pub fn compression(self) -> Option<OciCompression> {
        match self {
            CompressionArg::None => None,
            CompressionArg::Gzip => Some(OciCompression::Gzip),
            CompressionArg::Zstd => Some(OciCompression::Zstd),
        }
    }
}

pub fn opaque_policy(apply_opaque: bool) -> OpaqueWhiteoutPolicy {
    if apply_opaque {
        OpaqueWhiteoutPolicy::Apply
    } else {
        OpaqueWhiteoutPolicy::Reject
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Merge layer tars into a single tar of the final filesystem
    Flatten {
        #[arg(help = "Output tar file")]
        output: PathBuf,

        #[arg(required = true, help = "Uncompressed layer tars, lowest layer first")]
        layers: Vec<PathBuf>,

        #[arg(long, value_enum, default_value = "none", help = "Output compression")]
        compression: CompressionArg,

        #[arg(long, help = "Apply opaque directory whiteouts instead of rejecting them")]
        apply_opaque: bool,
    },

    /// Split a flat tar into balanced output tars
    Pack {
        #[arg(help = "Flat input tar")]
        input: PathBuf,

        #[arg(required = true, help = "Output files, one per layer")]
        outputs: Vec<PathBuf>,

        #[arg(long, value_enum, default_value = "none", help = "Output compression")]
        compression: CompressionArg,
    },

    /// Rewrite an OCI image layout with flattened, rebalanced layers
    Repack {
        #[arg(help = "Source OCI layout directory")]
        source: PathBuf,

        #[arg(help = "Destination OCI layout directory")]
        destination: PathBuf,

        #[arg(long, default_value_t = 1, help = "Number of output layers")]
        layers: usize,

        #[arg(long, value_enum, default_value = "gzip", help = "Layer compression")]
        compression: CompressionArg,

        #[arg(long, help = "Apply opaque directory whiteouts instead of rejecting them")]
        apply_opaque: bool,

        #[arg(long, help = "Scratch directory for intermediate tars")]
        work_dir: Option<PathBuf>,
    },

    /// Talk to the GitHub Actions cache service
    Cache {
        #[command(subcommand)]
        action: CacheSubcommand,
    },

    /// Cache Docker images through the GitHub Actions cache
    Docker {
        #[command(subcommand)]
        action: DockerSubcommand,
    },
}

#[derive(Subcommand)]
pub enum CacheSubcommand {
    /// Look up a cache entry
    Get {
        key: String,
    },
    /// Upload a file under a key
    Upload {
        key: String,
        file: PathBuf,
    },
    /// Download the entry for a key into a new file
    Download {
        key: String,
        file: PathBuf,
    },
}

#[derive(Subcommand)]
pub enum DockerSubcommand {
    /// Load a cached image into Docker
    Load {
        #[arg(required = true, help = "Key parts, outermost namespace first")]
        key: Vec<String>,
    },
    /// Store a Docker image in the cache
    Save {
        #[arg(help = "Image reference or id")]
        image: String,

        #[arg(required = true, help = "Key parts, outermost namespace first")]
        key: Vec<String>,

        #[arg(long, default_value_t = 1, help = "Number of layers to repack into")]
        layers: usize,
    },
    /// Build an image unless it is present or cached
    Build {
        #[arg(long, short = 'f', default_value = "Dockerfile", help = "Dockerfile to build")]
        file: PathBuf,

        #[arg(long, default_value = ".", help = "Build context directory")]
        context: PathBuf,

        #[arg(long, help = "Repository name used to tag the image")]
        service: String,

        #[arg(long, help = "Build even when the image is already present")]
        always_build: bool,

        #[arg(required = true, help = "Key parts, outermost namespace first")]
        key: Vec<String>,
    },
    /// Pull an image unless it is present or cached
    Pull {
        image: String,

        #[arg(long, help = "Pull even when the image is already present")]
        always_pull: bool,
    },
}
