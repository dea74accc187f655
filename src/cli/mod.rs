//! CLI command definitions and parsing
use crate::search::SearchBackend;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "blobdex",
    version,
    about = "Lease-guarded lexical and vector chunk index over an object store",
    long_about = "blobdex splits documents stored in an object store into chunks, indexes them with \
                  BM25 and an HNSW vector index, and keeps both indexes and their id mappings \
                  consistent across concurrent writers using object leases."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/blobdex/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Upload a local file into a container and index it
    Ingest {
        /// Container to upload into
        container: String,

        /// Local file to upload
        path: PathBuf,

        /// Object name (defaults to the file name)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Remove every chunk of a document from the indexes
    Delete {
        /// Container holding the document
        container: String,

        /// Object name of the document
        object: String,
    },

    /// Search indexed chunks
    Search {
        /// Search query text
        query: String,

        /// Maximum number of results to return
        #[arg(short, long, default_value = "5")]
        k: usize,

        /// Index to search
        #[arg(short, long, value_enum, default_value_t = SearchBackend::Lexical)]
        backend: SearchBackend,

        /// Show results in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Remove a single chunk from every index
    RemoveChunk {
        /// Chunk id
        id: String,
    },

    /// Restore a chunk removed with remove-chunk
    RestoreChunk {
        /// Chunk id
        id: String,
    },

    /// Show index statistics
    Stats {
        /// Show statistics in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Initialize default configuration
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn test_search_defaults() {
        let cli = Cli::try_parse_from(["blobdex", "search", "cat"]).unwrap();
        match cli.command {
            Commands::Search {
                query,
                k,
                backend,
                json,
            } => {
                assert_eq!(query, "cat");
                assert_eq!(k, 5);
                assert_eq!(backend, SearchBackend::Lexical);
                assert!(!json);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_kebab_case_subcommands() {
        let cli = Cli::try_parse_from(["blobdex", "-v", "remove-chunk", "3"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::RemoveChunk { id } if id == "3"));

        let cli =
            Cli::try_parse_from(["blobdex", "search", "q", "--backend", "vector", "-k", "2"])
                .unwrap();
        assert!(matches!(
            cli.command,
            Commands::Search { backend: SearchBackend::Vector, k: 2, .. }
        ));
    }
}
