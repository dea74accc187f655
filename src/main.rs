use blobdex::cli::{Cli, Commands, ConfigAction};
use blobdex::config::Config;
use blobdex::engine::Engine;
use blobdex::error::{BlobdexError, Result};
use blobdex::search::{SearchBackend, SearchResult};
use std::path::{Path, PathBuf};

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    init_logging(cli.verbose);

    match cli.command {
        Commands::Ingest {
            container,
            path,
            name,
        } => {
            cmd_ingest(cli.config, &container, &path, name)?;
        }
        Commands::Delete { container, object } => {
            cmd_delete(cli.config, &container, &object)?;
        }
        Commands::Search {
            query,
            k,
            backend,
            json,
        } => {
            cmd_search(cli.config, &query, k, backend, json)?;
        }
        Commands::RemoveChunk { id } => {
            cmd_remove_chunk(cli.config, &id)?;
        }
        Commands::RestoreChunk { id } => {
            cmd_restore_chunk(cli.config, &id)?;
        }
        Commands::Stats { json } => {
            cmd_stats(cli.config, json)?;
        }
        Commands::Config { action } => {
            cmd_config(cli.config, action)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "blobdex=debug" } else { "blobdex=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    fmt().with_env_filter(filter).with_target(false).init();
}

fn config_path(config_path: Option<PathBuf>) -> Result<PathBuf> {
    match config_path {
        Some(path) => Ok(path),
        None => Config::default_path(),
    }
}

fn load_config(config_path_arg: Option<PathBuf>) -> Result<Config> {
    let path = config_path(config_path_arg)?;

    if !path.exists() {
        tracing::warn!(
            "Config file not found, using defaults. Run 'blobdex config init' to create one."
        );
    }
    Config::load_or_default(&path)
}

fn open_engine(config_path_arg: Option<PathBuf>) -> Result<Engine> {
    Engine::open(load_config(config_path_arg)?)
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string_pretty(value).map_err(|e| BlobdexError::Json {
        source: e,
        context: "Failed to serialize output".to_string(),
    })
}

fn cmd_ingest(
    config_path: Option<PathBuf>,
    container: &str,
    path: &Path,
    name: Option<String>,
) -> Result<()> {
    let object = match name {
        Some(name) => name,
        None => path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| BlobdexError::Validation(format!("{:?} has no file name", path)))?,
    };

    let engine = open_engine(config_path)?;
    let outcome = engine.ingest_file(container, &object, path)?;

    match outcome {
        blobdex::ingest::ProcessOutcome::Indexed { chunk_ids } => {
            println!("✓ Indexed {}/{} into {} chunks", container, object, chunk_ids.len());
        }
        blobdex::ingest::ProcessOutcome::Unchanged { chunk_ids } => {
            println!(
                "✓ {}/{} unchanged ({} chunks already indexed)",
                container,
                object,
                chunk_ids.len()
            );
        }
    }
    Ok(())
}

fn cmd_delete(config_path: Option<PathBuf>, container: &str, object: &str) -> Result<()> {
    let engine = open_engine(config_path)?;
    let removed = engine.processor().delete(container, object)?;
    println!("✓ Removed {} chunks of {}/{}", removed, container, object);
    Ok(())
}

fn cmd_search(
    config_path: Option<PathBuf>,
    query: &str,
    k: usize,
    backend: SearchBackend,
    json: bool,
) -> Result<()> {
    let engine = open_engine(config_path)?;
    let results = engine.search(query, k, backend)?;

    if json {
        println!("{}", to_json(&results)?);
        return Ok(());
    }

    if results.is_empty() {
        println!("No results for \"{}\" ({})", query, backend);
        return Ok(());
    }

    println!("Results for \"{}\" ({}):", query, backend);
    for (rank, result) in results.iter().enumerate() {
        print_result(rank + 1, result);
    }
    Ok(())
}

fn print_result(rank: usize, result: &SearchResult) {
    let preview: String = result.chunk_text.chars().take(160).collect();
    println!(
        "\n{}. [{:.4}] chunk {} - {} (page {})",
        rank, result.score, result.id, result.document_name, result.page_number
    );
    println!("   {}", preview.replace('\n', " "));
}

fn cmd_remove_chunk(config_path: Option<PathBuf>, id: &str) -> Result<()> {
    let engine = open_engine(config_path)?;
    if engine.remove_chunk(id)? {
        println!("✓ Removed chunk {}", id);
    } else {
        println!("Chunk {} is not registered", id);
    }
    Ok(())
}

fn cmd_restore_chunk(config_path: Option<PathBuf>, id: &str) -> Result<()> {
    let engine = open_engine(config_path)?;
    if engine.restore_chunk(id)? {
        println!("✓ Restored chunk {}", id);
    } else {
        println!("No removed chunk {} to restore", id);
    }
    Ok(())
}

fn cmd_stats(config_path: Option<PathBuf>, json: bool) -> Result<()> {
    let engine = open_engine(config_path)?;
    let stats = engine.stats()?;

    if json {
        println!("{}", to_json(&stats)?);
        return Ok(());
    }

    println!("Documents: {}", stats.documents);
    println!("Chunks:    {}", stats.chunks);
    println!(
        "Lexical:   {} documents ({} active), {} terms",
        stats.lexical.num_documents, stats.lexical.active_documents, stats.lexical.vocabulary_size
    );
    println!(
        "Vector:    {} vectors ({} active), {}D {}",
        stats.vector.num_vectors,
        stats.vector.active_vectors,
        stats.vector.num_dimensions,
        stats.vector.space
    );
    Ok(())
}

fn cmd_config(config_path_arg: Option<PathBuf>, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = load_config(config_path_arg)?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        ConfigAction::Validate { file } => {
            let path = match file {
                Some(file) => file,
                None => config_path(config_path_arg)?,
            };
            let config = Config::load(&path)?;
            println!("✓ Configuration is valid");
            println!("  Schema version: {}", config.meta.schema_version);
        }
        ConfigAction::Init { force } => {
            let path = config_path(config_path_arg)?;

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            let config = Config::default();
            config.save(&path)?;

            println!("✓ Configuration initialized at: {}", path.display());
            println!("  Object store root: {}", config.storage.root.display());
        }
    }

    Ok(())
}
