use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gpt_lite::{GgufFile, Hyperparameters, Runtime, RuntimeConfig};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(name = "gpt-lite")]
#[command(version = "0.1.0")]
#[command(about = "Run small GGUF models on constrained devices", long_about = None)]
struct Cli {
    /// JSON file with runtime limits and sampling settings
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Fixed sampling seed for reproducible output
    #[arg(long, global = true)]
    seed: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print header, hyperparameters and tensor directory
    Inspect { file: PathBuf },
    /// Generate a complete response
    Generate {
        file: PathBuf,
        prompt: String,
        #[arg(short, long)]
        max_tokens: Option<usize>,
    },
    /// Print tokens as they are produced
    Stream {
        file: PathBuf,
        prompt: String,
        #[arg(short, long)]
        max_tokens: Option<usize>,
        /// Cancel the stream after this many tokens
        #[arg(long)]
        stop_after: Option<usize>,
    },
}

fn main() {
    gpt_lite::init();
    let cli = Cli::parse();

    let result = load_config(cli.config.as_deref(), cli.seed).and_then(|config| match cli.command {
        Commands::Inspect { file } => inspect(&file),
        Commands::Generate {
            file,
            prompt,
            max_tokens,
        } => generate(config, &file, &prompt, max_tokens),
        Commands::Stream {
            file,
            prompt,
            max_tokens,
            stop_after,
        } => stream(config, &file, &prompt, max_tokens, stop_after),
    });

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn load_config(path: Option<&Path>, seed: Option<u64>) -> Result<RuntimeConfig> {
    let mut config = match path {
        Some(p) => RuntimeConfig::from_file(p)
            .with_context(|| format!("reading config {}", p.display()))?,
        None => RuntimeConfig::default(),
    };
    config.apply_env();
    if seed.is_some() {
        config.sampling.seed = seed;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn inspect(path: &Path) -> Result<()> {
    let file = GgufFile::open(path).with_context(|| format!("opening {}", path.display()))?;
    let header = file.header();
    let hp = Hyperparameters::from_gguf(&file)?;

    println!("File:          {}", path.display());
    println!("Size:          {} bytes", file.file_size());
    println!("GGUF version:  {}", header.version);
    println!("Architecture:  {}", file.architecture());
    if let Some(name) = file.get_str("general.name") {
        println!("Name:          {}", name);
    }
    println!("Metadata keys: {}", header.metadata_count);
    println!();
    println!("Vocabulary:    {}", hp.vocab_size);
    println!("Embedding:     {}", hp.embedding_length);
    println!("Heads:         {}", hp.head_count);
    println!("Layers:        {}", hp.block_count);
    println!("Context:       {}", hp.context_length);
    println!();
    println!("Tensors ({}):", header.tensor_count);
    for t in file.tensors() {
        println!(
            "  {:<40} {:<10} {:?} offset={} bytes={}",
            t.name,
            t.kind.to_string(),
            t.dims,
            t.offset,
            t.size
        );
    }
    Ok(())
}

fn generate(
    config: RuntimeConfig,
    path: &Path,
    prompt: &str,
    max_tokens: Option<usize>,
) -> Result<()> {
    let max_tokens = max_tokens.unwrap_or(config.batch_max_tokens);
    let runtime = Runtime::new(config)?;
    let model = runtime
        .load_model(path)
        .with_context(|| format!("loading {}", path.display()))?;
    let session = runtime.create_session(model)?;

    let text = runtime.generate(session, prompt, max_tokens)?;
    println!("{}", text);

    let stats = runtime.session_stats(session)?;
    tracing::info!(
        "{} prompt tokens, {} generated, finished {}",
        stats.prompt_tokens,
        stats.generated_tokens,
        stats.status
    );

    runtime.free_session(session)?;
    runtime.free_model(model)?;
    Ok(())
}

fn stream(
    config: RuntimeConfig,
    path: &Path,
    prompt: &str,
    max_tokens: Option<usize>,
    stop_after: Option<usize>,
) -> Result<()> {
    let max_tokens = max_tokens.unwrap_or(config.batch_max_tokens);
    let runtime = Runtime::new(config)?;
    let model = runtime
        .load_model(path)
        .with_context(|| format!("loading {}", path.display()))?;
    let session = runtime.create_session(model)?;

    runtime.start_streaming(session, prompt, max_tokens)?;
    let mut stdout = std::io::stdout();
    let mut count = 0;
    while !runtime.is_complete(session)? {
        if stop_after.is_some_and(|limit| count >= limit) {
            runtime.stop(session)?;
            break;
        }
        let token = runtime.next_token(session)?;
        if token.is_empty() {
            continue;
        }
        write!(stdout, "{} ", token)?;
        stdout.flush()?;
        count += 1;
    }
    writeln!(stdout)?;

    let status = runtime.session_status(session)?;
    tracing::info!("stream ended after {} tokens: {}", count, status);
    runtime.log_memory_stats();

    runtime.free_session(session)?;
    runtime.free_model(model)?;
    Ok(())
}
