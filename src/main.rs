//! emosteer-rs CLI: train control vectors, serve steered generation

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use emosteer_rs::{
    default_axes, load_or_train, ControlVectorBundle, EmoModel, GenerationSession,
    StatementCorpus, ASST_TAG, USER_TAG,
};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "emosteer-rs")]
#[command(about = "Emotionally steered text generation with control vectors")]
#[command(version)]
struct Cli {
    /// Model ID from `HuggingFace`
    #[arg(short, long, default_value = "mistralai/Mistral-7B-Instruct-v0.1")]
    model: String,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Force CPU mode (slower but avoids CUDA issues)
    #[arg(long)]
    cpu: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train control vectors from a statement corpus and save the bundle
    Train {
        /// Path to the statement corpus (JSON array of strings)
        #[arg(short, long, default_value = "data/true_facts.json")]
        corpus: PathBuf,

        /// Output path for the trained bundle
        #[arg(short, long, default_value = "data/control_vectors.json")]
        output: PathBuf,
    },

    /// Serve POST /generate, training vectors first if none are cached
    Serve {
        /// Path to the statement corpus (used only if training is needed)
        #[arg(short, long, default_value = "data/true_facts.json")]
        corpus: PathBuf,

        /// Path to the control-vector bundle
        #[arg(long, default_value = "data/control_vectors.json")]
        vectors: PathBuf,

        /// Address to listen on
        #[arg(short, long, default_value = "127.0.0.1:8000")]
        addr: SocketAddr,
    },

    /// Print sample replies at a few steering presets
    Reply {
        /// Path to the control-vector bundle
        #[arg(long, default_value = "data/control_vectors.json")]
        vectors: PathBuf,

        /// Message to reply to
        #[arg(
            short,
            long,
            default_value = "Your neighbor's dog has been barking loudly for hours. What do you do?"
        )]
        prompt: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    println!("=== emosteer-rs ===");
    println!("Model: {}", cli.model);
    if cli.cpu {
        println!("Mode:  CPU (forced)");
    }

    match cli.command {
        Command::Train { corpus, output } => train(&cli.model, cli.cpu, &corpus, &output),
        Command::Serve {
            corpus,
            vectors,
            addr,
        } => serve(&cli.model, cli.cpu, &corpus, &vectors, addr),
        Command::Reply { vectors, prompt } => reply(&cli.model, cli.cpu, &vectors, &prompt),
    }
}

fn load_model(model_id: &str, cpu: bool) -> Result<EmoModel> {
    info!("Loading model...");
    let model = EmoModel::from_pretrained_with_device(model_id, Some(cpu), None)?;
    info!(
        "Model: {} layers, {} hidden",
        model.n_layers(),
        model.d_model()
    );
    Ok(model)
}

fn train(model_id: &str, cpu: bool, corpus_path: &PathBuf, output: &PathBuf) -> Result<()> {
    let model = load_model(model_id, cpu)?;
    let corpus = StatementCorpus::load(corpus_path)?;
    info!("Corpus: {} statements", corpus.len());

    let bundle = emosteer_rs::train_bundle(&model, &corpus, &default_axes())?;
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }
    bundle.save(output)?;

    println!("\n=== Trained ===");
    for axis in bundle.axes() {
        println!("  {axis}");
    }
    println!("Saved to {}", output.display());
    Ok(())
}

fn serve(
    model_id: &str,
    cpu: bool,
    corpus_path: &PathBuf,
    vectors: &PathBuf,
    addr: SocketAddr,
) -> Result<()> {
    let model = load_model(model_id, cpu)?;
    let bundle = load_or_train(&model, corpus_path, vectors, &default_axes())?;
    let session = Arc::new(GenerationSession::new(model, bundle));

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(emosteer_rs::server::serve(session, addr))
}

fn reply(model_id: &str, cpu: bool, vectors: &PathBuf, prompt: &str) -> Result<()> {
    let model = load_model(model_id, cpu)?;
    let bundle = ControlVectorBundle::load(vectors)?;
    let session = GenerationSession::new(model, bundle);

    let persona = "You're modeling the mind of a Mary, a 40-year old woman. \
                   Reply as if you're Mary, in the first person:";
    let rules = "IMPORTANT: Maximum 40 words.";
    let full_prompt = format!("{USER_TAG} {persona} {prompt} {rules} {ASST_TAG}");

    let presets: [[f32; 3]; 3] = [
        [-1.2, -0.1, 0.1],
        [0.2, -0.2, -0.1],
        [-0.4, 0.71, 0.31],
    ];

    println!("\nPrompt: {prompt}");
    for weights in &presets {
        let text = session.generate(&full_prompt, weights)?;
        println!("\n--- weights {weights:?} ---");
        println!("{text}");
    }
    Ok(())
}
