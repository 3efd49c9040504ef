use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use log::{error, info, warn};
use std::io::{self, Write};
use std::path::PathBuf;

use kb_search::cancel::CancelToken;
use kb_search::chunking::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use kb_search::document::RawDocument;
use kb_search::gemini::GeminiConfig;
use kb_search::index::IndexStore;
use kb_search::rag::{RagConfig, RagEngine};
use kb_search::retriever::IndexStats;
use kb_search::RagError;

/// Index documents and answer questions about them with Gemini
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of the persisted index
    #[arg(long, env = "RAG_INDEX_PATH", global = true)]
    index_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the index from text and PDF files, replacing any previous one
    Index {
        /// Documents to index
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Maximum passage length in characters
        #[arg(long, env = "RAG_CHUNK_SIZE", default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,

        /// Characters shared by neighboring passages
        #[arg(long, env = "RAG_CHUNK_OVERLAP", default_value_t = DEFAULT_CHUNK_OVERLAP)]
        overlap: usize,
    },
    /// Answer one question from the index
    Ask {
        question: String,

        /// Passages retrieved for the answer
        #[arg(short, long, env = "RAG_TOP_K")]
        k: Option<usize>,
    },
    /// Answer questions interactively until "exit"
    Chat {
        /// Passages retrieved per answer
        #[arg(short, long, env = "RAG_TOP_K")]
        k: Option<usize>,
    },
    /// Show the size of the current index
    Stats,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize environment
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();

    let gemini_config = GeminiConfig::from_env().context("Invalid Gemini configuration")?;
    let mut rag_config = RagConfig::from_env().context("Invalid RAG configuration")?;
    if let Some(path) = args.index_path {
        rag_config.index_path = path;
    }
    let top_k = rag_config.top_k;

    // Stats only read the local snapshot, so they work without an API key
    if let Command::Stats = args.command {
        let store = IndexStore::new(&rag_config.index_path);
        let stats = IndexStats::load(&store, &gemini_config.embedding_model())
            .await
            .context("Failed to read index")?;
        print_stats(&stats);
        return Ok(());
    }

    // The generation key is passed per question; the engine never stores it
    let credential = gemini_config.api_key.clone();
    let engine = RagEngine::gemini(gemini_config, rag_config)
        .context("Failed to initialize RAG engine (is GEMINI_API_KEY set?)")?;

    let cancel = CancelToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted; cancelling in-flight requests");
            ctrl_c.cancel();
        }
    });

    match args.command {
        Command::Index {
            files,
            chunk_size,
            overlap,
        } => {
            let documents: Vec<RawDocument> = files.iter().map(RawDocument::from_path).collect();
            let summary = engine
                .index_documents(&documents, chunk_size, overlap, &cancel)
                .await
                .context("Failed to index documents")?;
            println!(
                "Indexed {} chunks from {} documents",
                summary.chunk_count, summary.document_count
            );
        }
        Command::Ask { question, k } => {
            let answer = engine
                .retrieve_and_answer(&question, k.unwrap_or(top_k), credential.as_deref(), &cancel)
                .await
                .context("Failed to answer question")?;
            println!("{}", answer.text);
        }
        Command::Chat { k } => {
            run_query_loop(&engine, k.unwrap_or(top_k), credential.as_deref(), &cancel).await?;
        }
        Command::Stats => print_stats(&engine.get_index_stats().await?),
    }

    Ok(())
}

/// Read questions from stdin and print grounded answers
async fn run_query_loop(
    engine: &RagEngine,
    k: usize,
    credential: Option<&str>,
    cancel: &CancelToken,
) -> Result<()> {
    if !engine.retriever().has_index().await? {
        return Err(RagError::IndexNotFound).context("Run the index command first");
    }
    info!("Ready to answer questions. Type 'exit' to quit.");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut buffer = String::new();

    loop {
        print!("\nYour question: ");
        stdout.flush()?;

        buffer.clear();
        if stdin.read_line(&mut buffer)? == 0 {
            break;
        }

        let question = buffer.trim();
        if question.is_empty() {
            continue;
        }
        if question.eq_ignore_ascii_case("exit") {
            info!("Goodbye!");
            break;
        }

        match engine
            .retrieve_and_answer(question, k, credential, cancel)
            .await
        {
            Ok(answer) => println!("\n{}", answer.text),
            Err(RagError::Cancelled) => break,
            Err(e) => error!("{}", e),
        }
    }

    Ok(())
}

fn print_stats(stats: &IndexStats) {
    println!("Document vectors in index: {}", stats.document_vector_count);
    println!("Source documents: {}", stats.document_count);
    if let Some(model) = &stats.model {
        println!(
            "Embedding model: {} ({} dims, {:?})",
            model.name, model.dimension, model.metric
        );
    }
}
