// Copyright 2024 Entanglement Contributors
// SPDX-License-Identifier: Apache-2.0, MIT

/// This is the main entry point for the Entanglement CLI application.
///
/// The application stores documents as entangled blocks spread over the
/// providers named in a dispatcher configuration file, and reads them back.
/// It uses the `clap` crate for command-line argument parsing and `stderrlog` for logging.
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use clap::{Args, Parser, Subcommand};
use clap_stdin::FileOrStdin;
use stderrlog::Timestamp;

use dispatcher::{Dispatcher, DispatcherConfig};
use storage::{MemoryIndex, MetadataIndex};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Dispatcher configuration (JSON).
    #[arg(long, env = "STEP_CONFIG")]
    config: PathBuf,

    /// Snapshot of the metadata index, created on first use.
    #[arg(long, env = "STEP_INDEX")]
    index: PathBuf,

    /// Increase log verbosity (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[arg(short, long)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Encode a document and store its blocks.
    Put(PutArgs),
    /// Retrieve a document, repairing around missing blocks.
    Get(GetArgs),
    /// Retrieve a single block of a document.
    Block(BlockArgs),
    /// List stored documents.
    List,
    /// Print the entanglement graph.
    Graph,
}

#[derive(Args)]
struct PutArgs {
    #[arg(long)]
    path: String,
    /// File to store, `-` for stdin.
    #[arg(default_value = "-")]
    file: FileOrStdin,
}

#[derive(Args)]
struct GetArgs {
    #[arg(long)]
    path: String,
    /// Destination file, stdout if omitted.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Args)]
struct BlockArgs {
    #[arg(long)]
    path: String,
    #[arg(long)]
    index: usize,
    /// Fail instead of rebuilding the block when no replica is valid.
    #[arg(long)]
    no_reconstruct: bool,
    #[arg(short, long)]
    output: Option<PathBuf>,
}

async fn write_output(data: &Bytes, output: Option<&Path>) -> anyhow::Result<()> {
    match output {
        Some(path) => tokio::fs::write(path, data).await?,
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(data)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    stderrlog::new()
        .module(module_path!())
        .modules([
            "step_entangler",
            "step_entangler_storage",
            "step_entangler_dispatcher",
        ])
        .verbosity(1 + cli.verbose as usize)
        .quiet(cli.quiet)
        .timestamp(Timestamp::Millisecond)
        .init()?;

    let config = DispatcherConfig::load(&cli.config).await?;
    let index = Arc::new(MemoryIndex::load(&cli.index, config.selection).await?);
    let dispatcher = Dispatcher::from_config(&config, index.clone())?;

    match cli.command {
        Commands::Put(args) => {
            let mut data = Vec::new();
            args.file.into_reader()?.read_to_end(&mut data)?;
            let document = dispatcher.store(&args.path, &data).await?;
            index.save(&cli.index).await?;
            println!(
                "stored {} ({} bytes) as {} blocks entangled with {} blocks",
                document.path,
                document.original_size,
                document.blocks.len(),
                document.entangling_blocks.len()
            );
        }
        Commands::Get(args) => {
            let data = dispatcher.get(&args.path).await?;
            write_output(&data, args.output.as_deref()).await?;
        }
        Commands::Block(args) => {
            let data = dispatcher
                .get_block(&args.path, args.index, !args.no_reconstruct)
                .await?;
            write_output(&data, args.output.as_deref()).await?;
        }
        Commands::List => {
            for document in dispatcher.list().await? {
                println!(
                    "{}\t{}\t{} bytes\t{} blocks",
                    document.path,
                    document.creation_date.to_rfc3339(),
                    document.original_size,
                    document.blocks.len()
                );
            }
        }
        Commands::Graph => {
            let graph = index.entanglement_graph().await?;
            println!("{}", serde_json::to_string_pretty(&graph)?);
        }
    }

    Ok(())
}
