//! Superpack - DLC pack delivery
//!
//! Command line front end: inspect superpacks, probe servers and fetch
//! packs into a local store.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::time::Duration;

use superpack::archive::{open_archive, PackArchive, ResourceArchive};
use superpack::dlc::{DlcManager, Hints, RequestState};
use superpack::downloader::{DownloaderHints, RangeDownloader, TaskState};
use superpack::logging;
use superpack::meta::db::write_packs_db;

#[derive(Parser)]
#[command(name = "superpack")]
#[command(version)]
#[command(about = "Range-based DLC pack delivery for superpack archives")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging (use RUST_LOG=debug for more detail)
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List the files (and packs) of a superpack or zip archive
    Info {
        /// Path to the .dvpk or .zip file
        archive: PathBuf,
    },

    /// Extract a single file from an archive
    Extract {
        /// Path to the .dvpk or .zip file
        archive: PathBuf,
        /// Relative path of the file to extract
        file_path: String,
        /// Output file path
        output: PathBuf,
    },

    /// Print the size of a remote file
    Size {
        /// URL of the remote file
        url: String,
    },

    /// Download packs from a remote superpack into a local pack store
    Fetch {
        /// URL of the remote superpack
        url: String,

        /// Local pack store directory
        #[arg(short, long)]
        dir: PathBuf,

        /// Packs to download (with their dependencies)
        #[arg(required = true)]
        packs: Vec<String>,

        /// JSON file with manager hints
        #[arg(long, env = "SUPERPACK_HINTS")]
        hints: Option<PathBuf>,
    },

    /// Write the file-list database of a superpack
    ExportDb {
        /// Path to the .dvpk file
        superpack: PathBuf,
        /// Output database path
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose)?;

    match cli.command {
        Commands::Info { archive } => {
            let opened = open_archive(&archive)
                .with_context(|| format!("Failed to open {}", archive.display()))?;

            for f in opened.files() {
                println!(
                    "{:>10} {:>10} {:>8}  {}",
                    f.original_size,
                    f.compressed_size,
                    f.compression_type.as_str(),
                    f.relative_file_path
                );
            }
            eprintln!("\nTotal: {} files", opened.files().len());

            if let Ok(pack) = PackArchive::open(&archive) {
                if let Some(meta) = pack.meta()? {
                    println!("\n=== Packs ===");
                    for (index, desc) in meta.packs().iter().enumerate() {
                        let deps: Vec<&str> = desc
                            .dependencies
                            .iter()
                            .filter_map(|&d| meta.pack(d).map(|p| p.name.as_str()))
                            .collect();
                        println!(
                            "{:>8} files  {}{}",
                            meta.file_indexes(index as u32).len(),
                            desc.name,
                            if deps.is_empty() { String::new() } else { format!(" -> {}", deps.join(", ")) }
                        );
                    }
                }
            }
        }

        Commands::Extract {
            archive,
            file_path,
            output,
        } => {
            let opened = open_archive(&archive)
                .with_context(|| format!("Failed to open {}", archive.display()))?;
            let mut data = Vec::new();
            if !opened.load_file(&file_path, &mut data)? {
                bail!("{} not found in {}", file_path, archive.display());
            }
            std::fs::write(&output, &data)?;
            println!("Extracted {} bytes to {}", data.len(), output.display());
        }

        Commands::Size { url } => {
            let downloader = RangeDownloader::new(DownloaderHints::default())?;
            let task = downloader.start_get_content_size(&url);
            downloader.wait_task(task);
            let status = downloader
                .task_status(task)
                .context("Size request vanished")?;
            downloader.remove_task(task);

            if status.state != TaskState::Finished || status.error.error_happened {
                bail!("Failed to query {}: {}", url, status.error.err_str);
            }
            println!("{}", status.size_total);
        }

        Commands::Fetch { url, dir, packs, hints } => {
            let hints = match hints {
                Some(path) => Hints::from_json_file(&path)?,
                None => Hints::default(),
            };

            let manager = DlcManager::create();
            manager.initialize(&dir, Some(&url), hints)?;
            let requests: Vec<_> = packs.iter().map(|name| manager.request_pack(name)).collect();

            let pb = ProgressBar::new(0);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} | {msg}")?
                    .progress_chars("=>-"),
            );

            loop {
                let progress = manager.get_packs_progress(packs.as_slice());
                pb.set_length(progress.total);
                pb.set_position(progress.already_downloaded);
                pb.set_message(if manager.is_initialized() {
                    format!("{} packs", packs.len())
                } else {
                    format!("{:?}", manager.internal_init_state())
                });

                if let Some(failed) = requests.iter().find(|r| r.state() == RequestState::Failed) {
                    pb.abandon();
                    bail!(
                        "Pack '{}' failed: {}",
                        failed.requested_pack_name(),
                        failed.failure().unwrap_or_default()
                    );
                }
                if requests.iter().all(|r| r.is_downloaded()) {
                    break;
                }
                std::thread::sleep(Duration::from_millis(200));
            }

            pb.finish_with_message("done");
            println!("Downloaded {} into {}", packs.join(", "), dir.display());
        }

        Commands::ExportDb { superpack, output } => {
            let pack = PackArchive::open(&superpack)
                .with_context(|| format!("Failed to open {}", superpack.display()))?;
            let meta = pack
                .meta()?
                .with_context(|| format!("{} carries no pack metadata", superpack.display()))?;
            let names: Vec<String> = pack.files().iter().map(|f| f.relative_file_path.clone()).collect();
            write_packs_db(&output, &meta, &names)?;
            println!("Wrote {} files in {} packs to {}", names.len(), meta.pack_count(), output.display());
        }
    }

    Ok(())
}
