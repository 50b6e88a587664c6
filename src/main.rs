//! # Librito CLI
//!
//! Command-line interface for building manual book PDFs.
//!
//! ## Usage
//!
//! ```bash
//! # Start the HTTP server
//! librito serve --listen 0.0.0.0:8080
//!
//! # Build one manual immediately
//! librito build --id 12 --customer "Jane Smith" --order-date 2024-03-01
//!
//! # Write the composed HTML to a file without rendering
//! librito preview --id 12 --out manual.html
//!
//! # Rebuild every manual created in March 2024
//! librito rebuild --from 2024-03-01 --to 2024-03-31
//!
//! # Queue a build and drain the queue by hand
//! librito queue --id 12 --force
//! librito drain
//!
//! # Remove stored PDFs no entity references
//! librito cleanup
//!
//! # Move templates between installations
//! librito templates export --out templates.json
//! librito templates import --file templates.json
//! ```

use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use librito::{
    App, LibritoError,
    entity::{EntityFilter, META_LOCK},
    pdf::BuildOutput,
    scheduler::SAVE_DELAY_SECS,
    server::{self, ServerConfig},
    tokens::{TOKEN_CUSTOMER_NAME, TOKEN_ORDER_DATE},
};

/// Librito - Manual book PDF generator
#[derive(Parser, Debug)]
#[command(name = "librito")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding settings, entities, templates and built PDFs
    #[arg(long, global = true, default_value = "data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the HTTP server
    Serve {
        /// Address to listen on
        #[arg(long, default_value = "0.0.0.0:8080")]
        listen: String,
    },

    /// Build one manual PDF immediately
    Build {
        /// Entity id of the serial-numbered product
        #[arg(long)]
        id: u64,

        /// Template id (configured default when omitted)
        #[arg(long)]
        template: Option<String>,

        /// Customer name printed on the manual
        #[arg(long)]
        customer: Option<String>,

        /// Order date printed on the manual (several formats accepted)
        #[arg(long)]
        order_date: Option<String>,
    },

    /// Compose the manual HTML and write it to a file without rendering
    Preview {
        /// Entity id of the serial-numbered product
        #[arg(long)]
        id: u64,

        /// Output path for the composed HTML
        #[arg(long)]
        out: PathBuf,
    },

    /// Rebuild manuals for every matching entity
    Rebuild {
        /// Inclusive creation-date lower bound (YYYY-MM-DD)
        #[arg(long)]
        from: Option<String>,

        /// Inclusive creation-date upper bound (YYYY-MM-DD)
        #[arg(long)]
        to: Option<String>,

        /// Progress report interval, in entities
        #[arg(long, default_value = "25")]
        batch: usize,
    },

    /// Queue a background build for an entity
    Queue {
        /// Entity id of the serial-numbered product
        #[arg(long)]
        id: u64,

        /// Seconds to wait before draining
        #[arg(long)]
        delay: Option<u64>,

        /// Build even when the entity is locked
        #[arg(long)]
        force: bool,
    },

    /// Drain pending queue entries now
    Drain,

    /// Remove stored PDFs no entity references
    Cleanup,

    /// Protect an entity from queued rebuilds
    Lock {
        /// Entity id to lock
        #[arg(long)]
        id: u64,
    },

    /// Lift an entity's rebuild protection
    Unlock {
        /// Entity id to unlock
        #[arg(long)]
        id: u64,
    },

    /// Template import/export tools
    Templates {
        #[command(subcommand)]
        command: TemplateCommands,
    },
}

#[derive(Subcommand, Debug)]
enum TemplateCommands {
    /// Write all stored templates to a JSON file
    Export {
        /// Output path
        #[arg(long)]
        out: PathBuf,
    },

    /// Replace stored templates from a JSON file
    Import {
        /// Input path
        #[arg(long)]
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), LibritoError> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "librito=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let app = Arc::new(App::open(&cli.data_dir)?);

    match cli.command {
        Commands::Serve { listen } => {
            server::serve(app, ServerConfig { listen_addr: listen }).await?;
        }

        Commands::Build {
            id,
            template,
            customer,
            order_date,
        } => {
            let mut overrides = BTreeMap::new();
            if let Some(customer) = customer {
                overrides.insert(TOKEN_CUSTOMER_NAME.to_string(), customer);
            }
            if let Some(order_date) = order_date {
                overrides.insert(TOKEN_ORDER_DATE.to_string(), order_date);
            }

            let output = app
                .builder
                .build(id, template.as_deref(), &overrides, true)
                .await?;
            if let BuildOutput::Stored(artifact) = output {
                println!("Built manual for entity {}", id);
                println!("  Path: {}", artifact.path.display());
                println!("  Hash: {}", artifact.hash);
            }
        }

        Commands::Preview { id, out } => {
            let html = app.builder.compose_html(id, None, &BTreeMap::new()).await?;
            tokio::fs::write(&out, html).await?;
            println!("Wrote preview to {}", out.display());
        }

        Commands::Rebuild { from, to, batch } => {
            let parse = |s: &Option<String>| {
                s.as_deref()
                    .and_then(|d| chrono::NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok())
            };
            let filter = EntityFilter {
                from: parse(&from),
                to: parse(&to),
                ..EntityFilter::default()
            };

            let ids = app.entities.list_ids(&filter)?;
            println!("Rebuilding {} manuals...", ids.len());

            let mut built = 0usize;
            let mut failed = 0usize;
            for (index, id) in ids.iter().enumerate() {
                match app.builder.build(*id, None, &BTreeMap::new(), true).await {
                    Ok(_) => built += 1,
                    Err(e) => {
                        failed += 1;
                        tracing::warn!(entity = *id, error = %e, "rebuild failed");
                    }
                }
                if batch > 0 && (index + 1) % batch == 0 {
                    println!("  {}/{} done", index + 1, ids.len());
                }
            }
            println!("Rebuilt {} manuals ({} failed)", built, failed);
        }

        Commands::Queue { id, delay, force } => {
            let delay = Duration::from_secs(delay.unwrap_or(SAVE_DELAY_SECS));
            app.scheduler.enqueue(id, delay, force)?;
            println!(
                "Queued entity {} ({} pending). Run `librito drain` or `librito serve` to process.",
                id,
                app.scheduler.len()
            );
        }

        Commands::Drain => {
            let processed = app.scheduler.drain().await?;
            println!(
                "Processed {} queue entries ({} still pending)",
                processed,
                app.scheduler.len()
            );
        }

        Commands::Cleanup => {
            let removed = app.cleanup()?;
            println!("Removed {} orphaned PDFs", removed);
        }

        Commands::Lock { id } => {
            app.entities.set_meta(id, META_LOCK, "1")?;
            println!("Locked entity {}", id);
        }

        Commands::Unlock { id } => {
            app.entities.remove_meta(id, META_LOCK)?;
            println!("Unlocked entity {}", id);
        }

        Commands::Templates { command } => match command {
            TemplateCommands::Export { out } => {
                let json = app.templates.export_json()?;
                tokio::fs::write(&out, json).await?;
                println!("Exported {} templates to {}", app.templates.list().len(), out.display());
            }
            TemplateCommands::Import { file } => {
                let json = tokio::fs::read_to_string(&file).await?;
                let imported = app.templates.import_json(&json)?;
                println!("Imported {} templates from {}", imported, file.display());
            }
        },
    }

    Ok(())
}
