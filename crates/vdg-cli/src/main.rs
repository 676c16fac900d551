use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use vdg_core::{
    average_efficiency, DiagnosisBlockState, DiagnosisNote, QuestionnaireData, Session, Venue,
};
use vdg_store::{KvStore, MigrationRunner, SqliteKvStore, UserDataStore, VenueSelector};
use vdg_sync::{run_startup_tasks, SyncClient, SyncConfig};

#[derive(Parser)]
#[command(name = "vdg")]
#[command(about = "Venue diagnostics local state store", long_about = None)]
struct Cli {
    /// SQLite database file backing the local store
    #[arg(long, env = "VDG_DB", default_value = "vdg.db")]
    db: String,

    /// Base URL of the sync service
    #[arg(long, env = "VDG_SYNC_URL", default_value = "http://localhost:3000")]
    sync_url: String,

    /// Override the registered user id for this invocation
    #[arg(long)]
    user: Option<String>,

    /// Override the selected venue for this invocation
    #[arg(long)]
    venue: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a user id and adopt any pre-account local data
    Register { user_id: String },
    /// Manage venues
    Venue {
        #[command(subcommand)]
        action: VenueCommands,
    },
    /// Mark the registration questionnaire as completed
    CompleteQuestionnaire,
    /// Record a completed diagnosis block
    CompleteBlock {
        block_id: String,
        #[arg(long)]
        efficiency: u32,
        /// Raw answers as key=value pairs
        #[arg(long = "answer")]
        answers: Vec<String>,
    },
    /// Show the dashboard rollup
    Dashboard,
    /// Set the free-text note for the selected venue
    Note { text: String },
    /// Run the one-time startup work (migrations + sync) explicitly
    Start,
    /// Run the migration procedures only
    Migrate,
    /// Push the local snapshot to the sync service
    Push,
    /// Pull the server snapshot into the local store
    Pull {
        /// Pull even when local data exists (overwrites server-known keys)
        #[arg(long)]
        force: bool,
    },
    /// List every stored key and value
    Dump,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let kv: Arc<dyn KvStore> =
        Arc::new(SqliteKvStore::open(&cli.db).with_context(|| format!("open {}", cli.db))?);
    let store = UserDataStore::new(Arc::clone(&kv));
    let selector = VenueSelector::new(Arc::clone(&kv));

    let user_id = match &cli.user {
        Some(user_id) => Some(user_id.clone()),
        None => store.user_id().await,
    };
    let mut session = Session {
        user_id,
        venue_id: cli.venue.clone(),
    };
    if session.venue_id.is_none() {
        session.venue_id = selector.selected_venue_id(&session).await?;
    }

    match cli.command {
        Commands::Register { user_id } => {
            if let Some(existing) = store.user_id().await {
                bail!("already registered as {existing}");
            }
            store.set_user_id(&user_id).await?;
            let session = Session::for_user(&user_id);
            // First registration is the single gated call site for the
            // legacy copy; re-running it later would clobber newer data.
            store.migrate_user_data(&session).await?;
            println!("registered {user_id}");
        }
        Commands::Venue { action } => {
            run_venue_command(&store, &selector, &session, action).await?;
        }
        Commands::CompleteQuestionnaire => {
            store.set_questionnaire_completed(&session).await?;
            println!("questionnaire completed");
        }
        Commands::CompleteBlock {
            block_id,
            efficiency,
            answers,
        } => {
            let answers = parse_answers(&answers)?;
            store.save_answers(&session, &block_id, &answers).await?;

            let block = DiagnosisBlockState::completed_with(&block_id, efficiency, answers)
                .context("invalid efficiency")?;
            let mut blocks = store.load_blocks(&session).await.unwrap_or_default();
            blocks.retain(|existing| existing.id != block.id);
            blocks.push(block);
            store.save_blocks(&session, &blocks).await?;
            println!("completed block {block_id}");

            if !blocks.is_empty() && blocks.iter().all(|block| block.completed) {
                if let Some(average) = average_efficiency(&blocks) {
                    let rollup = store.load_dashboard(&session).await;
                    store
                        .save_dashboard(&session, &rollup.advance(average.to_string()))
                        .await?;
                    println!("all blocks completed, overall result {average}");
                }
            }
        }
        Commands::Dashboard => {
            let rollup = store.load_dashboard(&session).await;
            println!("all blocks completed: {}", rollup.all_blocks_completed);
            println!(
                "current result:  {}",
                rollup.current_result.as_deref().unwrap_or("-")
            );
            println!(
                "previous result: {}",
                rollup.previous_result.as_deref().unwrap_or("-")
            );
        }
        Commands::Note { text } => {
            if session.venue_id().is_none() {
                bail!("no venue selected");
            }
            store.save_note(&session, &DiagnosisNote::new(text)).await?;
            println!("note saved");
        }
        Commands::Start => {
            let sync = Arc::new(SyncClient::new(
                Arc::clone(&kv),
                SyncConfig {
                    base_url: cli.sync_url.clone(),
                    ..Default::default()
                },
            )?);
            run_startup_tasks(Arc::clone(&kv), sync, session).await;
            println!("startup tasks finished");
        }
        Commands::Migrate => {
            MigrationRunner::new(Arc::clone(&kv)).run_all(&session).await;
            println!("migrations finished");
        }
        Commands::Push => {
            let sync = sync_client(&kv, &cli.sync_url)?;
            let ok = sync.push(&session).await;
            println!("push: {}", if ok { "ok" } else { "failed" });
        }
        Commands::Pull { force } => {
            let sync = sync_client(&kv, &cli.sync_url)?;
            let ok = sync.pull(&session, force).await;
            println!("pull: {}", if ok { "ok" } else { "skipped or failed" });
        }
        Commands::Dump => {
            for key in kv.all_keys().await? {
                let value = kv.get(&key).await?.unwrap_or_default();
                println!("{key} = {value}");
            }
        }
    }

    Ok(())
}

#[derive(Subcommand)]
enum VenueCommands {
    /// Add a venue to the questionnaire data
    Add { name: String },
    /// List the user's venues
    List,
    /// Select the current venue
    Select { venue_id: String },
}

async fn run_venue_command(
    store: &UserDataStore,
    selector: &VenueSelector,
    session: &Session,
    action: VenueCommands,
) -> Result<()> {
    match action {
        VenueCommands::Add { name } => {
            let mut data = store
                .load_questionnaire(session)
                .await
                .unwrap_or_else(QuestionnaireData::default);
            let venue = Venue::new(name);
            println!("added venue {} ({})", venue.name, venue.id);
            data.venues.push(venue);
            store.save_questionnaire(session, &data).await?;
        }
        VenueCommands::List => {
            let data = store.load_questionnaire(session).await.unwrap_or_default();
            let selected = selector.selected_venue_id(session).await?;
            for venue in &data.venues {
                let marker = if selected.as_deref() == Some(venue.id.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!("{marker} {} ({})", venue.name, venue.id);
            }
        }
        VenueCommands::Select { venue_id } => {
            selector.set_selected_venue_id(session, &venue_id).await?;
            println!("selected venue {venue_id}");
        }
    }
    Ok(())
}

fn sync_client(kv: &Arc<dyn KvStore>, base_url: &str) -> Result<SyncClient> {
    Ok(SyncClient::new(
        Arc::clone(kv),
        SyncConfig {
            base_url: base_url.to_string(),
            ..Default::default()
        },
    )?)
}

fn parse_answers(pairs: &[String]) -> Result<HashMap<String, serde_json::Value>> {
    let mut answers = HashMap::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("answer `{pair}` is not key=value"))?;
        answers.insert(
            key.to_string(),
            serde_json::Value::String(value.to_string()),
        );
    }
    Ok(answers)
}
