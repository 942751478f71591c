use inbox_triage::analysis::MailService;
use inbox_triage::api::{self, ApiState};
use inbox_triage::classify::{ClassificationModel, TrainingCorpus};
use inbox_triage::config::Config;
use inbox_triage::mail::ImapTransport;
use inbox_triage::secrets::AesGcmSecrets;
use inbox_triage::store::SqliteMessageStore;
use inbox_triage::telemetry;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "inbox-triage", version, about = "Poll IMAP mailboxes and classify incoming mail")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train the model and serve the HTTP API until Ctrl-C
    Serve,
    /// Classify a piece of text and print the result as JSON
    Analyze {
        text: String,
    },
    /// Encrypt a mailbox password into a secret ref
    EncryptSecret {
        plaintext: String,
    },
    /// Print a fresh base64 key for `[secrets] key`
    GenerateKey,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve => serve(config).await,
        Command::Analyze { text } => {
            let model = train(&config)?;
            let result = model.predict_detailed(&text)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::EncryptSecret { plaintext } => {
            let secrets = secrets(&config)?
                .context("no secret key configured; set [secrets] key or INBOX_TRIAGE_SECRET_KEY")?;
            println!("{}", secrets.encrypt(&plaintext)?);
            Ok(())
        }
        Command::GenerateKey => {
            println!("{}", AesGcmSecrets::generate_key());
            Ok(())
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let _guard = telemetry::init_tracing(&config.logging)?;

    let model = Arc::new(train(&config)?);
    let transport = Arc::new(ImapTransport::new(config.poller.transport_options()));
    let store = SqliteMessageStore::connect(&config.store.database_url).await?;

    let mut service =
        MailService::new(model, transport, config.poller.clone()).with_store(store);
    if let Some(secrets) = secrets(&config)? {
        service = service.with_secrets(Arc::new(secrets));
    }
    let service = Arc::new(service);

    let state = Arc::new(ApiState::new(service.clone()));
    let shutdown = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "failed to listen for ctrl-c");
        }
        tracing::info!("shutdown requested");
    };

    let served = api::serve(config.api.bind, state, shutdown).await;

    if let Err(error) = service.shutdown().await {
        tracing::warn!(%error, "pollers did not stop cleanly");
    }
    served?;
    Ok(())
}

fn train(config: &Config) -> anyhow::Result<ClassificationModel> {
    let corpus = TrainingCorpus::from_path(&config.training_data).with_context(|| {
        format!(
            "failed to load training data from {}",
            config.training_data.display()
        )
    })?;
    let model = ClassificationModel::from_corpus(&corpus).context("failed to train model")?;
    Ok(model)
}

fn secrets(config: &Config) -> anyhow::Result<Option<AesGcmSecrets>> {
    config
        .secrets
        .key
        .as_deref()
        .map(AesGcmSecrets::from_base64_key)
        .transpose()
        .map_err(Into::into)
}
