//! `mailgen`: send notifications for pending directives.
//!
//! One run holds a single database transaction. Everything is committed at
//! the end, except in dry-run and preview mode, where it is rolled back.

use anyhow::Context as _;
use clap::Parser;
use mailgen_core::store::DirectiveFilter;
use mailgen_core::template::TemplateStore;
use mailgen_db::PgStore;
use mailgen_mail::{
    DiscardTransport, GpgSigner, MailTransport, PreviewTransport, SmtpConfig, SmtpMailer,
};
use mailgen_pipeline::operator::{run_interactive, TerminalPrompt};
use mailgen_pipeline::{
    NotificationSettings, Orchestrator, PipelineError, RunOutcome, RunSummary, ScriptRegistry,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod config;

use config::Config;

#[derive(Parser)]
#[command(
    name = "mailgen",
    about = "Create and send notification mails for pending directives",
    version
)]
struct Cli {
    /// Process all pending directives without asking
    #[arg(short = 'a', long)]
    all: bool,

    /// Run everything but send nothing and roll back all changes
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Like --dry-run, but print every mail to stdout
    #[arg(short = 'p', long)]
    preview: bool,

    /// Read only this configuration file
    #[arg(short = 'c', long, env = "MAILGEN_CONFIG")]
    config: Option<std::path::PathBuf>,

    /// SQL condition restricting which directives are processed
    #[arg(long)]
    filter: Option<String>,

    /// Apply the bundled database migrations before the run
    #[arg(long)]
    migrate: bool,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn discards_changes(&self) -> bool {
        self.dry_run || self.preview
    }
}

fn init_tracing(default_directive: &str, json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

/// Build the GnuPG signer when signing is enabled, checking its key first.
async fn signer(config: &Config) -> anyhow::Result<Option<GpgSigner>> {
    if !config.openpgp.always_sign {
        return Ok(None);
    }
    let signer = GpgSigner::new(&config.openpgp);
    signer.verify_key().await.with_context(|| {
        format!(
            "signing key {} is not usable in {}",
            config.openpgp.signing_key,
            config.openpgp.gnupg_home.display()
        )
    })?;
    Ok(Some(signer))
}

fn transport(cli: &Cli, config: &Config) -> anyhow::Result<Box<dyn MailTransport>> {
    if cli.preview {
        return Ok(Box::new(PreviewTransport::new(std::io::stdout())));
    }
    if cli.dry_run {
        return Ok(Box::new(DiscardTransport));
    }
    let smtp = config.smtp(SmtpConfig::from_env())?;
    tracing::debug!(host = %smtp.host, port = smtp.port, "Using SMTP relay");
    Ok(Box::new(SmtpMailer::new(&smtp)?))
}

fn log_summary(summary: &RunSummary) {
    tracing::info!(
        sent = summary.sent,
        postponed = summary.postponed,
        errored = summary.errored,
        "{} mails sent, {} postponed, {} errors",
        summary.sent,
        summary.postponed,
        summary.errored
    );
}

async fn process(
    cli: &Cli,
    orchestrator: &Orchestrator<'_>,
    store: &mut PgStore,
    filter: Option<&DirectiveFilter>,
) -> Result<RunOutcome, PipelineError> {
    if cli.all {
        return orchestrator.run(store, filter).await;
    }
    let Some(directives) = orchestrator.fetch(store, filter).await? else {
        return Ok(RunOutcome::Locked);
    };
    if directives.is_empty() {
        return Ok(RunOutcome::Completed(RunSummary::default()));
    }
    let mut prompt = TerminalPrompt::new();
    let summary = run_interactive(orchestrator, store, &directives, &mut prompt).await?;
    log_summary(&summary);
    Ok(RunOutcome::Completed(summary))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Configuration problems abort before the database is touched.
    let config = Config::load(cli.config.as_deref()).context("could not load configuration")?;
    init_tracing(&config.log_directive(), cli.log_json);

    let signer = signer(&config).await?;
    let scripts = ScriptRegistry::load(&config.script_directory, config.script_timeout())
        .await
        .context("could not load notification scripts")?;
    tracing::info!(
        count = scripts.len(),
        dir = %config.script_directory.display(),
        "Loaded notification scripts"
    );

    let mut settings = NotificationSettings::new(
        config.sender.clone(),
        TemplateStore::new(config.template_dir.clone()),
    );
    settings.xarf_report_domain = config.xarf_reportdomain.clone();
    if let Some(signer) = signer {
        settings = settings.with_signer(Box::new(signer));
    }
    let transport = transport(&cli, &config)?;

    let options = config.connect_options(std::env::var("DATABASE_URL").ok().as_deref())?;
    let pool = mailgen_db::create_pool(options)
        .await
        .context("failed to connect to database")?;
    mailgen_db::health_check(&pool)
        .await
        .context("database health check failed")?;
    if cli.migrate {
        mailgen_db::run_migrations(&pool)
            .await
            .context("failed to run database migrations")?;
        tracing::info!("Database migrations applied");
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, stopping after the current directive");
                cancel.cancel();
            }
        }
    });

    let orchestrator = Orchestrator::new(&scripts, &settings, transport.as_ref())
        .dry_run(cli.discards_changes())
        .with_cancellation(cancel);
    let filter = cli.filter.as_deref().map(DirectiveFilter::new);

    let mut store = PgStore::begin(&pool).await?;
    let outcome = process(&cli, &orchestrator, &mut store, filter.as_ref()).await;

    // Mails that went out stay marked as sent, even after a fatal error.
    if cli.discards_changes() {
        store.rollback().await?;
        tracing::info!("Dry run, all changes rolled back");
    } else {
        store.commit().await?;
    }

    match outcome? {
        RunOutcome::Locked => {
            tracing::info!("Directives are locked by another run, nothing to do")
        }
        RunOutcome::Completed(_) => {}
    }
    Ok(())
}
