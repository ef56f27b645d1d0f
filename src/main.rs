use std::process;
use std::sync::Arc;

use spurgo::{
    config,
    headers::HEADER_CACHE_DEBUG,
    store::{BackendError, FileBackend},
    telemetry,
    token::TokenStorage,
    varnish::{BanDispatcher, BanReport, ClientError, HttpProxyClient},
};
use thiserror::Error;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;
use url::Url;

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Config(#[from] config::LoadError),
    #[error(transparent)]
    Telemetry(#[from] telemetry::TelemetryError),
    #[error(transparent)]
    Store(#[from] BackendError),
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error("{failed} of {total} ban requests failed")]
    BanIncomplete { failed: usize, total: usize },
    #[error("check failed: {0}")]
    Check(String),
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &CliError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), CliError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    match cli_args.command {
        config::Command::Clear(args) => run_clear(settings, args).await,
        config::Command::Check(args) => run_check(settings, args).await,
    }
}

async fn run_clear(settings: config::Settings, args: config::ClearArgs) -> Result<(), CliError> {
    let backend = Arc::new(FileBackend::new(settings.store.directory.clone())?);
    let token = TokenStorage::new(backend).get_token()?;
    let sender = Arc::new(HttpProxyClient::new(settings.proxy.timeout)?);
    let bans = BanDispatcher::new(&settings.proxy, &settings.cache_headers, token, sender);

    let report = if args.tags.is_empty() {
        info!(
            target = "spurgo::clear",
            domains = ?args.domains,
            content_type = args.content_type.as_deref(),
            "Clearing all cached objects"
        );
        bans.ban_all(&args.domains, args.content_type.as_deref())
            .await
    } else {
        info!(
            target = "spurgo::clear",
            tags = ?args.tags,
            domains = ?args.domains,
            "Clearing cached objects by tag"
        );
        bans.ban_by_tags(&args.tags, &args.domains).await
    };

    finish_report(report)
}

fn finish_report(report: BanReport) -> Result<(), CliError> {
    if report.all_succeeded() {
        info!(
            target = "spurgo::clear",
            requests = report.total(),
            "Ban requests delivered"
        );
        return Ok(());
    }

    Err(CliError::BanIncomplete {
        failed: report.failed(),
        total: report.total(),
    })
}

async fn run_check(settings: config::Settings, args: config::CheckArgs) -> Result<(), CliError> {
    let mut url =
        Url::parse(&args.url).map_err(|err| CliError::Check(format!("invalid URL: {err}")))?;
    if let Some(port) = args.port {
        url.set_port(Some(port))
            .map_err(|()| CliError::Check("URL cannot carry a port".to_string()))?;
    }

    // The lookup often targets the proxy port directly, where certificates
    // rarely match the requested host.
    let client = reqwest::Client::builder()
        .user_agent(concat!("spurgo/", env!("CARGO_PKG_VERSION")))
        .timeout(settings.proxy.timeout)
        .danger_accept_invalid_certs(true)
        .build()
        .map_err(ClientError::Build)?;

    let response = client
        .get(url.clone())
        .header(HEADER_CACHE_DEBUG, "1")
        .send()
        .await
        .map_err(|err| CliError::Check(err.to_string()))?;

    info!(
        target = "spurgo::check",
        status = %response.status(),
        url = %url,
        "Checked URL through the caching proxy"
    );
    for (name, value) in response.headers() {
        info!(
            target = "spurgo::check",
            name = %name,
            value = %String::from_utf8_lossy(value.as_bytes()),
            "Response header"
        );
    }

    Ok(())
}
