use clap::{
    Parser,
    Subcommand,
};
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use futures::{
    StreamExt,
    stream::{
        self,
        BoxStream,
    },
};
use ledger_sync::{
    AccountId,
    ConnectionRouter,
    DelegationCache,
    Endpoint,
    GameStateSnapshot,
    Intent,
    LedgerKind,
    StateMirror,
    SubscriptionManager,
    subscription::HandleStatus,
};
use std::{
    path::{
        Path,
        PathBuf,
    },
    sync::Arc,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

mod config;
mod rpc_transport;

use config::{
    EndpointUrls,
    Overrides,
    Settings,
};
use rpc_transport::{
    RpcLedger,
    SubscriptionEpochs,
};

#[derive(Parser, Debug)]
#[command(version, about = "Route and mirror game accounts across base and ephemeral ledgers")]
struct Args {
    /// JSON file with endpoints, delegation program and tunables.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[command(flatten)]
    overrides: Overrides,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Mirror accounts and log every snapshot and connection change until Ctrl-C.
    Watch {
        #[arg(required = true)]
        accounts: Vec<AccountId>,
    },
    /// Print which ledger currently owns an account.
    Route {
        account: AccountId,
        /// Show the profile used for writes instead of reads.
        #[arg(long)]
        write: bool,
    },
    /// Submit a hex encoded transaction to the ledger owning an account.
    Submit {
        account: AccountId,
        transaction: String,
    },
}

fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let guard = match log_file {
        Some(path) => {
            let file_name = path
                .file_name()
                .ok_or_else(|| eyre!("--log-file must name a file"))?;
            let dir = path
                .parent()
                .filter(|dir| !dir.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
            builder
                .with_ansi(false)
                .with_writer(writer)
                .try_init()
                .map_err(|err| eyre!("failed to install tracing subscriber: {err}"))?;
            Some(guard)
        }
        None => {
            builder
                .try_init()
                .map_err(|err| eyre!("failed to install tracing subscriber: {err}"))?;
            None
        }
    };
    Ok(guard)
}

struct SyncClient {
    router: Arc<ConnectionRouter<RpcLedger>>,
    mirror: Arc<StateMirror>,
    manager: SubscriptionManager<RpcLedger>,
}

impl SyncClient {
    fn connect(settings: Settings) -> Result<Self> {
        let Settings {
            base,
            ephemeral,
            delegation_program,
            delegation_cache,
            subscription,
        } = settings;
        let epochs = SubscriptionEpochs::default();
        let base = Arc::new(ledger(&base, epochs.clone()).wrap_err("configuring base ledger")?);
        let ephemeral =
            Arc::new(ledger(&ephemeral, epochs).wrap_err("configuring ephemeral ledger")?);
        let cache = Arc::new(DelegationCache::new(
            Arc::clone(&base),
            delegation_program,
            delegation_cache,
        ));
        let router = Arc::new(ConnectionRouter::new(
            cache,
            Endpoint::new(LedgerKind::Base, base),
            Endpoint::new(LedgerKind::Ephemeral, ephemeral),
        ));
        let mirror = Arc::new(StateMirror::new());
        let manager =
            SubscriptionManager::new(Arc::clone(&router), Arc::clone(&mirror), subscription);
        Ok(Self {
            router,
            mirror,
            manager,
        })
    }
}

fn ledger(urls: &EndpointUrls, epochs: SubscriptionEpochs) -> Result<RpcLedger> {
    tracing::debug!(http = %urls.http_url, ws = %urls.ws_url, "configuring ledger");
    RpcLedger::new(urls.http_url.clone(), urls.ws_url.clone(), epochs)
}

enum Output {
    Snapshot(Arc<GameStateSnapshot>),
    Status(AccountId, HandleStatus),
}

async fn handle_interrupt() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received interrupt, exiting"),
        Err(err) => tracing::warn!(?err, "Received interrupt error, exiting anyway"),
    }
}

async fn watch(client: SyncClient, accounts: Vec<AccountId>) -> Result<()> {
    for account in &accounts {
        match client.router.route_for(account, Intent::Read).await {
            Ok(route) => {
                tracing::info!(account = %account, ledger = %route.endpoint.kind(), "routed")
            }
            Err(err) => tracing::warn!(
                account = %account,
                %err,
                retryable = err.is_retryable(),
                "no route yet"
            ),
        }
    }

    let mut outputs: Vec<BoxStream<'static, Output>> = Vec::new();
    for account in &accounts {
        let account = *account;
        let handle = client.manager.watch(account);
        outputs.push(
            client
                .mirror
                .subscribe(&account)
                .map(Output::Snapshot)
                .boxed(),
        );
        outputs.push(
            handle
                .changes()
                .map(move |status| Output::Status(account, status))
                .boxed(),
        );
    }
    let mut outputs = stream::select_all(outputs);

    let interrupt = handle_interrupt();
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            _ = &mut interrupt => break,
            output = outputs.next() => match output {
                Some(Output::Snapshot(snapshot)) => tracing::info!(
                    account = %snapshot.account_id,
                    sequence = snapshot.sequence,
                    bytes = snapshot.payload.len(),
                    updated_at = %snapshot.updated_at,
                    "snapshot"
                ),
                Some(Output::Status(account, status)) => tracing::info!(
                    account = %account,
                    state = ?status.state,
                    ledger = ?status.endpoint_kind,
                    last_seen = ?status.last_seen_sequence,
                    "connection"
                ),
                None => break,
            },
        }
    }

    client.manager.shutdown().await;
    Ok(())
}

async fn route(client: &SyncClient, account: AccountId, write: bool) -> Result<()> {
    let intent = if write { Intent::Write } else { Intent::Read };
    let route = client
        .router
        .route_for(&account, intent)
        .await
        .wrap_err_with(|| format!("routing {account}"))?;
    println!(
        "{account} -> {} (skip preflight: {}, confirmation timeout: {:?})",
        route.endpoint.kind(),
        route.profile.skip_preflight,
        route.profile.confirmation_timeout,
    );
    Ok(())
}

async fn submit(client: &SyncClient, account: AccountId, transaction: &str) -> Result<()> {
    let bytes = hex::decode(transaction.trim_start_matches("0x"))
        .wrap_err("transaction must be hex encoded")?;
    let provider = client
        .router
        .provider_for(&account, Intent::Write)
        .await
        .wrap_err_with(|| format!("routing {account}"))?;
    tracing::info!(
        account = %account,
        skip_preflight = provider.profile().skip_preflight,
        "submitting transaction"
    );
    let signature = provider
        .send_transaction(&bytes)
        .await
        .wrap_err("sendTransaction failed")?;
    println!("{signature}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let args = Args::parse();
    let _guard = init_tracing(args.log_file.as_deref())?;
    let settings = config::load_settings(args.config.as_ref(), args.overrides)?;
    tracing::info!(
        delegation_program = %settings.delegation_program,
        base = %settings.base.http_url,
        ephemeral = %settings.ephemeral.http_url,
        "starting ledger-sync"
    );
    let client = SyncClient::connect(settings)?;

    match args.command {
        Command::Watch { accounts } => watch(client, accounts).await,
        Command::Route { account, write } => route(&client, account, write).await,
        Command::Submit {
            account,
            transaction,
        } => submit(&client, account, &transaction).await,
    }
}
