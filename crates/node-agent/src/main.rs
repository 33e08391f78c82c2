use anyhow::Context;
use anyhow::Result;
use api_types::PrepareRequest;
use clap::Parser;
use node_agent::checkpoint::load_checkpoint;
use node_agent::checkpoint::FileCheckpointStore;
use node_agent::config::Cli;
use node_agent::config::Commands;
use node_agent::config::PrepareArgs;
use node_agent::PrepareService;
use tokio_util::sync::CancellationToken;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

/// Cancels the returned token on Ctrl-C so a waiting lock acquisition gives up.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupted, cancelling");
            cancel.cancel();
        }
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();
    let _guard = utils::logging::init(cli.agent.log_path.as_deref());

    tracing::info!("node-agent {}", &**version::VERSION);

    let ctx = cancel_on_ctrl_c();
    let service = PrepareService::new(cli.agent.service_config());

    match cli.command {
        Commands::Prepare(args) => run_prepare(&service, &ctx, args).await,
        Commands::Unprepare(args) => {
            service
                .unprepare(&ctx, &args.claim_id)
                .await
                .map_err(|e| anyhow::anyhow!("{e:?}"))
                .with_context(|| format!("unprepare claim {}", args.claim_id))?;
            Ok(())
        }
        Commands::ShowCheckpoint => {
            let store = FileCheckpointStore::new(&cli.agent.checkpoint_path);
            let checkpoint = load_checkpoint(&store, &ctx)
                .await
                .map_err(|e| anyhow::anyhow!("{e:?}"))?;
            println!("{}", serde_json::to_string_pretty(&checkpoint)?);
            Ok(())
        }
    }
}

async fn run_prepare(
    service: &PrepareService,
    ctx: &CancellationToken,
    args: PrepareArgs,
) -> Result<()> {
    let raw = std::fs::read(&args.request)
        .with_context(|| format!("read prepare request {}", args.request.display()))?;
    let mut request: PrepareRequest =
        serde_json::from_slice(&raw).context("decode prepare request")?;
    if let Some(claim_id) = args.claim_id {
        request.claim_id = claim_id;
    }
    request.vfio |= args.vfio;

    let result = service
        .prepare(ctx, &request)
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))
        .with_context(|| format!("prepare claim {}", request.claim_id))?;

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
