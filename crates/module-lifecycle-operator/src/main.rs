use std::sync::Arc;

use clap::Parser;
use snafu::{ResultExt, Snafu};
use tracing::info;

use module_lifecycle_operator::{
    chart::helm::HelmCli,
    crd::{module::Module, module_lifecycle::ModuleLifecycle, APP_NAME},
    lifecycle::ModuleLifecycleReconciler,
    module::ModuleReconciler,
};
use module_operator::{
    cli::{Command, RunArguments},
    client::{self, create_client},
    config::{self, OperatorConfig},
    controller::Controller,
    leader_election::{self, default_identity, LeaderElector},
    logging::{self, initialize_logging},
    metrics::{self, parse_bind_address, Metrics, Readiness},
    utils::signal::{SignalError, SignalWatcher},
    yaml, CustomResourceExt,
};

const LOG_ENV: &str = "MODULE_LIFECYCLE_OPERATOR_LOG";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to print CRDs"))]
    PrintCrd { source: yaml::Error },

    #[snafu(display("failed to initialize logging"))]
    InitializeLogging { source: logging::Error },

    #[snafu(display("failed to watch for termination signals"))]
    WatchSignals { source: SignalError },

    #[snafu(display("failed to create Kubernetes client"))]
    CreateClient { source: client::Error },

    #[snafu(display("failed to set up metrics"))]
    SetUpMetrics { source: metrics::Error },

    #[snafu(display("metrics server failed"))]
    ServeMetrics { source: metrics::Error },

    #[snafu(display("leader election failed"))]
    LeaderElection { source: leader_election::Error },
}

#[derive(Parser)]
#[clap(about, author, version)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

#[snafu::report]
#[tokio::main]
async fn main() -> Result<(), Error> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::Crd => {
            ModuleLifecycle::print_yaml_schema().context(PrintCrdSnafu)?;
            Module::print_yaml_schema().context(PrintCrdSnafu)?;
        }
        Command::Run(args) => run(args).await?,
    }
    Ok(())
}

async fn run(args: RunArguments) -> Result<(), Error> {
    initialize_logging(LOG_ENV, APP_NAME).context(InitializeLoggingSnafu)?;
    config::set(args.into());

    let result = run_operator(config::get()).await;
    config::reset();
    result
}

async fn run_operator(config: OperatorConfig) -> Result<(), Error> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        lifecycle_class = %config.lifecycle_class,
        watch_namespace = %config.watch_namespace,
        chart_dir = %config.chart_dir.display(),
        cert_dir = %config.cert_dir.display(),
        "Starting {APP_NAME}"
    );

    let signals = SignalWatcher::terminate().context(WatchSignalsSnafu)?;
    let shutdown = signals.token();
    let client = create_client(Some(APP_NAME.to_owned()))
        .await
        .context(CreateClientSnafu)?;

    let metrics = Arc::new(Metrics::new().context(SetUpMetricsSnafu)?);
    let readiness = Readiness::default();
    let address = parse_bind_address(&config.metrics_bind_address).context(SetUpMetricsSnafu)?;
    let server = tokio::spawn(metrics::serve(
        address,
        metrics.clone(),
        readiness.clone(),
        signals.handle(),
    ));

    let elector = if config.leader_elect {
        let elector = LeaderElector::new(
            client.as_kube_client(),
            &config.leader_election_namespace,
            APP_NAME,
            default_identity(),
        );
        if !elector.acquire(&shutdown).await.context(LeaderElectionSnafu)? {
            return Ok(());
        }
        Some(elector)
    } else {
        None
    };

    let lifecycles = Controller::new(
        client.clone(),
        ModuleLifecycleReconciler::new(
            Arc::new(HelmCli::default()),
            config.lifecycle_class.clone(),
            config.chart_dir.clone(),
        ),
        ModuleLifecycle::api_resource(),
        config.watch_namespace.clone(),
    )
    .with_metrics(metrics.clone());
    let modules = Controller::new(
        client,
        ModuleReconciler::new(config.lifecycle_class.clone()),
        Module::api_resource(),
        config.watch_namespace.clone(),
    )
    .with_metrics(metrics);

    readiness.set_ready(true);
    let controllers = futures::future::join(
        lifecycles.run(shutdown.clone(), signals.handle()),
        modules.run(shutdown.clone(), signals.handle()),
    );
    tokio::pin!(controllers);

    match elector {
        Some(elector) => {
            tokio::select! {
                _ = &mut controllers => {}
                held = elector.hold(shutdown.clone()) => {
                    held.context(LeaderElectionSnafu)?;
                    controllers.await;
                }
            }
        }
        None => {
            controllers.await;
        }
    }
    readiness.set_ready(false);

    match server.await {
        Ok(served) => served.context(ServeMetricsSnafu)?,
        Err(err) => tracing::warn!(
            error = &err as &dyn std::error::Error,
            "Metrics server task did not finish"
        ),
    }
    info!("Shut down");
    Ok(())
}
