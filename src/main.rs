use courier::{
    Config, ConnectionManager, ConsumerRegistry, Correlator, ReconnectPolicy, instance,
    recovery, set_instance, transport::rabbitmq::RabbitMqConnector,
};
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    if let Err(error) = dotenv::dotenv() {
        eprintln!("No .env file loaded: {error}");
    }

    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    match run().await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "Startup failed");
            std::process::ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), tower::BoxError> {
    let config = Config::from_env()?;

    let connection = ConnectionManager::connect_with(
        config.amqp_url.clone(),
        RabbitMqConnector,
        ReconnectPolicy {
            delay: config.reconnect_delay,
        },
    )
    .await?;
    let registry =
        ConsumerRegistry::new(connection.clone()).with_dead_letter_exchange(&config.amqp_dlx);

    recovery::register(
        &registry,
        &config.amqp_dlx,
        config.dead_letter_queue.clone(),
        config.timeout_notification_ttl,
    )
    .await?;

    let correlator = Correlator::start(connection, &registry).await?;
    set_instance(correlator);

    tracing::info!(
        multi_tenant = config.multi_tenant,
        update_acl_based_on_groups = config.update_acl_based_on_groups,
        dlx = %config.amqp_dlx,
        "Courier started"
    );

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(%error, "Failed to install Ctrl+C handler");
        }
        cancel_signal.cancel();
    });
    cancel.cancelled().await;

    tracing::info!("Shutting down");
    instance()?.close().await;
    Ok(())
}
