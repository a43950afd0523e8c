use std::{convert::Infallible, error::Error, process::ExitCode};

use orderbus::{
    Order,
    broker::{DeliveryMetadata, rabbitmq::RabbitMq},
    config::Settings,
    listener::Listener,
    provisioner::ensure_subscription,
    telemetry,
};
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();
    telemetry::init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "Order receiver stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let settings = Settings::load()?;
    let description = settings.subscription()?;

    let broker = RabbitMq::connect(&settings.connection_string).await?;
    let provisioned = ensure_subscription(&broker, &description).await?;
    tracing::info!(?provisioned, subscription = %description.name, "Subscription ready");

    let max_concurrent_calls = settings.max_concurrent_calls();
    let prefetch = u16::try_from(max_concurrent_calls).unwrap_or(u16::MAX);
    let subscription = broker
        .subscription(&description.topic, &description.name, prefetch)
        .await?;

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => cancel_signal.cancel(),
            Err(error) => tracing::error!(?error, "Failed to install Ctrl+C handler"),
        }
    });

    println!("Waiting for new orders... \n");
    let outcome = Listener::new(subscription, print_order)
        .with_max_concurrent_calls(max_concurrent_calls)
        .run(cancel)
        .await;

    close_after(outcome, broker.close()).await
}

/// Run `close` whatever the listener returned. The listener's error wins
/// over a close error.
async fn close_after<E, C>(
    outcome: Result<(), E>,
    close: impl Future<Output = Result<(), C>>,
) -> Result<(), Box<dyn Error>>
where
    E: Error + 'static,
    C: Error + 'static,
{
    let closed = close.await;
    if let (Err(_), Err(error)) = (&outcome, &closed) {
        tracing::warn!(%error, "Failed to close broker connection");
    }
    outcome?;
    closed?;
    Ok(())
}

async fn print_order(order: Order, metadata: DeliveryMetadata) -> Result<(), Infallible> {
    let minutes = metadata.time_to_live.as_secs_f64() / 60.0;
    println!(
        "--------------------\n\
         New Order Received!\n\
         --------------------\n\
         Label : {}\n\
         Content Type : {}\n\
         Time to Live : {minutes} minutes\n\n\
         Customer Name: {}\n\
         Item : {}\n\
         Unit Price: {}\n\
         Quantity: {}\n\
         ----------------",
        metadata.label,
        metadata.content_type,
        order.customer_name,
        order.item_name,
        order.unit_price,
        order.quantity,
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    #[derive(Debug)]
    struct Broken(&'static str);

    impl std::fmt::Display for Broken {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str(self.0)
        }
    }

    impl Error for Broken {}

    #[tokio::test]
    async fn broker_is_closed_when_the_listener_faults() {
        let closed = AtomicBool::new(false);
        let close = async {
            closed.store(true, Ordering::SeqCst);
            Ok::<_, Broken>(())
        };

        let err = close_after(Err(Broken("stream ended")), close).await.unwrap_err();

        assert!(closed.load(Ordering::SeqCst));
        assert_eq!(err.to_string(), "stream ended");
    }

    #[tokio::test]
    async fn listener_error_wins_over_close_error() {
        let close = async { Err::<(), _>(Broken("close failed")) };
        let err = close_after(Err(Broken("stream ended")), close).await.unwrap_err();
        assert_eq!(err.to_string(), "stream ended");

        let close = async { Err::<(), _>(Broken("close failed")) };
        let err = close_after(Ok::<_, Broken>(()), close).await.unwrap_err();
        assert_eq!(err.to_string(), "close failed");
    }
}
