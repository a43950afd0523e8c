use std::{error::Error, io::Write as _, process::ExitCode, str::FromStr};

use orderbus::{
    Headers, PublishRequest,
    broker::rabbitmq::RabbitMq,
    config::Settings,
    publisher::TopicPublisher,
    telemetry,
    transport::{RawPayload, Sender},
};
use rust_decimal::Decimal;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

const FAILURE_MESSAGE: &str =
    "Sorry we were not able to process your order at this time. Please try again later.";

type Input = Lines<BufReader<Stdin>>;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();
    telemetry::init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "Order publisher stopped");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<(), Box<dyn Error>> {
    let settings = Settings::load()?;
    let broker = RabbitMq::connect(&settings.connection_string).await?;
    let sender = broker.topic_sender(&settings.topic_name).await?;
    let mut publisher =
        TopicPublisher::with_timeout(settings.topic_name.clone(), sender, settings.publish_timeout);

    println!("**************************");
    println!("--- Order Publisher ---");
    println!("**************************\n");
    println!("Commands: \n    add - Add Order\n    quit - Exit application");

    tokio::select! {
        result = prompt_loop(&mut publisher) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
    }

    publisher.close().await?;
    Ok(())
}

async fn prompt_loop<D>(publisher: &mut TopicPublisher<D>) -> std::io::Result<()>
where
    D: Sender<Headers, RawPayload> + Clone + Send + 'static,
{
    let mut input = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match ask(&mut input, "\nEnter command> ").await?.as_deref() {
            None | Some("quit") => return Ok(()),
            Some("add") => submit_order(publisher, &mut input).await?,
            Some(_) => println!("Unknown command"),
        }
    }
}

async fn submit_order<D>(
    publisher: &mut TopicPublisher<D>,
    input: &mut Input,
) -> std::io::Result<()>
where
    D: Sender<Headers, RawPayload> + Clone + Send + 'static,
{
    let customer_name = ask(input, "Customer Name: ").await?.unwrap_or_default();
    let item_name = ask(input, "Item Name: ").await?.unwrap_or_default();
    let quantity = parse_or_zero::<u32>("Quantity", ask(input, "Quantity: ").await?);
    let unit_price = parse_or_zero::<Decimal>("Item Price", ask(input, "Item Price: ").await?);

    let request = PublishRequest {
        customer_name,
        item_name,
        unit_price,
        quantity,
        order_id: None,
    };

    match publisher.publish_order(request).await {
        Ok(order_id) => {
            tracing::debug!(%order_id, "Order submitted");
            println!("The new order successfully submitted.");
        }
        Err(error) => {
            tracing::error!(%error, "Failed to publish order");
            println!("{FAILURE_MESSAGE}");
        }
    }
    Ok(())
}

/// Print `prompt` and read one trimmed line. `None` once stdin is closed.
async fn ask(input: &mut Input, prompt: &str) -> std::io::Result<Option<String>> {
    print!("{prompt}");
    std::io::stdout().flush()?;
    Ok(input.next_line().await?.map(|line| line.trim().to_owned()))
}

fn parse_or_zero<T>(field: &str, value: Option<String>) -> T
where
    T: FromStr + Default,
{
    let value = value.unwrap_or_default();
    value.parse().unwrap_or_else(|_| {
        tracing::warn!(field, %value, "Could not parse input, using 0");
        T::default()
    })
}
