use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;
use tracing_subscriber::EnvFilter;

use relay_core::RelayConfig;
use relay_core::command::{CommandDispatcher, CommandProcessor};
use relay_core::domain::{Envelope, Payload, ProcessingError, payload_from};
use relay_core::impls::InMemoryTransport;
use relay_core::pipeline::{
    BatchItem, BatchMode, CognitiveFilter, EnrichmentFilter, Pipeline, UppercaseFilter,
    ValidationFilter,
};
use relay_core::ports::{
    CognitiveProcessor, ConversationHandle, SystemClock, Transport, UlidGenerator,
};
use relay_core::pubsub::{Broker, Subscription};
use relay_core::queue::{QueueConsumer, QueueProcessor};

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Run the messaging patterns against an in-memory transport", long_about = None)]
struct Cli {
    /// TOML config file; defaults apply when omitted
    #[arg(short, long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Push sum tasks through a queue consumer
    Queue {
        #[arg(short = 'n', long, default_value = "3")]
        tasks: usize,
    },

    /// Run contacts through a validate/uppercase/enrich pipeline
    Pipeline,

    /// Publish an event to topic subscribers
    Pubsub {
        #[arg(short, long, default_value = "orders")]
        topic: String,
    },

    /// Submit a command and wait for its result
    Command {
        #[arg(short = 't', long, default_value = "summarize")]
        command_type: String,

        #[arg(long, default_value = "5000")]
        timeout_ms: u64,
    },

    /// Run every demo in turn
    All,
}

/// Deterministic stand-in for a model backend.
///
/// - `data: [numbers]` → their sum
/// - `text: "..."` → word count and a fixed sentiment
/// - anything else → the payload echoed back
struct LocalProcessor;

#[async_trait]
impl CognitiveProcessor for LocalProcessor {
    async fn invoke(
        &self,
        instructions: &str,
        input: &Payload,
        _context: Option<&ConversationHandle>,
    ) -> Result<String, ProcessingError> {
        if let Some(data) = input.get("data") {
            let numbers = data
                .as_array()
                .ok_or_else(|| ProcessingError::InvalidInput("data must be an array".into()))?;
            let sum: f64 = numbers.iter().filter_map(Value::as_f64).sum();
            return Ok(sum.to_string());
        }
        if let Some(text) = input.get("text").and_then(Value::as_str) {
            let words = text.split_whitespace().count();
            return Ok(json!({"words": words, "sentiment": "neutral"}).to_string());
        }
        Ok(json!({"instructions": instructions, "echo": input}).to_string())
    }
}

#[derive(Serialize)]
struct QueueSummary {
    responses: Vec<Value>,
    acknowledged: u64,
    dead_lettered: u64,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "relay=info".into());
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn print<T: Serialize>(title: &str, value: &T) -> Result<()> {
    println!("== {title}");
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_queue(config: &RelayConfig, tasks: usize) -> Result<()> {
    let transport = InMemoryTransport::new();
    let mut consumer_config = config.consumer.clone();
    consumer_config
        .reply_channel
        .get_or_insert_with(|| "responses".to_string());

    let consumer = QueueConsumer::new(
        Arc::new(transport.clone()),
        "tasks",
        QueueProcessor::new("summer", "sum the data", Arc::new(LocalProcessor)),
        consumer_config,
    )
    .with_retry_policy(config.retry.policy());

    for i in 0..tasks {
        let data: Vec<usize> = (1..=i + 3).collect();
        let task = Envelope::task("relay-cli", payload_from(json!({"task": "sum", "data": data})));
        transport.send("tasks", &task).await?;
    }
    // malformed data lands in the dead-letter destination
    let bad = Envelope::task("relay-cli", payload_from(json!({"data": "oops"})));
    transport.send("tasks", &bad).await?;

    consumer.start().await;
    let expected = (tasks + 1) as u64;
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let counts = consumer.counts();
            if counts.acknowledged + counts.dead_lettered >= expected {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .context("queue demo did not drain in time")?;
    consumer.stop().await;

    let counts = consumer.counts();
    let responses = transport
        .drain("responses")
        .await
        .into_iter()
        .map(|r| Value::Object(r.payload().clone()))
        .collect();
    print(
        "queue",
        &QueueSummary {
            responses,
            acknowledged: counts.acknowledged,
            dead_lettered: counts.dead_lettered,
        },
    )
}

async fn run_pipeline(config: &RelayConfig) -> Result<()> {
    let pipeline = Pipeline::new("contacts", &config.pipeline)
        .with_filter(ValidationFilter::new(["email"]))
        .with_filter(UppercaseFilter::new("name"))
        .with_filter(EnrichmentFilter::new(
            "enrich",
            payload_from(json!({"segment": "retail"})),
        ))
        .with_filter(
            CognitiveFilter::new(
                "analyze",
                Arc::new(LocalProcessor),
                "analyze the note",
                "analysis",
            )
            .with_retry_policy(config.retry.policy()),
        );

    let contacts = vec![
        Envelope::task(
            "relay-cli",
            payload_from(json!({"email": "a@b.com", "name": "joe", "text": "call me back"})),
        ),
        Envelope::task("relay-cli", payload_from(json!({"name": "ann"}))),
    ];
    let report = pipeline
        .process_batch(&contacts, BatchMode::Sequential)
        .await;

    for item in &report.items {
        if let BatchItem::Sequential(run) = item {
            let output = run.output.as_ref().map(|e| Value::Object(e.payload().clone()));
            print(
                "pipeline run",
                &json!({"output": output, "transformations": run.transformations}),
            )?;
        }
    }
    print("pipeline summary", &report.summary)
}

async fn run_pubsub(config: &RelayConfig, topic: &str) -> Result<()> {
    let transport = InMemoryTransport::new();
    let broker = Broker::new(
        "relay-cli",
        Arc::new(transport),
        Arc::new(UlidGenerator::new(SystemClock)),
    )
    .with_retry_policy(config.retry.policy());

    for (name, topics) in [
        ("billing", vec!["orders"]),
        ("shipping", vec!["orders", "returns"]),
        ("crm", vec!["customers"]),
    ] {
        broker
            .subscribe(Subscription::new(
                name,
                topics,
                format!("handle as {name}"),
                Arc::new(LocalProcessor),
            ))
            .await;
    }

    let handle = broker
        .publish(topic, payload_from(json!({"order_id": 42, "text": "two widgets"})))
        .await?;
    info!(matched = handle.matched, "event published");
    let report = handle.wait().await?;
    print("publish", &report)?;
    print("subscribers", &broker.list_subscribers().await)
}

async fn run_command(config: &RelayConfig, command_type: &str, timeout: Duration) -> Result<()> {
    let dispatcher = CommandDispatcher::new(
        "relay-cli",
        &config.commands,
        Arc::new(UlidGenerator::new(SystemClock)),
        Arc::new(SystemClock),
    )
    .with_retry_policy(config.retry.policy());
    dispatcher
        .register_processor(CommandProcessor::new(
            "summarizer",
            ["summarize", "classify"],
            "summarize the document",
            Arc::new(LocalProcessor),
        ))
        .await;

    let response = dispatcher
        .invoke_and_wait(
            command_type,
            payload_from(json!({"text": "the quick brown fox"})),
            timeout,
        )
        .await?;
    print("command response", &Value::Object(response.payload().clone()))?;

    // no processor for this one
    dispatcher.submit("process_data", Payload::new(), None).await;

    dispatcher.shutdown().await;
    print("commands", &dispatcher.list_commands().await)?;
    print("command counts", &dispatcher.counts_by_status().await)?;
    print("processors", &dispatcher.list_processors().await)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let config = match &cli.config {
        Some(path) => RelayConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => RelayConfig::default(),
    };

    match cli.command {
        Commands::Queue { tasks } => run_queue(&config, tasks).await?,
        Commands::Pipeline => run_pipeline(&config).await?,
        Commands::Pubsub { topic } => run_pubsub(&config, &topic).await?,
        Commands::Command {
            command_type,
            timeout_ms,
        } => {
            if timeout_ms == 0 {
                bail!("--timeout-ms must be positive");
            }
            run_command(&config, &command_type, Duration::from_millis(timeout_ms)).await?
        }
        Commands::All => {
            run_queue(&config, 3).await?;
            run_pipeline(&config).await?;
            run_pubsub(&config, "orders").await?;
            run_command(&config, "summarize", Duration::from_secs(5)).await?;
        }
    }
    Ok(())
}
