//! Stream loader - main entry point
//!
//! Subcommands select the input backend and its default engine action; the
//! `-withinfo` variants default to the info-producing operations and
//! forward info payloads to the configured info sink. Configuration comes
//! from flags, `SENZING_*` environment variables, and the optional TOML
//! config file, in that order.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use loader_common::directive::DEFAULT_DIRECTIVE_KEY;
use loader_common::{Action, Error, LoaderConfig, RecordCodec, Result};
use stream_loader::dispatch::{DispatchConfig, Dispatcher};
use stream_loader::engine::{Engine, HttpEngine, NullEngine};
use stream_loader::sink::FileSink;
use stream_loader::source::{PtpQueueSource, PtpSourceConfig, Source, UrlSource};
use stream_loader::transport::memory::MemoryQueue;

/// Environment marker set on replicated worker processes.
const WORKER_PROCESS_ENV: &str = "SENZING_WORKER_PROCESS";

/// Command-line arguments for stream-loader
#[derive(Parser, Debug)]
#[command(name = "stream-loader")]
#[command(about = "Load an entity-resolution engine from a stream")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Options shared by every loading subcommand.
#[derive(Args, Debug, Clone)]
struct CommonArgs {
    /// Default DATA_SOURCE for records that lack one
    #[arg(long, env = "SENZING_DATA_SOURCE")]
    data_source: Option<String>,

    /// Default ENTITY_TYPE for records that lack one
    #[arg(long, env = "SENZING_ENTITY_TYPE")]
    entity_type: Option<String>,

    /// Base URL of the entity-resolution engine
    #[arg(long, env = "SENZING_ENGINE_URL")]
    engine_url: Option<String>,

    /// Internal work queue depth
    #[arg(long, default_value = "10", env = "SENZING_QUEUE_MAX")]
    queue_max: usize,

    /// Worker tasks per process
    #[arg(long, default_value = "4", env = "SENZING_THREADS_PER_PROCESS")]
    threads_per_process: usize,

    /// Number of worker processes
    #[arg(long, default_value = "1", env = "SENZING_PROCESSES")]
    processes: usize,

    /// Seconds between monitor reports
    #[arg(
        long,
        default_value = "600",
        env = "SENZING_MONITORING_PERIOD_IN_SECONDS"
    )]
    monitoring_period_in_seconds: u64,

    /// Retries for a transient failure before it escalates
    #[arg(long, default_value = "3", env = "SENZING_RETRY_LIMIT")]
    retry_limit: u32,

    /// Base seconds between retries
    #[arg(long, default_value = "1", env = "SENZING_RETRY_BACKOFF_IN_SECONDS")]
    retry_backoff_in_seconds: u64,

    /// JSON property carrying the per-record directive
    #[arg(long, default_value = DEFAULT_DIRECTIVE_KEY, env = "SENZING_DIRECTIVE_KEY")]
    directive_key: String,

    /// File receiving info payloads (JSON Lines)
    #[arg(long, env = "SENZING_INFO_SINK_FILE")]
    info_sink_file: Option<PathBuf>,

    /// File receiving failed records (JSON Lines)
    #[arg(long, env = "SENZING_FAILURE_SINK_FILE")]
    failure_sink_file: Option<PathBuf>,

    /// Treat a governor veto as fatal instead of skipping the record
    #[arg(long, env = "SENZING_GOVERNOR_FATAL")]
    governor_fatal: bool,

    /// Governor delays honored per record before the record is refused;
    /// unbounded when unset
    #[arg(long, env = "SENZING_GOVERNOR_DELAY_LIMIT")]
    governor_delay_limit: Option<u32>,

    /// Seconds between source heartbeats
    #[arg(long, default_value = "30", env = "SENZING_HEARTBEAT_IN_SECONDS")]
    heartbeat_in_seconds: u64,

    /// Seconds a shutdown waits for in-flight records
    #[arg(long, default_value = "30", env = "SENZING_SHUTDOWN_GRACE_IN_SECONDS")]
    shutdown_grace_in_seconds: u64,
}

#[derive(Args, Debug, Clone)]
struct KafkaArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Kafka bootstrap server
    #[arg(
        long,
        default_value = "localhost:9092",
        env = "SENZING_KAFKA_BOOTSTRAP_SERVER"
    )]
    kafka_bootstrap_server: String,

    /// Kafka consumer group
    #[arg(long, default_value = "senzing-kafka-group", env = "SENZING_KAFKA_GROUP")]
    kafka_group: String,

    /// Kafka topic
    #[arg(long, default_value = "senzing-kafka-topic", env = "SENZING_KAFKA_TOPIC")]
    kafka_topic: String,
}

#[derive(Args, Debug, Clone)]
struct RabbitmqArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// RabbitMQ host
    #[arg(long, default_value = "localhost:5672", env = "SENZING_RABBITMQ_HOST")]
    rabbitmq_host: String,

    /// RabbitMQ queue
    #[arg(
        long,
        default_value = "senzing-rabbitmq-queue",
        env = "SENZING_RABBITMQ_QUEUE"
    )]
    rabbitmq_queue: String,

    /// RabbitMQ username
    #[arg(long, default_value = "user", env = "SENZING_RABBITMQ_USERNAME")]
    rabbitmq_username: String,

    /// RabbitMQ password
    #[arg(long, default_value = "bitnami", env = "SENZING_RABBITMQ_PASSWORD")]
    rabbitmq_password: String,

    /// Per-channel prefetch count
    #[arg(long, default_value = "10", env = "SENZING_RABBITMQ_PREFETCH_COUNT")]
    rabbitmq_prefetch_count: u16,
}

#[derive(Args, Debug, Clone)]
struct SqsArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Queue URL
    #[arg(long, env = "SENZING_SQS_QUEUE_URL")]
    sqs_queue_url: String,

    /// Long-poll wait per receive
    #[arg(long, default_value = "20", env = "SENZING_SQS_WAIT_TIME_IN_SECONDS")]
    sqs_wait_time_in_seconds: u64,

    /// Visibility window requested for received messages
    #[arg(long, default_value = "300", env = "SENZING_SQS_VISIBILITY_IN_SECONDS")]
    sqs_visibility_in_seconds: u64,
}

#[derive(Args, Debug, Clone)]
struct PubsubArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Subscription to pull from
    #[arg(long, env = "SENZING_PUBSUB_SUBSCRIPTION")]
    pubsub_subscription: String,

    /// Lease extension applied on each heartbeat
    #[arg(long, default_value = "60", env = "SENZING_PUBSUB_LEASE_IN_SECONDS")]
    pubsub_lease_in_seconds: u64,
}

#[derive(Args, Debug, Clone)]
struct UrlArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// URL or file of JSON Lines; standard input when omitted
    #[arg(long, env = "SENZING_INPUT_URL")]
    input_url: Option<String>,
}

#[derive(Args, Debug, Clone)]
struct SleepArgs {
    /// Sleep time in seconds; 0 sleeps until a signal arrives
    #[arg(long, default_value = "0", env = "SENZING_SLEEP_TIME_IN_SECONDS")]
    sleep_time_in_seconds: u64,
}

#[derive(Args, Debug, Clone)]
struct AcceptanceArgs {
    #[command(flatten)]
    common: CommonArgs,

    /// Records pushed through the in-memory queue
    #[arg(long, default_value = "10")]
    records: usize,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read JSON records from a Kafka-like topic
    Kafka(KafkaArgs),
    /// Kafka input, forwarding info payloads to the info sink
    KafkaWithinfo(KafkaArgs),
    /// Read JSON records from a RabbitMQ queue
    Rabbitmq(RabbitmqArgs),
    /// RabbitMQ input, forwarding info payloads to the info sink
    RabbitmqWithinfo(RabbitmqArgs),
    /// Read JSON records from a point-to-point cloud queue
    Sqs(SqsArgs),
    /// Queue input, forwarding info payloads to the info sink
    SqsWithinfo(SqsArgs),
    /// Read JSON records from a pub/sub subscription
    Pubsub(PubsubArgs),
    /// Pub/sub input, forwarding info payloads to the info sink
    PubsubWithinfo(PubsubArgs),
    /// Read JSON records from a file, URL, or standard input
    Url(UrlArgs),
    /// File/URL input, forwarding info payloads to the info sink
    UrlWithinfo(UrlArgs),
    /// Do nothing but sleep; container testing aid
    Sleep(SleepArgs),
    /// Run the pipeline end to end against in-memory transports
    AcceptanceTest(AcceptanceArgs),
    /// Print version
    Version,
}

impl Command {
    fn common(&self) -> Option<&CommonArgs> {
        match self {
            Command::Kafka(a) | Command::KafkaWithinfo(a) => Some(&a.common),
            Command::Rabbitmq(a) | Command::RabbitmqWithinfo(a) => Some(&a.common),
            Command::Sqs(a) | Command::SqsWithinfo(a) => Some(&a.common),
            Command::Pubsub(a) | Command::PubsubWithinfo(a) => Some(&a.common),
            Command::Url(a) | Command::UrlWithinfo(a) => Some(&a.common),
            Command::Sleep(_) | Command::AcceptanceTest(_) | Command::Version => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Command::Kafka(_) => "kafka",
            Command::KafkaWithinfo(_) => "kafka-withinfo",
            Command::Rabbitmq(_) => "rabbitmq",
            Command::RabbitmqWithinfo(_) => "rabbitmq-withinfo",
            Command::Sqs(_) => "sqs",
            Command::SqsWithinfo(_) => "sqs-withinfo",
            Command::Pubsub(_) => "pubsub",
            Command::PubsubWithinfo(_) => "pubsub-withinfo",
            Command::Url(_) => "url",
            Command::UrlWithinfo(_) => "url-withinfo",
            Command::Sleep(_) => "sleep",
            Command::AcceptanceTest(_) => "acceptance-test",
            Command::Version => "version",
        }
    }
}

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "stream_loader=info,loader_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error!("{err}");
        error!("program terminated with error");
        std::process::exit(err.exit_code());
    }
}

async fn run(cli: Cli) -> Result<()> {
    // Replicate this invocation across worker processes when asked to.
    // The master process runs its own loader alongside the children.
    let mut children = Vec::new();
    if let Some(common) = cli.command.common() {
        let is_child = std::env::var_os(WORKER_PROCESS_ENV).is_some();
        if common.processes > 1 && !is_child {
            if matches!(cli.command, Command::Url(_) | Command::UrlWithinfo(_)) {
                return Err(Error::Config(format!(
                    "the url subcommand supports exactly 1 process; {} requested",
                    common.processes
                )));
            }
            children = spawn_worker_processes(common.processes - 1)?;
        }
    }

    let subcommand = cli.command.name();
    info!("{subcommand} is running");

    let result = match cli.command {
        Command::Kafka(args) => run_kafka(args, Action::Add).await,
        Command::KafkaWithinfo(args) => run_kafka(args, Action::AddWithInfo).await,
        Command::Rabbitmq(args) => run_rabbitmq(args, Action::Add).await,
        Command::RabbitmqWithinfo(args) => run_rabbitmq(args, Action::AddWithInfo).await,
        Command::Sqs(args) => run_sqs(args, Action::Add).await,
        Command::SqsWithinfo(args) => run_sqs(args, Action::AddWithInfo).await,
        Command::Pubsub(args) => run_pubsub(args, Action::Add).await,
        Command::PubsubWithinfo(args) => run_pubsub(args, Action::AddWithInfo).await,
        Command::Url(args) => run_url(args, Action::Add).await,
        Command::UrlWithinfo(args) => run_url(args, Action::AddWithInfo).await,
        Command::Sleep(args) => run_sleep(args).await,
        Command::AcceptanceTest(args) => run_acceptance(args).await,
        Command::Version => {
            println!("{}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    };

    let child_result = wait_for_children(children).await;
    result.and(child_result)
}

/// Re-exec this invocation `count` times with the worker marker set.
fn spawn_worker_processes(count: usize) -> Result<Vec<tokio::process::Child>> {
    let exe = std::env::current_exe()?;
    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut children = Vec::with_capacity(count);
    for i in 0..count {
        let child = tokio::process::Command::new(&exe)
            .args(&args)
            .env(WORKER_PROCESS_ENV, (i + 1).to_string())
            .spawn()
            .map_err(|err| Error::Internal(format!("spawning worker process: {err}")))?;
        children.push(child);
    }
    info!("spawned {count} worker processes");
    Ok(children)
}

async fn wait_for_children(children: Vec<tokio::process::Child>) -> Result<()> {
    let mut failed = 0usize;
    for mut child in children {
        match child.wait().await {
            Ok(status) if status.success() => {}
            Ok(status) => {
                warn!("worker process exited with {status}");
                failed += 1;
            }
            Err(err) => {
                warn!("waiting for worker process failed: {err}");
                failed += 1;
            }
        }
    }
    if failed > 0 {
        return Err(Error::Internal(format!("{failed} worker processes failed")));
    }
    Ok(())
}

/// Build the shared loader configuration from common arguments.
fn loader_config(common: &CommonArgs) -> Result<LoaderConfig> {
    let mut config = LoaderConfig {
        data_source: common.data_source.clone(),
        entity_type: common.entity_type.clone(),
        directive_key: common.directive_key.clone(),
        queue_depth: common.queue_max,
        threads_per_process: common.threads_per_process,
        processes: common.processes,
        retry_limit: common.retry_limit,
        retry_backoff: Duration::from_secs(common.retry_backoff_in_seconds),
        governor_fatal: common.governor_fatal,
        governor_delay_limit: common.governor_delay_limit,
        monitoring_period: Duration::from_secs(common.monitoring_period_in_seconds),
        heartbeat_interval: Duration::from_secs(common.heartbeat_in_seconds),
        shutdown_grace: Duration::from_secs(common.shutdown_grace_in_seconds),
        ..LoaderConfig::default()
    };
    config.fill_from_file();
    config.validate()?;
    Ok(config)
}

fn http_engine(common: &CommonArgs) -> Result<Arc<dyn Engine>> {
    let url = common.engine_url.as_deref().ok_or_else(|| {
        Error::Config("an engine URL is required (--engine-url or SENZING_ENGINE_URL)".to_string())
    })?;
    Ok(Arc::new(HttpEngine::new(url)))
}

/// Wire a dispatcher from the parsed configuration and run it.
async fn run_dispatch(
    source: Arc<dyn Source>,
    engine: Arc<dyn Engine>,
    common: &CommonArgs,
    config: LoaderConfig,
    default_action: Action,
) -> Result<()> {
    let codec = RecordCodec::new(
        config.directive_key.clone(),
        config.data_source.clone(),
        config.entity_type.clone(),
    );

    let mut dispatcher = Dispatcher::new(
        source,
        engine,
        codec,
        DispatchConfig::from_loader(&config, default_action),
    );
    if let Some(path) = &common.info_sink_file {
        dispatcher = dispatcher.with_info_sink(Arc::new(FileSink::create(path).await?));
    }
    if let Some(path) = &common.failure_sink_file {
        dispatcher = dispatcher.with_failure_sink(Arc::new(FileSink::create(path).await?));
    }

    let entry = json!({
        "data_source": config.data_source,
        "default_action": default_action.wire_name(),
        "directive_key": config.directive_key,
        "entity_type": config.entity_type,
        "queue_depth": config.queue_depth,
        "retry_limit": config.retry_limit,
        "start_time": chrono::Utc::now().to_rfc3339(),
        "workers": config.threads_per_process,
    });
    info!("enter: {entry}");

    let counters = dispatcher.counters();
    let result = stream_loader::run_loader(dispatcher).await;

    let exit = json!({
        "failed_records": counters.failed_records.load(Ordering::Relaxed),
        "processed_records": counters.processed_records.load(Ordering::Relaxed),
        "received_messages": counters.received_messages.load(Ordering::Relaxed),
        "stop_time": chrono::Utc::now().to_rfc3339(),
        "uptime": counters.uptime().as_secs(),
    });
    info!("exit: {exit}");
    result
}

/// The stock binary ships with the url and in-memory transports; broker
/// backends are bound by linking a wire client and running the matching
/// source adapter through `stream_loader::run_loader`.
fn unbound_backend(backend: &str, adapter: &str) -> Result<()> {
    Err(Error::Config(format!(
        "no {backend} wire client is linked into this build; \
         construct a {adapter} over your client library and run it via stream_loader::run_loader"
    )))
}

async fn run_kafka(args: KafkaArgs, _default_action: Action) -> Result<()> {
    let _config = loader_config(&args.common)?;
    info!(
        bootstrap_server = args.kafka_bootstrap_server,
        group = args.kafka_group,
        topic = args.kafka_topic,
        "kafka input configured"
    );
    unbound_backend("kafka", "source::TopicSource")
}

async fn run_rabbitmq(args: RabbitmqArgs, _default_action: Action) -> Result<()> {
    let _config = loader_config(&args.common)?;
    info!(
        host = args.rabbitmq_host,
        queue = args.rabbitmq_queue,
        username = args.rabbitmq_username,
        prefetch = args.rabbitmq_prefetch_count,
        "rabbitmq input configured"
    );
    unbound_backend("rabbitmq", "source::AmqpSource")
}

async fn run_sqs(args: SqsArgs, _default_action: Action) -> Result<()> {
    let _config = loader_config(&args.common)?;
    info!(
        queue_url = args.sqs_queue_url,
        wait = args.sqs_wait_time_in_seconds,
        visibility = args.sqs_visibility_in_seconds,
        "sqs input configured"
    );
    unbound_backend("sqs", "source::PtpQueueSource")
}

async fn run_pubsub(args: PubsubArgs, _default_action: Action) -> Result<()> {
    let _config = loader_config(&args.common)?;
    info!(
        subscription = args.pubsub_subscription,
        lease = args.pubsub_lease_in_seconds,
        "pubsub input configured"
    );
    unbound_backend("pubsub", "source::LeaseSource")
}

async fn run_url(args: UrlArgs, default_action: Action) -> Result<()> {
    let config = loader_config(&args.common)?;
    let engine = http_engine(&args.common)?;
    let source = Arc::new(UrlSource::open(args.input_url.as_deref()).await?);
    run_dispatch(source, engine, &args.common, config, default_action).await
}

async fn run_sleep(args: SleepArgs) -> Result<()> {
    if args.sleep_time_in_seconds == 0 {
        info!("sleeping infinitely");
        stream_loader::shutdown_signal().await;
    } else {
        info!("sleeping {} seconds", args.sleep_time_in_seconds);
        tokio::time::sleep(Duration::from_secs(args.sleep_time_in_seconds)).await;
    }
    Ok(())
}

/// End-to-end self check: seed an in-memory queue, run the full pipeline
/// with a null engine, and verify every message was acknowledged.
async fn run_acceptance(args: AcceptanceArgs) -> Result<()> {
    let config = loader_config(&args.common)?;

    let queue = MemoryQueue::new();
    for i in 0..args.records {
        queue.push(format!(r#"{{"DATA_SOURCE":"TEST","RECORD_ID":"{i}"}}"#));
    }
    let source = Arc::new(PtpQueueSource::new(
        queue,
        PtpSourceConfig {
            batch_size: 10,
            wait: Duration::from_millis(100),
            visibility: Duration::from_secs(30),
        },
    ));

    let codec = RecordCodec::new(
        config.directive_key.clone(),
        config.data_source.clone(),
        config.entity_type.clone(),
    );
    let dispatcher = Dispatcher::new(
        Arc::clone(&source) as Arc<dyn Source>,
        Arc::new(NullEngine),
        codec,
        DispatchConfig::from_loader(&config, Action::Add),
    );

    // A point-to-point queue never closes; stop once everything is terminal.
    let counters = dispatcher.counters();
    let shutdown = dispatcher.shutdown_token();
    let expected = args.records as u64;
    let watcher_counters = Arc::clone(&counters);
    tokio::spawn(async move {
        loop {
            let done = watcher_counters.processed_records.load(Ordering::Relaxed)
                + watcher_counters.failed_records.load(Ordering::Relaxed);
            if done >= expected {
                shutdown.cancel();
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    });

    Arc::new(dispatcher).run().await?;

    let processed = counters.processed_records.load(Ordering::Relaxed);
    let acknowledged = source.wire().deleted();
    if processed != expected || acknowledged != args.records {
        return Err(Error::Internal(format!(
            "acceptance test failed: processed {processed}/{expected}, acknowledged {acknowledged}"
        )));
    }
    info!("acceptance test passed: {processed} records loaded and acknowledged");
    Ok(())
}
