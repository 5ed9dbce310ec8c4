use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

mod config;

use config::Config;
use retrying_receiver::messaging::{KafkaTransport, QueueReceiver};
use retrying_receiver::metrics::{server::start_metrics_server, Metrics};
use retrying_receiver::WorkItem;

/// Stand-in for application logic: acks JSON objects, nacks the rest.
struct JsonValidator;

impl JsonValidator {
    async fn run(self, mut items: mpsc::Receiver<WorkItem>) {
        while let Some(item) = items.recv().await {
            if self.accepts(item.payload(), item.attempt()) {
                item.ack();
            } else {
                item.nack();
            }
        }
        info!("Work item channel closed, validator stopped");
    }

    fn accepts(&self, data: &[u8], attempt: u32) -> bool {
        let payload = String::from_utf8_lossy(data);

        info!(
            attempt,
            payload_preview = %payload.chars().take(100).collect::<String>(),
            "Handling message"
        );

        // Test error simulation
        if payload.contains("\"fail\":\"transient\"") {
            return attempt > 0;
        }
        if payload.contains("\"fail\":\"permanent\"") {
            return false;
        }

        match serde_json::from_slice::<serde_json::Value>(data) {
            Ok(json) if json.is_object() => true,
            Ok(_) => {
                warn!("Payload is not a JSON object");
                false
            }
            Err(e) => {
                warn!(error = %e, "Invalid JSON payload");
                false
            }
        }
    }
}

#[tokio::main]
async fn main() {
    setup_panic_handler();
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    setup_logging(&config.rust_log);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        service_name = %config.service_name,
        "Retrying receiver starting"
    );

    let metrics = match Metrics::new() {
        Ok(metrics) => metrics,
        Err(e) => {
            eprintln!("Failed to create metrics: {}", e);
            std::process::exit(1);
        }
    };

    let metrics_clone = metrics.clone();
    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = start_metrics_server(metrics_clone, metrics_port).await {
            eprintln!("Metrics server error: {}", e);
        }
    });

    let client_id = format!("{}-{}", config.service_name, Uuid::new_v4());
    let transport = Arc::new(KafkaTransport::new(config.brokers.clone(), client_id));
    let receiver = QueueReceiver::new(transport, config.receiver_config()).with_metrics(metrics);

    let (outbound, items) = mpsc::channel(config.outbound_capacity);
    let validator = tokio::spawn(JsonValidator.run(items));

    let mut handle = match receiver.connect(outbound).await {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to connect receiver: {}", e);
            std::process::exit(1);
        }
    };

    info!(topic = %config.source_topic, "Ready to process messages");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            warn!("Shutdown signal received, cleaning up...");
        }
        result = handle.done() => {
            warn!(result = ?result, "Receiver stopped on its own");
        }
    }

    if let Err(e) = handle.shutdown().await {
        eprintln!("Error during shutdown: {}", e);
    }

    if let Err(e) = tokio::time::timeout(std::time::Duration::from_secs(5), validator).await {
        warn!(error = ?e, "Validator shutdown timeout");
    }

    info!("Retrying receiver stopped");
}

fn setup_logging(rust_log: &str) {
    let log_level = match rust_log.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Failed to set tracing subscriber: {}", e);
    }
}

fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|loc| format!("{}:{}:{}", loc.file(), loc.line(), loc.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        eprintln!("PANIC: {} at {}", message, location);
        eprintln!("Thread: {:?}", std::thread::current().name());
    }));
}
