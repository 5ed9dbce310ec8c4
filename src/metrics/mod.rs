use prometheus::{
    Counter, CounterVec, Gauge, Histogram, HistogramOpts, Opts, Registry,
};
use std::sync::Arc;

use crate::contracts::Terminal;

pub mod server;

pub struct Metrics {
    pub deliveries_total: Counter,
    pub retries_total: Counter,
    pub messages_terminal_total: CounterVec,
    pub messages_lost_total: Counter,
    pub message_resolution_duration_seconds: Histogram,
    pub active_partitions: Gauge,
    pub registry: Registry,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let deliveries_total = Counter::new(
            "receiver_deliveries_total",
            "Total number of work items handed to the consumer, retries included",
        )?;

        let retries_total = Counter::new(
            "receiver_retries_total",
            "Total number of redeliveries scheduled after a nack",
        )?;

        let messages_terminal_total = CounterVec::new(
            Opts::new(
                "receiver_messages_terminal_total",
                "Total number of messages that reached a terminal outcome",
            ),
            &["outcome"],
        )?;

        let messages_lost_total = Counter::new(
            "receiver_messages_lost_total",
            "Total number of messages dropped because the dead-letter publish failed",
        )?;

        let message_resolution_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "receiver_message_resolution_duration_seconds",
                "Time from first delivery to terminal outcome, retries included",
            )
            .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )?;

        let active_partitions = Gauge::new(
            "receiver_active_partitions",
            "Number of partition workers currently running",
        )?;

        registry.register(Box::new(deliveries_total.clone()))?;
        registry.register(Box::new(retries_total.clone()))?;
        registry.register(Box::new(messages_terminal_total.clone()))?;
        registry.register(Box::new(messages_lost_total.clone()))?;
        registry.register(Box::new(message_resolution_duration_seconds.clone()))?;
        registry.register(Box::new(active_partitions.clone()))?;

        Ok(Arc::new(Self {
            deliveries_total,
            retries_total,
            messages_terminal_total,
            messages_lost_total,
            message_resolution_duration_seconds,
            active_partitions,
            registry,
        }))
    }

    pub fn record_terminal(&self, terminal: Terminal, elapsed_secs: f64) {
        self.messages_terminal_total
            .with_label_values(&[terminal.as_str()])
            .inc();
        if terminal == Terminal::Lost {
            self.messages_lost_total.inc();
        }
        self.message_resolution_duration_seconds.observe(elapsed_secs);
    }
}
