//! Triage of errors surfaced by the rdkafka client.
//!
//! Both the primary reader and the watermark tracker read from Kafka; they
//! share this classification so a transport hiccup is treated the same way
//! on either side. What differs is the reaction: the primary reader returns
//! fatal errors to its caller, the tracker logs them and keeps going.

use std::time::Duration;

use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use tracing::{error, info, warn};

use crate::metrics_consts::KAFKA_ERRORS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Expected during normal operation, nothing to do
    Benign,
    /// Worth retrying after a short backoff
    Transient,
    /// The client cannot make progress
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KafkaErrorClass {
    pub severity: ErrorSeverity,
    pub label: &'static str,
}

impl KafkaErrorClass {
    fn new(severity: ErrorSeverity, label: &'static str) -> Self {
        Self { severity, label }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == ErrorSeverity::Fatal
    }
}

pub fn classify(e: &KafkaError) -> KafkaErrorClass {
    match e {
        KafkaError::MessageConsumption(code) => match code {
            RDKafkaErrorCode::PartitionEOF => {
                KafkaErrorClass::new(ErrorSeverity::Benign, "partition_eof")
            }
            RDKafkaErrorCode::OperationTimedOut => {
                KafkaErrorClass::new(ErrorSeverity::Benign, "op_timed_out")
            }
            RDKafkaErrorCode::OffsetOutOfRange => {
                KafkaErrorClass::new(ErrorSeverity::Transient, "offset_out_of_range")
            }
            _ => KafkaErrorClass::new(ErrorSeverity::Transient, "consumer"),
        },
        KafkaError::MessageConsumptionFatal(_) => {
            KafkaErrorClass::new(ErrorSeverity::Fatal, "consumer")
        }
        KafkaError::Global(code) => match code {
            RDKafkaErrorCode::AllBrokersDown => {
                KafkaErrorClass::new(ErrorSeverity::Transient, "all_brokers_down")
            }
            RDKafkaErrorCode::BrokerTransportFailure => {
                KafkaErrorClass::new(ErrorSeverity::Transient, "broker_transport")
            }
            RDKafkaErrorCode::Authentication => {
                KafkaErrorClass::new(ErrorSeverity::Fatal, "authentication")
            }
            _ => KafkaErrorClass::new(ErrorSeverity::Transient, "global"),
        },
        KafkaError::Canceled => KafkaErrorClass::new(ErrorSeverity::Fatal, "canceled"),
        _ => KafkaErrorClass::new(ErrorSeverity::Transient, "unexpected"),
    }
}

/// Log and count a Kafka error on behalf of `component`, returning its class.
pub fn record_kafka_error(component: &'static str, e: &KafkaError) -> KafkaErrorClass {
    let class = classify(e);
    let level = match class.severity {
        ErrorSeverity::Benign => {
            info!(component, error = class.label, "Kafka consumer notice: {e}");
            "info"
        }
        ErrorSeverity::Transient => {
            warn!(component, error = class.label, "Kafka consumer error: {e}");
            "warn"
        }
        ErrorSeverity::Fatal => {
            error!(component, error = class.label, "Fatal Kafka consumer error: {e}");
            "fatal"
        }
    };

    metrics::counter!(
        KAFKA_ERRORS,
        &[
            ("component", component),
            ("level", level),
            ("error", class.label),
        ]
    )
    .increment(1);

    class
}

/// Backoff before the next read after `consecutive_errors` failures in a row.
pub fn retry_backoff(class: KafkaErrorClass, consecutive_errors: u64) -> Duration {
    match class.label {
        "all_brokers_down" => Duration::from_secs(consecutive_errors.min(5)),
        "broker_transport" => Duration::from_secs(consecutive_errors.min(3)),
        "offset_out_of_range" => Duration::from_millis(500),
        _ if class.severity == ErrorSeverity::Benign => Duration::ZERO,
        _ => Duration::from_millis(100 * consecutive_errors.min(10)),
    }
}
