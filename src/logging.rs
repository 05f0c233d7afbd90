//! JSON-lines logging for Kubernetes and CloudWatch consumers.
//!
//! Every record is one JSON object on stdout with a stable field set:
//! `timestamp`, `level`, `message`, `logger`, and an `extra_fields` object
//! carrying the event's structured fields. Operators alert on these shapes;
//! the field set must not drift between releases.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

use crate::config::LogLevel;

/// Renders tracing events as single-line JSON objects.
pub struct JsonLineFormatter;

impl<S, N> FormatEvent<S, N> for JsonLineFormatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let mut collector = FieldCollector::default();
        event.record(&mut collector);

        let mut record = Map::new();
        record.insert(
            "timestamp".into(),
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
        );
        record.insert(
            "level".into(),
            Value::String(event.metadata().level().to_string()),
        );
        record.insert("message".into(), Value::String(collector.message));
        record.insert(
            "logger".into(),
            Value::String(event.metadata().target().to_string()),
        );
        if !collector.fields.is_empty() {
            record.insert("extra_fields".into(), Value::Object(collector.fields));
        }

        writeln!(writer, "{}", Value::Object(record))
    }
}

/// Collects an event's fields: `message` becomes the log message, a
/// pre-serialized `extra_fields` payload is inlined, everything else lands
/// in the extra-fields object as a primitive.
#[derive(Default)]
struct FieldCollector {
    message: String,
    fields: Map<String, Value>,
}

impl FieldCollector {
    fn put(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }

    fn inline_extra(&mut self, raw: &str) {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(map)) => self.fields.extend(map),
            _ => {
                self.fields
                    .insert("extra_fields_raw".into(), Value::String(raw.to_string()));
            }
        }
    }
}

impl Visit for FieldCollector {
    fn record_f64(&mut self, field: &Field, value: f64) {
        self.put(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, Value::from(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "extra_fields" => self.inline_extra(value),
            _ => self.put(field, Value::String(value.to_string())),
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        let rendered = format!("{value:?}");
        match field.name() {
            "message" => self.message = rendered,
            "extra_fields" => self.inline_extra(&rendered),
            _ => self.put(field, Value::String(rendered)),
        }
    }
}

/// Install the JSON subscriber on stdout at the requested level.
pub fn setup_logging(level: LogLevel) {
    let filter = EnvFilter::new(level.as_filter());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(JsonLineFormatter)
        .with_writer(std::io::stdout)
        .init();
}

/// Log `message` with a serializable context object as `extra_fields`.
///
/// Counterpart to emitting individual fields on the macro: used where the
/// field set is dynamic (progress snapshots, final stats).
pub fn log_with_context<T: Serialize>(level: Level, message: &str, extra: &T) {
    let payload = serde_json::to_string(extra).unwrap_or_default();
    if level == Level::ERROR {
        tracing::error!(extra_fields = %payload, "{message}");
    } else if level == Level::WARN {
        tracing::warn!(extra_fields = %payload, "{message}");
    } else if level == Level::INFO {
        tracing::info!(extra_fields = %payload, "{message}");
    } else if level == Level::DEBUG {
        tracing::debug!(extra_fields = %payload, "{message}");
    } else {
        tracing::trace!(extra_fields = %payload, "{message}");
    }
}
