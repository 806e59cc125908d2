//! One-JSON-object-per-line log output.
//!
//! Envelope: `timestamp, level, module, function_name, line_num, message`, where `message` is
//! an object holding the event's fields (`event_type` plus context such as `run_id`).

use serde_json::{Map, Value};
use std::fmt::{self, Write as _};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::{FmtContext, FormatEvent, FormatFields};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::EnvFilter;

#[derive(Default)]
struct JsonFields(Map<String, Value>);

impl Visit for JsonFields {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0
            .insert(field.name().to_string(), Value::String(value.to_string()));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.0.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.0.insert(field.name().to_string(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.0.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.0.insert(field.name().to_string(), value.into());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(
            field.name().to_string(),
            Value::String(format!("{value:?}")),
        );
    }
}

/// `FormatEvent` producing the fixed JSON envelope.
pub struct JsonEnvelope;

impl<S, N> FormatEvent<S, N> for JsonEnvelope
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let meta = event.metadata();
        let mut fields = JsonFields::default();
        event.record(&mut fields);

        // Instrumented functions open a span named after themselves.
        let function_name = ctx
            .event_scope()
            .and_then(|mut scope| scope.next())
            .map(|span| span.name().to_string());

        let mut line = Map::new();
        line.insert(
            "timestamp".into(),
            OffsetDateTime::now_utc()
                .format(&Rfc3339)
                .unwrap_or_else(|_| "now".into())
                .into(),
        );
        line.insert("level".into(), meta.level().as_str().into());
        line.insert(
            "module".into(),
            meta.module_path().unwrap_or(meta.target()).into(),
        );
        line.insert(
            "function_name".into(),
            function_name.map(Value::String).unwrap_or(Value::Null),
        );
        line.insert(
            "line_num".into(),
            meta.line().map(Value::from).unwrap_or(Value::Null),
        );
        line.insert("message".into(), Value::Object(fields.0));
        writeln!(writer, "{}", Value::Object(line))
    }
}

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,{}={level}", env!("CARGO_CRATE_NAME"))))
}

/// Install the global subscriber. `RUST_LOG` overrides `level`.
pub fn init(level: &str) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .event_format(JsonEnvelope)
        .with_env_filter(filter(level))
        .with_writer(std::io::stdout)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to install log subscriber: {e}"))
}
