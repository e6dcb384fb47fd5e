// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fmt::Debug,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{Event, Subscriber, field::Field};
use tracing_appender::{
    non_blocking::WorkerGuard,
    rolling::{RollingFileAppender, Rotation},
};
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{
        self, FmtContext, FormatEvent, FormatFields,
        format::{JsonFields, Writer},
        writer::BoxMakeWriter,
    },
    layer::SubscriberExt,
    registry::LookupSpan,
};

#[derive(Debug, Deserialize, Clone)]
struct LoggerConfig {
    logger: LogConfig,
}

#[derive(Debug, Deserialize, Clone)]
struct LogConfig {
    /// EnvFilter directive, e.g. `info` or `verbs_rpc_rs=debug`.
    level: String,
    output: LogOutput,
    /// Emit module path and line number of the call site.
    #[serde(default)]
    include_location: bool,
    #[serde(default)]
    file: Option<LogFileConfig>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(rename_all = "lowercase")]
enum LogOutput {
    Stdout,
    Stderr,
    File,
}

#[derive(Debug, Deserialize, Clone)]
struct LogFileConfig {
    path: String,
    #[serde(default)]
    roll: RollFrequency,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(rename_all = "lowercase")]
enum RollFrequency {
    Minutely,
    Hourly,
    Daily,
    #[default]
    Never,
}

impl RollFrequency {
    fn rotation(&self) -> Rotation {
        match self {
            Self::Minutely => Rotation::MINUTELY,
            Self::Hourly => Rotation::HOURLY,
            Self::Daily => Rotation::DAILY,
            Self::Never => Rotation::NEVER,
        }
    }
}

/// One JSON line per event, with the engine's correlation fields promoted to
/// top-level keys. Call sites attach `req_id`, `fn_id` and `slot_idx` as
/// structured fields; a log pipeline can then follow a single request across
/// submit, demux and dispatch without parsing message text.
struct RpcEventFormat {
    include_location: bool,
}

#[derive(Serialize)]
struct LogEntry {
    ts: String,
    level: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    req_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fn_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    slot_idx: Option<u64>,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    fields: serde_json::Map<String, serde_json::Value>,
}

/// Splits an event's fields into the promoted correlation keys, the human
/// message, and a catch-all map for everything else.
#[derive(Default)]
struct RpcFieldVisitor {
    message: Option<String>,
    req_id: Option<u64>,
    fn_id: Option<u64>,
    slot_idx: Option<u64>,
    extra: serde_json::Map<String, serde_json::Value>,
}

impl tracing::field::Visit for RpcFieldVisitor {
    fn record_u64(&mut self, field: &Field, value: u64) {
        match field.name() {
            "req_id" => self.req_id = Some(value),
            "fn_id" => self.fn_id = Some(value),
            "slot_idx" => self.slot_idx = Some(value),
            name => {
                self.extra.insert(name.to_string(), json!(value));
            },
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if let Ok(unsigned) = u64::try_from(value) {
            self.record_u64(field, unsigned);
        } else {
            self.extra.insert(field.name().to_string(), json!(value));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.extra.insert(field.name().to_string(), json!(value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.extra.insert(field.name().to_string(), json!(value));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(rendered);
        } else {
            self.extra.insert(field.name().to_string(), json!(rendered));
        }
    }
}

impl<S, N> FormatEvent<S, N> for RpcEventFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        _ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let mut visitor = RpcFieldVisitor::default();
        event.record(&mut visitor);

        let meta = event.metadata();
        let entry = LogEntry {
            ts: Utc::now().to_rfc3339(),
            level: meta.level().to_string(),
            module: self
                .include_location
                .then(|| meta.module_path().unwrap_or("").to_string()),
            line: if self.include_location {
                meta.line()
            } else {
                None
            },
            message: visitor.message,
            req_id: visitor.req_id,
            fn_id: visitor.fn_id,
            slot_idx: visitor.slot_idx,
            fields: visitor.extra,
        };

        writeln!(
            writer,
            "{}",
            serde_json::to_string(&entry).map_err(|_| std::fmt::Error)?
        )
    }
}

/// Install the global subscriber from a YAML `logger:` section. Returns the
/// guard keeping the non-blocking writer alive; hold it for the process
/// lifetime.
pub fn init_logger(config_path: &str) -> Result<WorkerGuard> {
    let raw = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read logger config: {config_path}"))?;
    let config: LoggerConfig = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse logger config: {config_path}"))?;
    let cfg = config.logger;

    let (writer, guard) = writer_for(&cfg)?;

    let env_filter = EnvFilter::try_new(&cfg.level)
        .or_else(|_| EnvFilter::try_from_default_env())
        .context("failed to parse log level from config or env")?;

    let json_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .json()
        .event_format(RpcEventFormat {
            include_location: cfg.include_location,
        })
        .fmt_fields(JsonFields::default());

    let subscriber = Registry::default().with(env_filter).with(json_layer);
    tracing::subscriber::set_global_default(subscriber)
        .context("failed to set global default subscriber")?;

    Ok(guard)
}

fn writer_for(cfg: &LogConfig) -> Result<(BoxMakeWriter, WorkerGuard)> {
    Ok(match cfg.output {
        LogOutput::Stdout => {
            let (w, g) = tracing_appender::non_blocking(std::io::stdout());
            (BoxMakeWriter::new(w), g)
        },
        LogOutput::Stderr => {
            let (w, g) = tracing_appender::non_blocking(std::io::stderr());
            (BoxMakeWriter::new(w), g)
        },
        LogOutput::File => {
            let fcfg = cfg
                .file
                .as_ref()
                .context("logger.file is required for output=file")?;
            let path = PathBuf::from(&fcfg.path);
            let dir = path.parent().unwrap_or_else(|| Path::new("."));

            let appender = RollingFileAppender::new(
                fcfg.roll.rotation(),
                dir,
                path.file_name().unwrap_or_default(),
            );
            let (w, g) = tracing_appender::non_blocking(appender);
            (BoxMakeWriter::new(w), g)
        },
    })
}
