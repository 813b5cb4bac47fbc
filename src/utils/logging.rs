//! # Logging
//!
//! The runtime only produces log lines through `tracing`. Where they end up is
//! decided by a [`LogSink`], which receives one formatted line per event.

use crate::config::LoggingConfig;
use crate::error::{ProtocolError, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Layer, Registry};

/// Destination for formatted log lines
pub trait LogSink: Send + Sync {
    /// Receive one line, without the trailing newline
    fn write(&self, line: &str);
}

/// Writes lines to stdout
#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleSink;

impl LogSink for ConsoleSink {
    fn write(&self, line: &str) {
        let stdout = io::stdout();
        let mut lock = stdout.lock();
        let _ = writeln!(lock, "{line}");
    }
}

/// Appends lines to a file
#[derive(Debug)]
pub struct FileSink {
    file: Mutex<File>,
}

impl FileSink {
    pub fn open(path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open log file: {e}")))?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl LogSink for FileSink {
    fn write(&self, line: &str) {
        let mut file = match self.file.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = writeln!(file, "{line}");
    }
}

/// Fans one line out to several sinks
pub struct MultiSink(pub Vec<Arc<dyn LogSink>>);

impl LogSink for MultiSink {
    fn write(&self, line: &str) {
        for sink in &self.0 {
            sink.write(line);
        }
    }
}

/// Adapts a [`LogSink`] into a `tracing_subscriber` writer factory
#[derive(Clone)]
pub struct SinkMakeWriter {
    sink: Arc<dyn LogSink>,
}

impl SinkMakeWriter {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }
}

impl<'a> MakeWriter<'a> for SinkMakeWriter {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter {
            sink: Arc::clone(&self.sink),
            buf: Vec::with_capacity(256),
        }
    }
}

/// Buffers one event and hands it to the sink line by line
pub struct SinkWriter {
    sink: Arc<dyn LogSink>,
    buf: Vec<u8>,
}

impl SinkWriter {
    fn emit(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(&self.buf);
        for line in text.lines() {
            self.sink.write(line);
        }
        self.buf.clear();
    }
}

impl Write for SinkWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit();
        Ok(())
    }
}

impl Drop for SinkWriter {
    fn drop(&mut self) {
        self.emit();
    }
}

/// Build the sink described by the configuration
pub fn sink_from_config(config: &LoggingConfig) -> Result<Arc<dyn LogSink>> {
    let mut sinks: Vec<Arc<dyn LogSink>> = Vec::new();
    if config.log_to_console {
        sinks.push(Arc::new(ConsoleSink));
    }
    if config.log_to_file {
        let path = config.log_file_path.as_deref().ok_or_else(|| {
            ProtocolError::ConfigError("log_file_path must be set when log_to_file is true".into())
        })?;
        sinks.push(Arc::new(FileSink::open(path)?));
    }
    Ok(match sinks.len() {
        1 => sinks.remove(0),
        _ => Arc::new(MultiSink(sinks)),
    })
}

/// Install the global subscriber described by `config`
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let sink = sink_from_config(config)?;
    init_logging_with_sink(config, sink)
}

/// Install the global subscriber writing into `sink`.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging_with_sink(config: &LoggingConfig, sink: Arc<dyn LogSink>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::default().add_directive(LevelFilter::from_level(config.log_level).into())
    });

    let writer = SinkMakeWriter::new(sink);
    let layer: Box<dyn Layer<Registry> + Send + Sync> = if config.json_format {
        fmt::layer().json().with_writer(writer).boxed()
    } else {
        fmt::layer().with_ansi(false).with_writer(writer).boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(filter)
        .try_init()
        .map_err(|e| ProtocolError::ConfigError(format!("Failed to install logger: {e}")))?;

    tracing::info!(app = %config.app_name, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    impl LogSink for Collect {
        fn write(&self, line: &str) {
            if let Ok(mut lines) = self.0.lock() {
                lines.push(line.to_string());
            }
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_sink_receives_one_line_per_event() {
        let sink = Arc::new(Collect::default());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(SinkMakeWriter::new(sink.clone()))
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(msgque = 7, "connection closed");
            tracing::warn!("queue full");
        });

        let lines = sink.0.lock().unwrap();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("connection closed"));
        assert!(lines[0].contains("msgque=7"));
        assert!(!lines[1].ends_with('\n'));
    }

    #[test]
    fn test_file_sink_requires_path() {
        let config = LoggingConfig {
            log_to_file: true,
            log_file_path: None,
            ..LoggingConfig::default()
        };
        assert!(sink_from_config(&config).is_err());
    }
}
