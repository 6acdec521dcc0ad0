//! JSON lines sink for local use and piping into other tools.

use super::{Publication, Sink, SinkError, SinkFuture};
use std::io::{self, Write};
use std::sync::{Mutex, PoisonError};

/// Writes one JSON object per line.
#[derive(Debug)]
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_line(&self, publication: &Publication) -> Result<(), SinkError> {
        let line = serde_json::to_string(publication)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{line}")?;
        writer.flush()?;
        Ok(())
    }
}

/// A sink writing to standard output.
pub fn stdout() -> JsonLinesSink<io::Stdout> {
    JsonLinesSink::new(io::stdout())
}

impl<W: Write + Send> Sink for JsonLinesSink<W> {
    fn publish<'a>(&'a self, publication: &'a Publication) -> SinkFuture<'a> {
        Box::pin(async move { self.write_line(publication) })
    }
}
