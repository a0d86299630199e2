use std::io::Write;

use crate::{error::SinkError, report::RunReport};

/// Destination of finished run reports.
pub trait ResultSink {
    /// Delivers `report`.
    fn write(&mut self, report: &RunReport) -> Result<(), SinkError>;
}

/// Writes each report as one pretty-printed JSON document.
#[derive(Debug)]
pub struct JsonSink<W> {
    writer: W,
}

impl<W: Write> JsonSink<W> {
    /// Wraps `writer`.
    pub const fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ResultSink for JsonSink<W> {
    fn write(&mut self, report: &RunReport) -> Result<(), SinkError> {
        serde_json::to_writer_pretty(&mut self.writer, report)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

impl ResultSink for Vec<RunReport> {
    fn write(&mut self, report: &RunReport) -> Result<(), SinkError> {
        self.push(report.clone());
        Ok(())
    }
}
