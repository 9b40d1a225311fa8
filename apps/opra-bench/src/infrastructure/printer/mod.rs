//! JSON Record Printer
//!
//! A [`RecordHandler`] writing one JSON object per record, newline
//! delimited, to any writer (stdout for `opra-sub --print`).

use std::io::{BufWriter, Write};

use serde::Serialize;

use crate::application::ports::{FragmentHeader, RecordHandler};
use crate::domain::market_data::Record;

#[derive(Serialize)]
struct Line<'a> {
    session_id: i32,
    stream_id: i32,
    #[serde(flatten)]
    record: &'a Record,
}

/// Writes records as JSON lines.
///
/// The first write failure is logged and disables further output; the
/// subscribe loop keeps running.
#[derive(Debug)]
pub struct JsonPrinter<W: Write> {
    out: BufWriter<W>,
    failed: bool,
}

impl<W: Write> JsonPrinter<W> {
    /// Print to `out`.
    pub fn new(out: W) -> Self {
        Self {
            out: BufWriter::new(out),
            failed: false,
        }
    }

    /// Flush buffered lines.
    ///
    /// # Errors
    ///
    /// Returns the writer's error.
    pub fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()
    }

    /// Flush and return the inner writer.
    ///
    /// # Errors
    ///
    /// Returns the writer's error if the final flush fails.
    pub fn into_inner(self) -> std::io::Result<W> {
        self.out.into_inner().map_err(std::io::IntoInnerError::into_error)
    }

    fn write_line(&mut self, header: &FragmentHeader, record: &Record) -> std::io::Result<()> {
        let line = Line {
            session_id: header.session_id,
            stream_id: header.stream_id,
            record,
        };
        serde_json::to_writer(&mut self.out, &line)?;
        self.out.write_all(b"\n")
    }
}

impl<W: Write> RecordHandler for JsonPrinter<W> {
    fn on_record(&mut self, header: &FragmentHeader, record: &Record) {
        if self.failed {
            return;
        }
        if let Err(e) = self.write_line(header, record) {
            tracing::error!(error = %e, "Record output failed, printing disabled");
            self.failed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::FrameFlags;
    use crate::domain::market_data::RecordTemplates;

    #[test]
    fn prints_one_json_line_per_record() {
        let header = FragmentHeader {
            session_id: 4,
            stream_id: 1001,
            flags: FrameFlags::UNFRAGMENTED,
        };
        let templates = RecordTemplates::default();
        let mut printer = JsonPrinter::new(Vec::new());
        printer.on_record(&header, &templates.record_for(0, 10));
        printer.on_record(&header, &templates.record_for(1, 11));

        let out = String::from_utf8(printer.into_inner().unwrap()).unwrap();
        let lines: Vec<serde_json::Value> = out
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["T"], "t");
        assert_eq!(lines[0]["session_id"], 4);
        assert_eq!(lines[0]["symbol"], "AAPL");
        assert_eq!(lines[0]["timestamp"], 10);
        assert_eq!(lines[1]["T"], "q");
        assert_eq!(lines[1]["stream_id"], 1001);
    }
}
