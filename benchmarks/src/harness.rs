use std::io::{self, Write};

use serde::Serialize;

use crate::config::Format;

/// Routes benchmark output: live text lines, or one JSON object per
/// measurement.
pub struct Reporter {
    format: Format,
    sink: io::Sink,
}

impl Reporter {
    pub fn new(format: Format) -> Self {
        Self {
            format,
            sink: io::sink(),
        }
    }

    /// Where the library writes its per-measurement text lines.
    pub fn lines<'a>(&'a mut self, out: &'a mut dyn Write) -> &'a mut dyn Write {
        match self.format {
            Format::Text => out,
            Format::Json => &mut self.sink,
        }
    }

    /// Text-only line: section titles and notices.
    pub fn text(&self, out: &mut dyn Write, line: &str) -> io::Result<()> {
        match self.format {
            Format::Text => writeln!(out, "{}", line),
            Format::Json => Ok(()),
        }
    }

    /// Ends a section; in JSON mode emits its records.
    pub fn finish<T: Serialize>(&self, out: &mut dyn Write, records: &[T]) -> io::Result<()> {
        match self.format {
            Format::Text => writeln!(out),
            Format::Json => {
                for record in records {
                    serde_json::to_writer(&mut *out, record).map_err(io::Error::from)?;
                    writeln!(out)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ze_types::PeakMeasurement;

    fn record() -> PeakMeasurement {
        PeakMeasurement {
            test: "global_bw".into(),
            variant: "float4".into(),
            value: 12.5,
            unit: "GBPS".into(),
        }
    }

    #[test]
    fn text_mode_passes_lines_through() {
        let mut reporter = Reporter::new(Format::Text);
        let mut out = Vec::new();
        reporter.text(&mut out, "Header").unwrap();
        writeln!(reporter.lines(&mut out), "line").unwrap();
        reporter.finish(&mut out, &[record()]).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "Header\nline\n\n");
    }

    #[test]
    fn json_mode_emits_only_records() {
        let mut reporter = Reporter::new(Format::Json);
        let mut out = Vec::new();
        reporter.text(&mut out, "Header").unwrap();
        writeln!(reporter.lines(&mut out), "line").unwrap();
        reporter.finish(&mut out, &[record(), record()]).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.lines().count(), 2);
        let value: serde_json::Value = serde_json::from_str(text.lines().next().unwrap()).unwrap();
        assert_eq!(value["variant"], "float4");
        assert_eq!(value["value"], 12.5);
    }
}
