use std::io::Write as _;
use std::path::PathBuf;

use csv_core::WriteResult;

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum Format {
    Table,
    Jsonl,
    Csv,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("could not open the specified output file at {1:?}")]
    OpenOutputFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the output file at {1:?}")]
    WriteFile(#[source] std::io::Error, PathBuf),
    #[error("could not write data to the terminal")]
    WriteStdout(#[source] std::io::Error),
    #[error("could not serialize the output to JSON")]
    SerializeJson(#[source] serde_json::Error),
}

/// Where the output goes: the terminal, or a file truncated on open.
pub struct Destination {
    path: Option<PathBuf>,
    io: Box<dyn std::io::Write>,
}

impl Destination {
    pub fn open(path: Option<PathBuf>) -> Result<Self, Error> {
        let io = match &path {
            None => Box::new(std::io::stdout().lock()) as Box<_>,
            Some(path) => Box::new(
                std::fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(path)
                    .map_err(|e| Error::OpenOutputFile(e, path.clone()))?,
            ) as Box<_>,
        };
        Ok(Self { path, io })
    }

    #[cfg(test)]
    fn buffer(buffer: std::rc::Rc<std::cell::RefCell<Vec<u8>>>) -> Self {
        struct Shared(std::rc::Rc<std::cell::RefCell<Vec<u8>>>);
        impl std::io::Write for Shared {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.borrow_mut().write(buf)
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        Self { path: None, io: Box::new(Shared(buffer)) }
    }

    fn write_error(&self, e: std::io::Error) -> Error {
        match &self.path {
            None => Error::WriteStdout(e),
            Some(p) => Error::WriteFile(e, p.clone()),
        }
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.io.write_all(bytes).map_err(|e| self.write_error(e))
    }

    /// Write a single JSON document followed by a newline.
    pub fn json<R: serde::Serialize>(&mut self, record: &R, pretty: bool) -> Result<(), Error> {
        let bytes = if pretty {
            serde_json::to_vec_pretty(record)
        } else {
            serde_json::to_vec(record)
        };
        let mut bytes = bytes.map_err(Error::SerializeJson)?;
        bytes.push(b'\n');
        self.write_all(&bytes)
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        self.io.flush().map_err(|e| self.write_error(e))
    }
}

/// A listing of uniform rows, rendered as a table, JSON lines or CSV.
pub struct Listing {
    destination: Destination,
    formatter: Formatter,
}

enum Formatter {
    Csv { written_records: bool },
    Table { comfy: comfy_table::Table },
    Jsonl,
}

impl Listing {
    pub fn new(destination: Destination, format: Format) -> Self {
        let formatter = match format {
            Format::Table => {
                let mut comfy = comfy_table::Table::new();
                comfy.set_content_arrangement(comfy_table::ContentArrangement::Dynamic);
                Formatter::Table { comfy }
            }
            Format::Jsonl => Formatter::Jsonl,
            Format::Csv => Formatter::Csv { written_records: false },
        };
        Listing { destination, formatter }
    }

    pub fn table_headers(&mut self, hdrs: Vec<&'static str>) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records } => {
                if *written_records {
                    panic!("table headers for csv must be written very first!");
                }
                *written_records = true;
                self.write_csv_row(&hdrs)?;
            }
            Formatter::Table { comfy } => {
                comfy.set_header(hdrs);
            }
            Formatter::Jsonl => {}
        }
        Ok(())
    }

    fn write_csv_row<V: std::ops::Deref<Target = str>>(
        &mut self,
        values: &[V],
    ) -> Result<(), Error> {
        // Worst case every byte is a quote that needs escaping, plus the enclosing quotes.
        let max_len = 2 + 2 * values.iter().map(|v| v.len()).max().unwrap_or(0);
        let mut output = vec![0; max_len];
        let mut writer = csv_core::Writer::new();
        let mut line = Vec::new();
        for (index, value) in values.iter().enumerate() {
            if index != 0 {
                let (WriteResult::InputEmpty, ob) = writer.delimiter(&mut output) else {
                    panic!("something wrong with csv output");
                };
                line.extend_from_slice(&output[..ob]);
            }
            let inp = value.as_bytes();
            let (WriteResult::InputEmpty, ib, ob) = writer.field(inp, &mut output) else {
                panic!("something wrong with csv output");
            };
            assert_eq!(value.len(), ib);
            line.extend_from_slice(&output[..ob]);
        }
        let (WriteResult::InputEmpty, ob) = writer.terminator(&mut output) else {
            panic!("something wrong with csv output");
        };
        line.extend_from_slice(&output[..ob]);
        self.destination.write_all(&line)
    }

    pub fn row<R: serde::Serialize>(
        &mut self,
        table_row: impl FnOnce() -> Vec<String>,
        serde_record: impl FnOnce() -> R,
    ) -> Result<(), Error> {
        match &mut self.formatter {
            Formatter::Csv { written_records } => {
                *written_records = true;
                let values = table_row();
                self.write_csv_row(&values)?;
            }
            Formatter::Table { comfy } => {
                comfy.add_row(table_row());
            }
            Formatter::Jsonl => {
                self.destination.json(&serde_record(), false)?;
            }
        }
        Ok(())
    }

    pub fn commit(mut self) -> Result<(), Error> {
        if let Formatter::Table { comfy } = &self.formatter {
            let rendered = format!("{comfy}\n");
            self.destination.write_all(rendered.as_bytes())?;
        }
        self.destination.flush()
    }
}
