use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use chrono::format::{Item, StrftimeItems};
use chrono::{FixedOffset, Local, Utc};
use env_logger::{Builder, Target, WriteStyle};
use log::kv::Key;
use log::{debug, info, Level, LevelFilter, Record as LogRecord};

use crate::error::{LogPingsError, Result};
use crate::listener::{Ping, Record, Sink};
use crate::packet::{IcmpPacket, IpHeader};
use crate::template::{Fields, Template, Value};

pub const DEFAULT_DATEFMT: &str = "%b %d %H:%M:%S";
pub const DEFAULT_FORMAT: &str = "{asctime}{ip}{icmp} {message}";

pub fn check_datefmt(datefmt: &str) -> std::result::Result<(), String> {
    if StrftimeItems::new(datefmt).any(|item| matches!(item, Item::Error)) {
        return Err(format!("invalid datefmt: {}", datefmt));
    }
    Ok(())
}

/// The parts of a log line `--format` can arrange. Lines that are not
/// about a ping have empty `ip` and `icmp` parts.
#[derive(Debug)]
pub struct Line {
    asctime: String,
    ip: String,
    icmp: String,
    message: String,
}

impl Fields for Line {
    const NAMES: &'static [&'static str] = &["asctime", "ip", "icmp", "message"];

    fn field(&self, name: &str) -> Option<Value> {
        let text = match name {
            "asctime" => &self.asctime,
            "ip" => &self.ip,
            "icmp" => &self.icmp,
            "message" => &self.message,
            _ => return None,
        };
        Some(Value::Text(text.clone()))
    }
}

/// Renders records with the line format; stdout gets every line, the log
/// file only info and above.
struct LineWriter {
    format: Template<Line>,
    datefmt: String,
    // fixed here: after chroot the zoneinfo files are gone
    offset: FixedOffset,
    file: Option<Mutex<File>>,
}

impl LineWriter {
    fn new(format: Template<Line>, datefmt: &str, file: Option<File>) -> Self {
        LineWriter {
            format,
            datefmt: datefmt.to_string(),
            offset: *Local::now().offset(),
            file: file.map(Mutex::new),
        }
    }

    fn render(&self, record: &LogRecord) -> String {
        let kvs = record.key_values();
        let part = |key: &str| kvs.get(Key::from_str(key)).map(|v| v.to_string()).unwrap_or_default();

        self.format.render(&Line {
            asctime: Utc::now().with_timezone(&self.offset).format(&self.datefmt).to_string(),
            ip: part("ip"),
            icmp: part("icmp"),
            message: record.args().to_string(),
        })
    }

    fn write(&self, out: &mut dyn Write, record: &LogRecord) -> io::Result<()> {
        let line = self.render(record);
        writeln!(out, "{}", line)?;

        if record.level() <= Level::Info {
            if let Some(file) = &self.file {
                if let Ok(mut file) = file.lock() {
                    writeln!(file, "{}", line)?;
                    file.flush()?;
                }
            }
        }
        Ok(())
    }
}

pub fn setup_logger(file: Option<&Path>, verbose: bool, datefmt: &str, format: Template<Line>) -> Result<()> {
    let file = match file {
        Some(path) => Some(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| LogPingsError::LogFile { path: path.to_path_buf(), source })?,
        ),
        None => None,
    };
    let writer = LineWriter::new(format, datefmt, file);

    Builder::new()
        .filter_level(if verbose { LevelFilter::Debug } else { LevelFilter::Info })
        .format(move |buf, record| writer.write(buf, record))
        .write_style(WriteStyle::Never)
        .target(Target::Stdout)
        .try_init()?;

    Ok(())
}

/// Sends records to the `log` facade: pings at info, the rest at debug.
pub struct LogSink {
    ip_template: Template<IpHeader>,
    icmp_template: Template<IcmpPacket>,
}

impl LogSink {
    pub fn new(ip_template: Template<IpHeader>, icmp_template: Template<IcmpPacket>) -> Self {
        LogSink { ip_template, icmp_template }
    }
}

impl Sink for LogSink {
    fn write(&mut self, record: Record) {
        match record {
            Record::Ping(ping) => {
                let ip = self.ip_template.render(&ping.ip);
                let icmp = self.icmp_template.render(&ping.icmp);
                info!(ip:% = ip, icmp:% = icmp; "{}", ping.message);
                log_send_time(&ping);
            }
            Record::Dropped(e) => debug!("{}", e),
            Record::Oversized { size, max_size } => {
                debug!("OversizedDatagram: {} bytes exceed the limit of {}", size, max_size)
            }
        }
    }
}

fn log_send_time(ping: &Ping) {
    if let Some((timeval, sent)) = ping.sent.and_then(|tv| tv.to_datetime().map(|dt| (tv, dt))) {
        debug!("{}:{} sent at {} ({:?} timeval)",
            ping.ip.source(), ping.icmp.sequence, sent.to_rfc3339(), timeval.layout);
    }
}
