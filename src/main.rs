mod error;
mod harden;
mod listener;
mod logging;
mod packet;
mod socket;
mod template;
mod text;
mod util;

use std::path::Path;

use clap::{value_t, App, AppSettings, Arg, ArgMatches};
use colored::*;

use error::LogPingsError;
use harden::{Hardening, Os};
use listener::{Checked, Config, Service, Shutdown, DEFAULT_MAX_SIZE};
use logging::{Line, LogSink};
use packet::{IcmpPacket, IpHeader};
use template::{Template, DEFAULT_ICMP_TEMPLATE, DEFAULT_IP_TEMPLATE};
use text::Encoding;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_CHROOT: &str = "/tmp";
const DEFAULT_SETUID: &str = "nobody";

fn app() -> App<'static, 'static> {
    App::new("log-pings")
        .setting(AppSettings::ColoredHelp)
        .version(env!("CARGO_PKG_VERSION"))
        .about("Log incoming ICMP echo request messages to stdout and optionally into file.")
        .arg(Arg::with_name("host")
            .help("Address to listen on")
            .long("host")
            .value_name("IP")
            .default_value(DEFAULT_HOST))
        .arg(Arg::with_name("file")
            .help("File to write log to (log only to stdout by default)")
            .long("file")
            .value_name("LOGFILE"))
        .arg(Arg::with_name("format")
            .help("Log line format, fields in braces: {asctime} {ip} {icmp} {message}")
            .long("format")
            .value_name("TMPL")
            .default_value(logging::DEFAULT_FORMAT)
            .validator(|s| s.parse::<Template<Line>>().map(|_| ())))
        .arg(Arg::with_name("datefmt")
            .help("strftime format of the log timestamps")
            .long("datefmt")
            .value_name("TMPL")
            .default_value(logging::DEFAULT_DATEFMT)
            .validator(|s| logging::check_datefmt(&s)))
        .arg(Arg::with_name("ipfmt")
            .help("Log format of the IP header part, fields in braces (e.g. {src} {ident} {ttl} {hdr_checksum:x})")
            .long("ipfmt")
            .value_name("TMPL")
            .default_value(DEFAULT_IP_TEMPLATE)
            .validator(|s| s.parse::<Template<IpHeader>>().map(|_| ())))
        .arg(Arg::with_name("icmpfmt")
            .help("Log format of the ICMP header part, fields in braces (e.g. {ident} {seq_num} {size})")
            .long("icmpfmt")
            .value_name("TMPL")
            .default_value(DEFAULT_ICMP_TEMPLATE)
            .validator(|s| s.parse::<Template<IcmpPacket>>().map(|_| ())))
        .arg(Arg::with_name("setuid")
            .help("User to setuid to after binding")
            .long("setuid")
            .value_name("USER")
            .default_value(DEFAULT_SETUID))
        .arg(Arg::with_name("chroot")
            .help("Directory to chroot into after binding")
            .long("chroot")
            .value_name("DIR")
            .default_value(DEFAULT_CHROOT))
        .arg(Arg::with_name("no-hardening")
            .help("Don't give up privileges (ignore --setuid and --chroot)")
            .long("no-hardening"))
        .arg(Arg::with_name("encoding")
            .help("Try to decode messages with this encoding (utf-8, ascii, latin-1)")
            .long("encoding")
            .value_name("NAME")
            .default_value("utf-8")
            .validator(|s| s.parse::<Encoding>().map(|_| ())))
        .arg(Arg::with_name("max-size")
            .help("Byte limit for datagrams to accept, IP header included (Default 1500)")
            .long("max-size")
            .value_name("N")
            .validator(|s| match s.parse::<usize>() {
                Ok(n) if n > 0 => Ok(()),
                _ => Err(format!("need positive int: {}", s)),
            }))
        .arg(Arg::with_name("verbose")
            .help("Increase logging level to DEBUG")
            .long("verbose"))
}

fn run(matches: &ArgMatches) -> error::Result<()> {
    let format = value_t!(matches, "format", Template<Line>).unwrap_or_else(|e| e.exit());
    let encoding = value_t!(matches, "encoding", Encoding).unwrap_or_else(|e| e.exit());
    let ip_template = value_t!(matches, "ipfmt", Template<IpHeader>).unwrap_or_else(|e| e.exit());
    let icmp_template = value_t!(matches, "icmpfmt", Template<IcmpPacket>).unwrap_or_else(|e| e.exit());
    let max_size = match matches.value_of("max-size") {
        Some(_) => value_t!(matches, "max-size", usize).unwrap_or_else(|e| e.exit()),
        None => DEFAULT_MAX_SIZE,
    };

    logging::setup_logger(
        matches.value_of("file").map(Path::new),
        matches.is_present("verbose"),
        matches.value_of("datefmt").unwrap_or(logging::DEFAULT_DATEFMT),
        format,
    )?;

    let shutdown = Shutdown::default();
    let handle = shutdown.clone();
    ctrlc::set_handler(move || handle.request())?;

    let host = matches.value_of("host").unwrap_or(DEFAULT_HOST);
    let listen = util::resolve_host(host).map_err(|_| LogPingsError::Resolve(host.to_string()))?;

    let hardening = if matches.is_present("no-hardening") {
        None
    } else {
        let chroot = Path::new(matches.value_of("chroot").unwrap_or(DEFAULT_CHROOT));
        Some(Hardening::prepare(chroot, matches.value_of("setuid").unwrap_or(DEFAULT_SETUID))?)
    };

    let config = Config { listen, max_size, encoding, hardening };
    let sink = LogSink::new(ip_template, icmp_template);
    Service::new(config, Os, Checked, sink, shutdown).run()
}

fn main() {
    let matches = app().get_matches();

    if let Err(e) = run(&matches) {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}
