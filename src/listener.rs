use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, error, info};

use crate::error::{DecodeError, LogPingsError, Result};
use crate::harden::{self, Hardening, Platform};
use crate::packet::{IcmpPacket, IpHeader, Timeval, IPPROTO_ICMP};
use crate::socket::{Datagrams, Waker};
use crate::text::Encoding;

/// Ethernet MTU
pub const DEFAULT_MAX_SIZE: usize = 1500;

const PROGRAM: &str = env!("CARGO_PKG_NAME");

pub struct Config {
    pub listen: Ipv4Addr,
    /// Largest datagram, IP header included, that is looked at.
    pub max_size: usize,
    pub encoding: Encoding,
    pub hardening: Option<Hardening>,
}

#[derive(Default)]
struct ShutdownState {
    requested: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

/// Stop request shared between the signal handler and the serving loop.
#[derive(Clone, Default)]
pub struct Shutdown {
    state: Arc<ShutdownState>,
}

impl Shutdown {
    pub fn request(&self) {
        self.state.requested.store(true, Ordering::SeqCst);
        if let Ok(waker) = self.state.waker.lock() {
            if let Some(wake) = waker.as_ref() {
                wake();
            }
        }
    }

    pub fn is_requested(&self) -> bool {
        self.state.requested.load(Ordering::SeqCst)
    }

    fn wake_with(&self, waker: Waker) {
        if let Ok(mut slot) = self.state.waker.lock() {
            *slot = Some(waker);
        }
    }
}

/// An echo request worth a log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ping {
    pub ip: IpHeader,
    pub icmp: IcmpPacket,
    pub message: String,
    pub sent: Option<Timeval>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Ping(Ping),
    Dropped(DecodeError),
    Oversized { size: usize, max_size: usize },
}

pub trait Sink {
    fn write(&mut self, record: Record);
}

pub trait Decode {
    fn ip_header(&mut self, bytes: &[u8]) -> std::result::Result<IpHeader, DecodeError>;
    fn icmp_packet(&mut self, bytes: &[u8]) -> std::result::Result<IcmpPacket, DecodeError>;
}

/// Decoding with checksum verification.
#[derive(Debug, Clone, Copy, Default)]
pub struct Checked;

impl Decode for Checked {
    fn ip_header(&mut self, bytes: &[u8]) -> std::result::Result<IpHeader, DecodeError> {
        IpHeader::from_bytes(bytes)
    }

    fn icmp_packet(&mut self, bytes: &[u8]) -> std::result::Result<IcmpPacket, DecodeError> {
        IcmpPacket::from_bytes(bytes)
    }
}

/// The serving loop: one datagram at a time, nothing kept between them.
pub struct Listener<S, D, K> {
    socket: S,
    decoder: D,
    sink: K,
    encoding: Encoding,
    shutdown: Shutdown,
    buf: Vec<u8>,
}

impl<S: Datagrams, D: Decode, K: Sink> Listener<S, D, K> {
    pub fn new(socket: S, decoder: D, sink: K, max_size: usize, encoding: Encoding, shutdown: Shutdown) -> Self {
        Listener {
            socket,
            decoder,
            sink,
            encoding,
            shutdown,
            buf: vec![0; max_size],
        }
    }

    /// Runs until shutdown is requested (`Ok`) or the socket fails.
    pub fn serve(&mut self) -> Result<()> {
        loop {
            if self.shutdown.is_requested() {
                return Ok(());
            }

            let size = match self.socket.recv(&mut self.buf) {
                Ok(size) => size,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(LogPingsError::Receive(e)),
            };

            // whatever arrived together with the signal is not looked at
            if self.shutdown.is_requested() {
                return Ok(());
            }

            if let Some(record) = self.inspect(size) {
                self.sink.write(record);
            }
        }
    }

    fn inspect(&mut self, size: usize) -> Option<Record> {
        if size > self.buf.len() {
            return Some(Record::Oversized { size, max_size: self.buf.len() });
        }
        match self.classify(size) {
            Ok(ping) => ping.map(Record::Ping),
            Err(e) => Some(Record::Dropped(e)),
        }
    }

    fn classify(&mut self, size: usize) -> std::result::Result<Option<Ping>, DecodeError> {
        let datagram = &self.buf[..size];

        let ip = self.decoder.ip_header(datagram)?;
        if ip.protocol != IPPROTO_ICMP {
            return Ok(None);
        }

        let icmp = self.decoder.icmp_packet(datagram.get(IpHeader::LEN..).unwrap_or_default())?;
        if !icmp.is_echo_request() {
            return Ok(None);
        }

        let message = self.encoding.decode_or_escape(&icmp.payload);
        let sent = icmp.timestamp();
        Ok(Some(Ping { ip, icmp, message, sent }))
    }
}

/// Bind, optionally harden, serve, close. Each step runs at most once and
/// the socket is closed on every way out.
pub struct Service<P, D, K> {
    config: Config,
    platform: P,
    decoder: D,
    sink: K,
    shutdown: Shutdown,
}

impl<P: Platform, D: Decode, K: Sink> Service<P, D, K> {
    pub fn new(config: Config, platform: P, decoder: D, sink: K, shutdown: Shutdown) -> Self {
        Service { config, platform, decoder, sink, shutdown }
    }

    pub fn run(self) -> Result<()> {
        let Service { config, mut platform, decoder, sink, shutdown } = self;

        info!("{} listening on '{}'", PROGRAM, config.listen);
        let socket = platform.bind(config.listen).map_err(|source| LogPingsError::Bind {
            addr: config.listen.to_string(),
            source,
        })?;
        shutdown.wake_with(socket.waker());

        if let Some(plan) = &config.hardening {
            harden::drop_privileges(&mut platform, plan)?;
        }

        debug!("serve_forever(max_size={}, encoding={})", config.max_size, config.encoding);
        let mut listener = Listener::new(socket, decoder, sink, config.max_size, config.encoding, shutdown);
        let outcome = listener.serve();
        drop(listener);

        match &outcome {
            Ok(()) => info!("{} exiting (received termination signal)", PROGRAM),
            Err(e) => error!("{} exiting ({})", PROGRAM, e),
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io;
    use std::path::{Path, PathBuf};

    use crate::error::ChecksumError;
    use crate::harden::Account;

    const MSG: &[u8] = b"abcdefghijklmnopqrstuvwabcdefghi";

    enum Step {
        Datagram(Vec<u8>),
        /// The signal lands while this datagram is being received.
        SignalWith(Vec<u8>),
        Fail(ErrorKind),
    }

    /// Replays scripted steps, then behaves like a socket woken by shutdown.
    struct FakeSocket {
        steps: VecDeque<Step>,
        shutdown: Shutdown,
        recv_calls: usize,
        closed: Arc<AtomicBool>,
    }

    impl FakeSocket {
        fn new(steps: Vec<Step>, shutdown: &Shutdown) -> Self {
            FakeSocket {
                steps: steps.into(),
                shutdown: shutdown.clone(),
                recv_calls: 0,
                closed: Arc::new(AtomicBool::new(false)),
            }
        }

        fn fill(buf: &mut [u8], datagram: &[u8]) -> usize {
            let n = datagram.len().min(buf.len());
            buf[..n].copy_from_slice(&datagram[..n]);
            datagram.len()
        }
    }

    impl Datagrams for FakeSocket {
        fn recv(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.recv_calls += 1;
            match self.steps.pop_front() {
                Some(Step::Datagram(datagram)) => Ok(Self::fill(buf, &datagram)),
                Some(Step::SignalWith(datagram)) => {
                    self.shutdown.request();
                    Ok(Self::fill(buf, &datagram))
                }
                Some(Step::Fail(kind)) => Err(io::Error::new(kind, "scripted failure")),
                None => {
                    self.shutdown.request();
                    Ok(0)
                }
            }
        }
    }

    impl Drop for FakeSocket {
        fn drop(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct CountingDecoder {
        ip_calls: usize,
        icmp_calls: usize,
    }

    impl Decode for CountingDecoder {
        fn ip_header(&mut self, bytes: &[u8]) -> std::result::Result<IpHeader, DecodeError> {
            self.ip_calls += 1;
            Checked.ip_header(bytes)
        }

        fn icmp_packet(&mut self, bytes: &[u8]) -> std::result::Result<IcmpPacket, DecodeError> {
            self.icmp_calls += 1;
            Checked.icmp_packet(bytes)
        }
    }

    impl Sink for Vec<Record> {
        fn write(&mut self, record: Record) {
            self.push(record);
        }
    }

    fn datagram_with(ip: IpHeader, icmp: &IcmpPacket) -> Vec<u8> {
        let mut bytes = ip.encode().to_vec();
        bytes.extend_from_slice(&icmp.encode());
        bytes
    }

    fn echo_datagram(payload: &[u8]) -> Vec<u8> {
        let icmp = IcmpPacket::echo_request(255, 42, payload);
        let ip = IpHeader::for_icmp(
            Ipv4Addr::new(127, 0, 0, 2),
            Ipv4Addr::new(127, 0, 0, 1),
            15,
            IcmpPacket::HEADER_LEN + payload.len(),
        );
        datagram_with(ip, &icmp)
    }

    type TestListener = Listener<FakeSocket, CountingDecoder, Vec<Record>>;

    fn listener(steps: Vec<Step>, max_size: usize, encoding: Encoding) -> TestListener {
        let shutdown = Shutdown::default();
        let socket = FakeSocket::new(steps, &shutdown);
        Listener::new(socket, CountingDecoder::default(), Vec::new(), max_size, encoding, shutdown)
    }

    fn serve(steps: Vec<Step>) -> TestListener {
        let mut listener = listener(steps, DEFAULT_MAX_SIZE, Encoding::Utf8);
        listener.serve().unwrap();
        listener
    }

    fn messages(records: &[Record]) -> Vec<&str> {
        records
            .iter()
            .filter_map(|record| match record {
                Record::Ping(ping) => Some(ping.message.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn echo_request_is_recorded() {
        let listener = serve(vec![Step::Datagram(echo_datagram(b"hello"))]);

        assert_eq!(listener.sink.len(), 1);
        match &listener.sink[0] {
            Record::Ping(ping) => {
                assert_eq!(ping.ip.source().to_string(), "127.0.0.2");
                assert_eq!(ping.ip.ident, 15);
                assert_eq!(ping.icmp.identifier, 255);
                assert_eq!(ping.icmp.sequence, 42);
                assert_eq!(ping.message, "hello");
                assert_eq!(ping.sent, None);
            }
            other => panic!("unexpected record {:?}", other),
        }
    }

    #[test]
    fn bad_checksums_are_dropped_and_serving_continues() {
        let mut bad_ip = echo_datagram(MSG);
        bad_ip[10] = 0;
        bad_ip[11] = 0;

        let mut bad_icmp = echo_datagram(b"abcde");
        bad_icmp[23] ^= 0x01;

        let listener = serve(vec![
            Step::Datagram(echo_datagram(MSG)),
            Step::Datagram(bad_ip),
            Step::Datagram(bad_icmp),
            Step::Datagram(echo_datagram(b"abcde")),
        ]);

        let records = &listener.sink;
        assert_eq!(messages(records), vec!["abcdefghijklmnopqrstuvwabcdefghi", "abcde"]);
        assert_eq!(
            records[1],
            Record::Dropped(DecodeError::InvalidChecksum(ChecksumError { found: 0, expected: 0x92af }))
        );
        assert_eq!(
            records[2],
            Record::Dropped(DecodeError::InvalidChecksum(ChecksumError { found: 0xcd0e, expected: 0xcd0f }))
        );
        assert_eq!(listener.decoder.icmp_calls, 3);
    }

    #[test]
    fn oversized_datagrams_never_reach_a_decoder() {
        let mut listener = listener(vec![Step::Datagram(echo_datagram(&[b'x'; 100]))], 64, Encoding::Utf8);
        listener.serve().unwrap();

        assert_eq!(listener.sink, vec![Record::Oversized { size: 128, max_size: 64 }]);
        assert_eq!(listener.decoder.ip_calls, 0);
        assert_eq!(listener.decoder.icmp_calls, 0);
    }

    #[test]
    fn datagram_of_exactly_max_size_is_decoded() {
        let datagram = echo_datagram(b"hello");
        let mut listener = listener(vec![Step::Datagram(datagram.clone())], datagram.len(), Encoding::Utf8);
        listener.serve().unwrap();
        assert_eq!(messages(&listener.sink), vec!["hello"]);
    }

    #[test]
    fn non_icmp_datagrams_skip_the_icmp_decoder() {
        let icmp = IcmpPacket::echo_request(1, 1, b"not really icmp");
        let mut ip = IpHeader::for_icmp(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, 7, icmp.encode().len());
        ip.protocol = 17;
        let ip = ip.with_checksum();

        let listener = serve(vec![Step::Datagram(datagram_with(ip, &icmp))]);

        assert!(listener.sink.is_empty());
        assert_eq!(listener.decoder.ip_calls, 1);
        assert_eq!(listener.decoder.icmp_calls, 0);
    }

    #[test]
    fn other_icmp_messages_are_silently_ignored() {
        let reply = IcmpPacket { message_type: 0, ..IcmpPacket::echo_request(1, 1, b"pong") }.with_checksum();
        let unreachable = IcmpPacket { message_type: 3, code: 1, ..IcmpPacket::echo_request(1, 1, b"") }.with_checksum();
        let odd_code = IcmpPacket { code: 1, ..IcmpPacket::echo_request(1, 1, b"ping") }.with_checksum();

        let steps = [reply, unreachable, odd_code]
            .iter()
            .map(|icmp| {
                let ip = IpHeader::for_icmp(Ipv4Addr::LOCALHOST, Ipv4Addr::LOCALHOST, 1, icmp.encode().len());
                Step::Datagram(datagram_with(ip, icmp))
            })
            .collect();
        let listener = serve(steps);

        assert!(listener.sink.is_empty());
        assert_eq!(listener.decoder.icmp_calls, 3);
    }

    #[test]
    fn truncated_datagrams_are_malformed() {
        let datagram = echo_datagram(b"");
        let listener = serve(vec![
            Step::Datagram(datagram[..12].to_vec()),
            Step::Datagram(datagram[..IpHeader::LEN].to_vec()),
        ]);

        assert_eq!(
            listener.sink,
            vec![
                Record::Dropped(DecodeError::Malformed { what: "IP header", needed: 20, got: 12 }),
                Record::Dropped(DecodeError::Malformed { what: "ICMP header", needed: 8, got: 0 }),
            ]
        );
    }

    #[test]
    fn undecodable_payload_is_escaped() {
        let mut listener = listener(vec![Step::Datagram(echo_datagram(b"caf\xc3\xa9"))], DEFAULT_MAX_SIZE, Encoding::Ascii);
        listener.serve().unwrap();
        assert_eq!(messages(&listener.sink), vec![r"b'caf\xc3\xa9'"]);
    }

    #[test]
    fn embedded_send_time_is_picked_up() {
        let mut payload = 1_600_000_000i64.to_le_bytes().to_vec();
        payload.extend_from_slice(&250_000i64.to_le_bytes());
        payload.extend_from_slice(&[0x10, 0x11, 0x12, 0x13]);

        let listener = serve(vec![Step::Datagram(echo_datagram(&payload))]);

        match &listener.sink[..] {
            [Record::Ping(ping)] => {
                let sent = ping.sent.unwrap();
                assert_eq!((sent.seconds, sent.micros), (1_600_000_000, 250_000));
            }
            other => panic!("unexpected records {:?}", other),
        }
    }

    #[test]
    fn datagram_arriving_with_the_signal_is_not_processed() {
        let listener = serve(vec![
            Step::Datagram(echo_datagram(b"first")),
            Step::SignalWith(echo_datagram(b"second")),
            Step::Datagram(echo_datagram(b"third")),
        ]);

        assert_eq!(messages(&listener.sink), vec!["first"]);
        assert_eq!(listener.decoder.ip_calls, 1);
        assert_eq!(listener.socket.recv_calls, 2);
    }

    #[test]
    fn shutdown_before_serving_never_receives() {
        let mut listener = listener(vec![Step::Datagram(echo_datagram(b"hello"))], DEFAULT_MAX_SIZE, Encoding::Utf8);
        listener.shutdown.request();
        listener.serve().unwrap();

        assert_eq!(listener.socket.recv_calls, 0);
        assert!(listener.sink.is_empty());
    }

    #[test]
    fn interrupted_receive_is_retried() {
        let listener = serve(vec![Step::Fail(ErrorKind::Interrupted), Step::Datagram(echo_datagram(b"hello"))]);
        assert_eq!(messages(&listener.sink), vec!["hello"]);
    }

    #[test]
    fn socket_error_ends_serving() {
        let mut listener = listener(
            vec![Step::Fail(ErrorKind::Other), Step::Datagram(echo_datagram(b"hello"))],
            DEFAULT_MAX_SIZE,
            Encoding::Utf8,
        );

        assert!(matches!(listener.serve(), Err(LogPingsError::Receive(_))));
        assert!(listener.sink.is_empty());
        assert_eq!(listener.socket.recv_calls, 1);
    }

    #[test]
    fn shutdown_request_runs_the_waker() {
        let shutdown = Shutdown::default();
        let woken = Arc::new(AtomicBool::new(false));
        let flag = woken.clone();
        shutdown.wake_with(Box::new(move || flag.store(true, Ordering::SeqCst)));

        shutdown.clone().request();
        assert!(shutdown.is_requested());
        assert!(woken.load(Ordering::SeqCst));
    }

    /// Records the OS calls in order and hands out a scripted socket.
    struct RecordingPlatform {
        calls: Vec<String>,
        socket: Option<FakeSocket>,
        fail_on: Option<&'static str>,
    }

    impl RecordingPlatform {
        fn new(socket: FakeSocket) -> Self {
            RecordingPlatform { calls: Vec::new(), socket: Some(socket), fail_on: None }
        }

        fn call(&mut self, call: String, name: &str) -> io::Result<()> {
            self.calls.push(call);
            if self.fail_on == Some(name) {
                return Err(io::Error::from(ErrorKind::PermissionDenied));
            }
            Ok(())
        }
    }

    impl Platform for &mut RecordingPlatform {
        type Socket = FakeSocket;

        fn bind(&mut self, address: Ipv4Addr) -> io::Result<FakeSocket> {
            self.call(format!("bind {}", address), "bind")?;
            self.socket.take().ok_or_else(|| io::Error::from(ErrorKind::AddrInUse))
        }

        fn chroot(&mut self, dir: &Path) -> io::Result<()> {
            self.call(format!("chroot {}", dir.display()), "chroot")
        }

        fn setgid(&mut self, gid: libc::gid_t) -> io::Result<()> {
            self.call(format!("setgid {}", gid), "setgid")
        }

        fn clear_groups(&mut self) -> io::Result<()> {
            self.call("setgroups []".to_string(), "setgroups")
        }

        fn setuid(&mut self, uid: libc::uid_t) -> io::Result<()> {
            self.call(format!("setuid {}", uid), "setuid")
        }
    }

    fn config(hardening: bool) -> Config {
        Config {
            listen: Ipv4Addr::LOCALHOST,
            max_size: DEFAULT_MAX_SIZE,
            encoding: Encoding::Utf8,
            hardening: if hardening {
                Some(Hardening {
                    chroot: PathBuf::from("/var/empty"),
                    account: Account { name: "nobody".to_string(), uid: 65534, gid: 65533 },
                })
            } else {
                None
            },
        }
    }

    #[test]
    fn service_hardens_after_binding_in_order() {
        let shutdown = Shutdown::default();
        let socket = FakeSocket::new(vec![Step::Datagram(echo_datagram(b"hello"))], &shutdown);
        let closed = socket.closed.clone();
        let mut platform = RecordingPlatform::new(socket);
        let mut records = Vec::new();

        Service::new(config(true), &mut platform, Checked, &mut records, shutdown).run().unwrap();

        assert_eq!(
            platform.calls,
            vec!["bind 127.0.0.1", "chroot /var/empty", "setgid 65533", "setgroups []", "setuid 65534"]
        );
        assert_eq!(messages(&records), vec!["hello"]);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn service_without_hardening_only_binds() {
        let shutdown = Shutdown::default();
        let socket = FakeSocket::new(Vec::new(), &shutdown);
        let mut platform = RecordingPlatform::new(socket);

        Service::new(config(false), &mut platform, Checked, Vec::new(), shutdown).run().unwrap();

        assert_eq!(platform.calls, vec!["bind 127.0.0.1"]);
    }

    #[test]
    fn failed_hardening_closes_the_socket_before_serving() {
        let shutdown = Shutdown::default();
        let socket = FakeSocket::new(vec![Step::Datagram(echo_datagram(b"hello"))], &shutdown);
        let closed = socket.closed.clone();
        let mut platform = RecordingPlatform::new(socket);
        platform.fail_on = Some("setgid");
        let mut records = Vec::new();

        let err = Service::new(config(true), &mut platform, Checked, &mut records, shutdown)
            .run()
            .unwrap_err();

        assert!(matches!(err, LogPingsError::Harden { call: "setgid", .. }));
        assert_eq!(platform.calls, vec!["bind 127.0.0.1", "chroot /var/empty", "setgid 65533"]);
        assert!(records.is_empty());
        assert!(closed.load(Ordering::SeqCst));
    }

    #[test]
    fn failed_bind_is_fatal_and_skips_hardening() {
        let shutdown = Shutdown::default();
        let socket = FakeSocket::new(Vec::new(), &shutdown);
        let mut platform = RecordingPlatform::new(socket);
        platform.fail_on = Some("bind");

        let err = Service::new(config(true), &mut platform, Checked, Vec::new(), shutdown)
            .run()
            .unwrap_err();

        assert!(matches!(err, LogPingsError::Bind { .. }));
        assert_eq!(platform.calls, vec!["bind 127.0.0.1"]);
    }

    #[test]
    fn socket_error_still_closes_the_socket() {
        let shutdown = Shutdown::default();
        let socket = FakeSocket::new(vec![Step::Fail(ErrorKind::ConnectionReset)], &shutdown);
        let closed = socket.closed.clone();
        let mut platform = RecordingPlatform::new(socket);

        let err = Service::new(config(false), &mut platform, Checked, Vec::new(), shutdown)
            .run()
            .unwrap_err();

        assert!(matches!(err, LogPingsError::Receive(_)));
        assert!(closed.load(Ordering::SeqCst));
    }

    impl Sink for &mut Vec<Record> {
        fn write(&mut self, record: Record) {
            self.push(record);
        }
    }
}
