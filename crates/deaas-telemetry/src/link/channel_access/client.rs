//! ---
//! ems_section: "04-telemetry-providers"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Native Channel Access client: name search, circuits and monitors."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! One background task owns every channel. It broadcasts name searches over
//! UDP, opens one TCP circuit per answering server, and turns monitor
//! reports into [`PvUpdate`]s. Lost circuits and disconnected channels fall
//! back to searching, so monitors survive IOC restarts.
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket as StdUdpSocket};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use super::proto::{self, command, Message};
use crate::error::LinkError;
use crate::link::{PvSubscription, PvUpdate, ValueHandler};
use crate::live::BackoffPolicy;

const SEARCH_TICK: Duration = Duration::from_millis(100);
const SEARCH_BASE_DELAY: Duration = Duration::from_millis(200);
const SEARCH_MAX_DELAY: Duration = Duration::from_secs(30);
const SEARCH_BATCH_BYTES: usize = 1024;
const MAX_DATAGRAM: usize = 16 * 1024;

/// Destinations for name searches, in `EPICS_CA_ADDR_LIST` form.
///
/// Entries are whitespace separated `host[:port]`. Unless `auto_addr_list`
/// is `NO`, the limited broadcast address is searched as well.
pub(super) fn search_targets(
    addr_list: Option<&str>,
    auto_addr_list: Option<&str>,
) -> Result<Vec<SocketAddr>, LinkError> {
    let mut targets = addr_list
        .unwrap_or_default()
        .split_whitespace()
        .map(resolve_target)
        .collect::<Result<Vec<_>, _>>()?;
    let auto = auto_addr_list.map_or(true, |value| !value.trim().eq_ignore_ascii_case("no"));
    if auto {
        targets.push(SocketAddr::from(([255, 255, 255, 255], proto::DEFAULT_SERVER_PORT)));
    }
    if targets.is_empty() {
        return Err(LinkError::Unavailable(
            "channel-access has no search address: addr_list is empty and auto_addr_list is NO"
                .into(),
        ));
    }
    Ok(targets)
}

fn resolve_target(entry: &str) -> Result<SocketAddr, LinkError> {
    if let Ok(addr) = entry.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = entry.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, proto::DEFAULT_SERVER_PORT));
    }
    let unresolved = || LinkError::Unavailable(format!("cannot resolve channel-access address {entry:?}"));
    let (host, port) = match entry.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().map_err(|_| unresolved())?),
        None => (entry, proto::DEFAULT_SERVER_PORT),
    };
    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(unresolved)
}

enum Command {
    Monitor {
        cid: u32,
        pv: String,
        handler: ValueHandler,
    },
    Cancel {
        cid: u32,
    },
}

/// Entry point used by the link; cheap to share behind the link's lock.
#[derive(Debug)]
pub(super) struct ClientHandle {
    commands: mpsc::UnboundedSender<Command>,
    next_cid: AtomicU32,
}

impl ClientHandle {
    /// Open the search socket and spawn the client task on `runtime`.
    pub(super) fn start(targets: Vec<SocketAddr>, runtime: &Handle) -> Result<Self, LinkError> {
        let udp = bind_search_socket(runtime).map_err(|err| {
            LinkError::Unavailable(format!("cannot open channel-access search socket: {err}"))
        })?;
        info!(targets = ?targets, "channel-access client started");

        let (commands, command_rx) = mpsc::unbounded_channel();
        let (events, event_rx) = mpsc::unbounded_channel();
        let client = Client {
            udp,
            targets,
            channels: HashMap::new(),
            circuits: HashMap::new(),
            events,
            hello: hello_frames(),
            backoff: BackoffPolicy::new(SEARCH_BASE_DELAY, SEARCH_MAX_DELAY, Duration::ZERO),
        };
        runtime.spawn(client.run(command_rx, event_rx));
        Ok(Self {
            commands,
            next_cid: AtomicU32::new(1),
        })
    }

    /// Queue a monitor for `pv`. Values arrive once a server answers.
    pub(super) fn monitor(
        &self,
        pv: &str,
        handler: ValueHandler,
    ) -> Result<Box<dyn PvSubscription>, LinkError> {
        let cid = self.next_cid.fetch_add(1, Ordering::Relaxed);
        self.commands
            .send(Command::Monitor {
                cid,
                pv: pv.to_owned(),
                handler,
            })
            .map_err(|_| LinkError::Disconnected("channel-access client task stopped".into()))?;
        Ok(Box::new(MonitorHandle {
            pv: pv.to_owned(),
            cid,
            commands: Some(self.commands.clone()),
        }))
    }
}

fn bind_search_socket(runtime: &Handle) -> io::Result<UdpSocket> {
    let socket = StdUdpSocket::bind(("0.0.0.0", 0))?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let _entered = runtime.enter();
    UdpSocket::from_std(socket)
}

fn hello_frames() -> Bytes {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "deaas".to_owned());
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_owned());
    let mut buf = BytesMut::new();
    proto::put_version(&mut buf);
    proto::put_client_name(&mut buf, &user);
    proto::put_host_name(&mut buf, &host);
    buf.freeze()
}

struct MonitorHandle {
    pv: String,
    cid: u32,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

impl PvSubscription for MonitorHandle {
    fn pv(&self) -> &str {
        &self.pv
    }

    fn cancel(&mut self) {
        if let Some(commands) = self.commands.take() {
            let _ = commands.send(Command::Cancel { cid: self.cid });
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

enum ChannelState {
    Searching { attempt: u32, next: Instant },
    Creating { server: SocketAddr },
    Connected { server: SocketAddr, sid: u32, dbr_type: u16 },
}

impl ChannelState {
    fn searching() -> Self {
        ChannelState::Searching {
            attempt: 0,
            next: Instant::now(),
        }
    }

    fn server(&self) -> Option<SocketAddr> {
        match self {
            ChannelState::Searching { .. } => None,
            ChannelState::Creating { server } | ChannelState::Connected { server, .. } => {
                Some(*server)
            }
        }
    }
}

struct Channel {
    pv: String,
    handler: ValueHandler,
    state: ChannelState,
}

enum CircuitEvent {
    Message(SocketAddr, Message),
    Closed(SocketAddr),
}

struct Client {
    udp: UdpSocket,
    targets: Vec<SocketAddr>,
    /// Keyed by client channel id, which doubles as the subscription id.
    channels: HashMap<u32, Channel>,
    circuits: HashMap<SocketAddr, mpsc::UnboundedSender<Bytes>>,
    events: mpsc::UnboundedSender<CircuitEvent>,
    hello: Bytes,
    backoff: BackoffPolicy,
}

impl Client {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<CircuitEvent>,
    ) {
        let mut ticker = tokio::time::interval(SEARCH_TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut datagram = vec![0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => break,
                },
                Some(event) = events.recv() => self.on_circuit_event(event),
                received = self.udp.recv_from(&mut datagram) => match received {
                    Ok((len, from)) => self.on_datagram(&datagram[..len], from),
                    Err(err) => debug!(error = %err, "channel-access search socket error"),
                },
                _ = ticker.tick() => self.search_due().await,
            }
        }
        debug!(channels = self.channels.len(), "channel-access client stopped");
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Monitor { cid, pv, handler } => {
                debug!(pv = %pv, cid, "channel-access monitor requested");
                self.channels.insert(
                    cid,
                    Channel {
                        pv,
                        handler,
                        state: ChannelState::searching(),
                    },
                );
            }
            Command::Cancel { cid } => {
                let Some(channel) = self.channels.remove(&cid) else {
                    return;
                };
                if let ChannelState::Connected {
                    server,
                    sid,
                    dbr_type,
                } = channel.state
                {
                    let mut frame = BytesMut::new();
                    proto::put_event_cancel(&mut frame, sid, cid, dbr_type);
                    proto::put_clear_channel(&mut frame, sid, cid);
                    self.send_to_circuit(server, frame.freeze());
                }
                debug!(pv = %channel.pv, "channel-access monitor cancelled");
            }
        }
    }

    async fn search_due(&mut self) {
        let now = Instant::now();
        let mut batches = Vec::new();
        let mut batch = BytesMut::new();
        for (cid, channel) in self.channels.iter_mut() {
            let ChannelState::Searching { attempt, next } = &mut channel.state else {
                continue;
            };
            if *next > now {
                continue;
            }
            *attempt = attempt.saturating_add(1);
            *next = now + self.backoff.delay(*attempt);
            if batch.is_empty() {
                proto::put_version(&mut batch);
            }
            proto::put_search(&mut batch, *cid, &channel.pv);
            if batch.len() >= SEARCH_BATCH_BYTES {
                batches.push(batch.split().freeze());
            }
        }
        if !batch.is_empty() {
            batches.push(batch.freeze());
        }
        for datagram in batches {
            for target in &self.targets {
                if let Err(err) = self.udp.send_to(&datagram, target).await {
                    debug!(%target, error = %err, "channel-access search not sent");
                }
            }
        }
    }

    fn on_datagram(&mut self, data: &[u8], from: SocketAddr) {
        let mut buf = BytesMut::from(data);
        while let Ok(Some(message)) = proto::take_message(&mut buf) {
            if message.header.command == command::SEARCH {
                let server = proto::search_reply_server(&message.header, from);
                self.on_search_reply(message.header.param2, server);
            }
        }
    }

    fn on_search_reply(&mut self, cid: u32, server: SocketAddr) {
        let Some(channel) = self.channels.get_mut(&cid) else {
            return;
        };
        // Several servers, or several broadcast paths, may answer.
        if !matches!(channel.state, ChannelState::Searching { .. }) {
            return;
        }
        debug!(pv = %channel.pv, %server, "channel-access search answered");
        channel.state = ChannelState::Creating { server };
        let mut frame = BytesMut::new();
        proto::put_create_channel(&mut frame, cid, &channel.pv);
        self.send_to_circuit(server, frame.freeze());
    }

    fn on_circuit_event(&mut self, event: CircuitEvent) {
        match event {
            CircuitEvent::Message(server, message) => self.on_message(server, message),
            CircuitEvent::Closed(server) => {
                self.circuits.remove(&server);
                let mut affected = 0;
                for channel in self.channels.values_mut() {
                    if channel.state.server() == Some(server) {
                        channel.state = ChannelState::searching();
                        affected += 1;
                    }
                }
                info!(%server, channels = affected, "channel-access circuit closed");
            }
        }
    }

    fn on_message(&mut self, server: SocketAddr, message: Message) {
        let header = message.header;
        match header.command {
            command::CREATE_CHAN => {
                let (cid, sid) = (header.param1, header.param2);
                let mut frame = BytesMut::new();
                match self.channels.get_mut(&cid) {
                    Some(channel) if channel.state.server() == Some(server) => {
                        let dbr_type = proto::monitor_type(header.data_type);
                        channel.state = ChannelState::Connected {
                            server,
                            sid,
                            dbr_type,
                        };
                        info!(pv = %channel.pv, %server, "channel-access channel connected");
                        proto::put_event_add(&mut frame, sid, cid, dbr_type);
                    }
                    // Cancelled while the create was in flight.
                    _ => proto::put_clear_channel(&mut frame, sid, cid),
                }
                self.send_to_circuit(server, frame.freeze());
            }
            command::EVENT_ADD => {
                // An empty report acknowledges a cancelled monitor.
                if message.payload.is_empty() {
                    return;
                }
                let Some(channel) = self.channels.get(&header.param2) else {
                    return;
                };
                if header.param1 != proto::ECA_NORMAL {
                    warn!(pv = %channel.pv, status = header.param1, "channel-access monitor reported an error");
                    return;
                }
                match proto::decode_value(header.data_type, header.count, &message.payload) {
                    Some(value) => (channel.handler)(PvUpdate {
                        pv: channel.pv.clone(),
                        value,
                    }),
                    None => debug!(pv = %channel.pv, dbr_type = header.data_type, "undecodable channel-access value"),
                }
            }
            command::CREATE_CH_FAIL | command::SERVER_DISCONN => {
                if let Some(channel) = self.channels.get_mut(&header.param1) {
                    warn!(pv = %channel.pv, %server, "channel-access channel lost; searching again");
                    channel.state = ChannelState::searching();
                }
            }
            command::ERROR => {
                warn!(%server, cid = header.param1, status = header.param2, "channel-access server reported an error");
            }
            command::VERSION | command::ACCESS_RIGHTS | command::ECHO => {}
            other => trace!(%server, command = other, "unhandled channel-access message"),
        }
    }

    fn send_to_circuit(&mut self, server: SocketAddr, frame: Bytes) {
        let circuit = self
            .circuits
            .entry(server)
            .or_insert_with(|| spawn_circuit(server, self.hello.clone(), self.events.clone()));
        if circuit.send(frame).is_err() {
            // The circuit's close event resets its channels.
            debug!(%server, "channel-access circuit already closed");
        }
    }
}

fn spawn_circuit(
    server: SocketAddr,
    hello: Bytes,
    events: mpsc::UnboundedSender<CircuitEvent>,
) -> mpsc::UnboundedSender<Bytes> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        if let Err(err) = drive_circuit(server, hello, rx, &events).await {
            warn!(%server, error = %err, "channel-access circuit failed");
        }
        let _ = events.send(CircuitEvent::Closed(server));
    });
    tx
}

async fn drive_circuit(
    server: SocketAddr,
    hello: Bytes,
    mut outgoing: mpsc::UnboundedReceiver<Bytes>,
    events: &mpsc::UnboundedSender<CircuitEvent>,
) -> io::Result<()> {
    let stream = TcpStream::connect(server).await?;
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();
    writer.write_all(&hello).await?;
    debug!(%server, "channel-access circuit open");

    let mut inbound = BytesMut::with_capacity(4096);
    loop {
        tokio::select! {
            frame = outgoing.recv() => match frame {
                Some(frame) => writer.write_all(&frame).await?,
                None => return Ok(()),
            },
            read = reader.read_buf(&mut inbound) => {
                if read? == 0 {
                    return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "server closed the circuit"));
                }
                while let Some(message) = proto::take_message(&mut inbound)? {
                    if events.send(CircuitEvent::Message(server, message)).is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MetricValue;
    use bytes::BufMut;
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn server_message(command: u16, data_type: u16, count: u16, p1: u32, p2: u32, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        buf.put_u16(command);
        buf.put_u16(payload.len() as u16);
        buf.put_u16(data_type);
        buf.put_u16(count);
        buf.put_u32(p1);
        buf.put_u32(p2);
        buf.put_slice(payload);
        buf
    }

    /// Minimal IOC: answers searches and speaks one circuit.
    struct FakeIoc {
        udp: UdpSocket,
        tcp: TcpListener,
    }

    impl FakeIoc {
        async fn bind() -> Self {
            Self {
                udp: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
                tcp: TcpListener::bind("127.0.0.1:0").await.unwrap(),
            }
        }

        fn addr_list(&self) -> String {
            self.udp.local_addr().unwrap().to_string()
        }

        /// Wait for a search naming `pv` and point it at the circuit port.
        async fn answer_search(&self, pv: &str) -> u32 {
            let mut datagram = vec![0u8; MAX_DATAGRAM];
            loop {
                let (len, from) = timeout(WAIT, self.udp.recv_from(&mut datagram))
                    .await
                    .unwrap()
                    .unwrap();
                let mut buf = BytesMut::from(&datagram[..len]);
                while let Some(message) = proto::take_message(&mut buf).unwrap() {
                    let name = message.payload.split(|&b| b == 0).next().unwrap_or_default();
                    if message.header.command == command::SEARCH && name == pv.as_bytes() {
                        let cid = message.header.param1;
                        let port = self.tcp.local_addr().unwrap().port();
                        let reply = server_message(command::SEARCH, port, 0, u32::MAX, cid, &[0, 13, 0, 0, 0, 0, 0, 0]);
                        self.udp.send_to(&reply, from).await.unwrap();
                        return cid;
                    }
                }
            }
        }
    }

    async fn expect(stream: &mut TcpStream, inbound: &mut BytesMut, wanted: u16) -> Message {
        loop {
            while let Some(message) = proto::take_message(inbound).unwrap() {
                if message.header.command == wanted {
                    return message;
                }
            }
            let read = timeout(WAIT, stream.read_buf(inbound)).await.unwrap().unwrap();
            assert!(read > 0, "client closed the circuit");
        }
    }

    fn collector() -> (ValueHandler, mpsc::UnboundedReceiver<PvUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handler: ValueHandler = Arc::new(move |update: PvUpdate| {
            let _ = tx.send(update);
        });
        (handler, rx)
    }

    #[test]
    fn search_targets_follow_address_settings() {
        let targets = search_targets(Some("127.0.0.1:5070  10.0.0.255"), Some("no")).unwrap();
        assert_eq!(
            targets,
            vec![
                "127.0.0.1:5070".parse().unwrap(),
                "10.0.0.255:5064".parse().unwrap()
            ]
        );

        let targets = search_targets(None, None).unwrap();
        assert_eq!(targets, vec!["255.255.255.255:5064".parse().unwrap()]);

        assert!(search_targets(Some("  "), Some("NO")).is_err());
        assert!(search_targets(Some("10.0.0.1:port"), Some("NO")).is_err());
    }

    #[tokio::test]
    async fn monitor_receives_values_and_cancels_on_circuit() {
        let ioc = FakeIoc::bind().await;
        let targets = search_targets(Some(&ioc.addr_list()), Some("NO")).unwrap();
        let client = ClientHandle::start(targets, &Handle::current()).unwrap();
        let (handler, mut updates) = collector();
        let mut monitor = client.monitor("SITE:PANEL:001:VOLTAGE", handler).unwrap();
        assert_eq!(monitor.pv(), "SITE:PANEL:001:VOLTAGE");

        let cid = ioc.answer_search("SITE:PANEL:001:VOLTAGE").await;
        let (mut stream, _) = timeout(WAIT, ioc.tcp.accept()).await.unwrap().unwrap();
        let mut inbound = BytesMut::new();

        let create = expect(&mut stream, &mut inbound, command::CREATE_CHAN).await;
        assert_eq!(create.header.param1, cid);
        stream
            .write_all(&server_message(command::CREATE_CHAN, proto::dbr::FLOAT, 1, cid, 77, &[]))
            .await
            .unwrap();

        let add = expect(&mut stream, &mut inbound, command::EVENT_ADD).await;
        assert_eq!(add.header.param1, 77);
        assert_eq!(add.header.data_type, proto::dbr::DOUBLE);
        let value = server_message(
            command::EVENT_ADD,
            proto::dbr::DOUBLE,
            1,
            proto::ECA_NORMAL,
            add.header.param2,
            &42.5f64.to_be_bytes(),
        );
        stream.write_all(&value).await.unwrap();

        let update = timeout(WAIT, updates.recv()).await.unwrap().unwrap();
        assert_eq!(update.pv, "SITE:PANEL:001:VOLTAGE");
        assert_eq!(update.value, MetricValue::Float(42.5));

        monitor.cancel();
        let cancel = expect(&mut stream, &mut inbound, command::EVENT_CANCEL).await;
        assert_eq!(cancel.header.param1, 77);
        let clear = expect(&mut stream, &mut inbound, command::CLEAR_CHANNEL).await;
        assert_eq!(clear.header.param2, cid);
    }

    #[tokio::test]
    async fn disconnected_channel_is_searched_again() {
        let ioc = FakeIoc::bind().await;
        let targets = search_targets(Some(&ioc.addr_list()), Some("NO")).unwrap();
        let client = ClientHandle::start(targets, &Handle::current()).unwrap();
        let (handler, _updates) = collector();
        let _monitor = client.monitor("SITE:INV:002:STATUS", handler).unwrap();

        let cid = ioc.answer_search("SITE:INV:002:STATUS").await;
        let (mut stream, _) = timeout(WAIT, ioc.tcp.accept()).await.unwrap().unwrap();
        let mut inbound = BytesMut::new();
        expect(&mut stream, &mut inbound, command::CREATE_CHAN).await;
        stream
            .write_all(&server_message(command::CREATE_CHAN, proto::dbr::ENUM, 1, cid, 5, &[]))
            .await
            .unwrap();
        let add = expect(&mut stream, &mut inbound, command::EVENT_ADD).await;
        assert_eq!(add.header.data_type, proto::dbr::LONG);

        stream
            .write_all(&server_message(command::SERVER_DISCONN, 0, 0, cid, 0, &[]))
            .await
            .unwrap();
        assert_eq!(ioc.answer_search("SITE:INV:002:STATUS").await, cid);
    }
}
