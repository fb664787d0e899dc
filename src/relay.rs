//! TCP and UDP relay front-ends.
//!
//! Both relays listen locally and forward everything to one fixed remote
//! address. The ACL decides per connection (TCP) or per source address
//! (UDP) whether traffic goes through the tunnel, straight out, or nowhere.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::acl::{AclEngine, Action};
use crate::client::Client;
use crate::common::{split_host_port, DnsResolver, UDP_BUFFER_SIZE};
use crate::datagram::UdpSession;
use crate::error::{Error, Result};
use crate::observer::{ErrorEvent, Network, RequestEvent, RequestObserver};
use crate::transport::unspecified_for;

/// Default idle timeout for UDP relay sessions.
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(60);

/// Packets held per source while its flow is still being set up.
const PENDING_PACKET_LIMIT: usize = 64;

/// Settings shared by the TCP and UDP relays.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Local listen address.
    pub listen: String,
    /// Fixed destination (host:port) for everything accepted.
    pub remote: String,
    /// Idle timeout; zero disables it for TCP.
    pub timeout: Duration,
}

/// Last time a flow moved a byte in either direction.
#[derive(Debug, Clone)]
struct Activity(Arc<Mutex<Instant>>);

impl Activity {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    fn touch(&self) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    fn last(&self) -> Instant {
        *self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Resolves once nothing happened for `idle`.
    async fn idle(&self, idle: Duration) {
        loop {
            let deadline = self.last() + idle;
            if Instant::now() >= deadline {
                return;
            }
            tokio::time::sleep_until(deadline).await;
        }
    }
}

/// Stream wrapper that records read and write progress in an [`Activity`].
struct Tracked<S> {
    inner: S,
    activity: Activity,
}

impl<S: AsyncRead + Unpin> AsyncRead for Tracked<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if result.is_ready() {
            self.activity.touch();
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Tracked<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if result.is_ready() {
            self.activity.touch();
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Copies both directions until either side finishes or the pair goes idle.
async fn pipe<A, B>(local: A, mut remote: B, idle: Option<Duration>) -> Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let activity = Activity::new();
    let mut local = Tracked {
        inner: local,
        activity: activity.clone(),
    };
    let copy = tokio::io::copy_bidirectional(&mut local, &mut remote);
    match idle {
        Some(idle) => tokio::select! {
            result = copy => Ok(result?),
            _ = activity.idle(idle) => Err(Error::DeadlineExceeded),
        },
        None => Ok(copy.await?),
    }
}

/// State shared by every connection or flow of one relay.
struct RelayContext {
    client: Client,
    acl: Arc<AclEngine>,
    resolver: DnsResolver,
    observer: Arc<dyn RequestObserver>,
    remote: String,
    remote_host: String,
    remote_port: u16,
    timeout: Option<Duration>,
}

impl RelayContext {
    fn new(
        config: &RelayConfig,
        client: Client,
        acl: Arc<AclEngine>,
        observer: Arc<dyn RequestObserver>,
    ) -> Result<Self> {
        let (remote_host, remote_port) = split_host_port(&config.remote)?;
        Ok(Self {
            client,
            acl,
            resolver: DnsResolver::new(),
            observer,
            remote: config.remote.clone(),
            remote_host,
            remote_port,
            timeout: (!config.timeout.is_zero()).then_some(config.timeout),
        })
    }

    /// Evaluates the ACL for the remote and reports the request.
    ///
    /// Returns the action and the address traffic should actually go to.
    async fn route(&self, network: Network, source: SocketAddr) -> (Action, String) {
        let decision = self
            .acl
            .evaluate_with_resolver(&self.remote_host, self.remote_port, &self.resolver)
            .await;
        self.observer.on_request(&RequestEvent {
            network,
            source,
            destination: &self.remote,
            decision,
        });
        (
            decision.action.clone(),
            decision.target(&self.remote_host, self.remote_port),
        )
    }

    async fn resolve(&self, target: &str) -> Result<SocketAddr> {
        let (host, port) = split_host_port(target)?;
        self.resolver.resolve(&host, port).await
    }

    fn report(&self, network: Network, source: SocketAddr, error: &Error) {
        self.observer.on_error(&ErrorEvent {
            network,
            source,
            destination: &self.remote,
            error,
        });
    }
}

/// Forwards every accepted TCP connection to a fixed remote.
pub struct TcpRelay {
    listener: TcpListener,
    ctx: Arc<RelayContext>,
}

impl TcpRelay {
    pub async fn bind(
        config: &RelayConfig,
        client: Client,
        acl: Arc<AclEngine>,
        observer: Arc<dyn RequestObserver>,
    ) -> Result<Self> {
        let ctx = RelayContext::new(config, client, acl, observer)?;
        let listener = TcpListener::bind(&config.listen)
            .await
            .map_err(|e| Error::ListenFailed(format!("{}: {}", config.listen, e)))?;
        Ok(Self {
            listener,
            ctx: Arc::new(ctx),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections until the listener fails or the tunnel closes.
    ///
    /// Connection tasks are owned by this future: they are aborted when it
    /// returns or is dropped, including pipes that never touch the tunnel.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            listen = %self.local_addr()?,
            remote = %self.ctx.remote,
            "TCP relay up and running"
        );

        let mut connections = JoinSet::new();
        loop {
            let (stream, source) = tokio::select! {
                accepted = self.listener.accept() => accepted
                    .map_err(|e| Error::ListenFailed(format!("accept failed: {}", e)))?,
                Some(_) = connections.join_next() => continue,
                e = self.ctx.client.closed() => return Err(e),
            };

            let ctx = Arc::clone(&self.ctx);
            connections.spawn(async move {
                if let Err(e) = handle_tcp(&ctx, stream, source).await {
                    ctx.report(Network::Tcp, source, &e);
                }
            });
        }
    }
}

async fn handle_tcp(ctx: &RelayContext, local: TcpStream, source: SocketAddr) -> Result<()> {
    let (action, target) = ctx.route(Network::Tcp, source).await;
    let deadline = ctx.timeout.map(|t| Instant::now() + t);

    let (up, down) = match action {
        Action::Block => return Ok(()),
        Action::Proxy => {
            let stream = ctx.client.open_stream(&target, deadline).await?;
            pipe(local, stream, ctx.timeout).await?
        }
        Action::Direct | Action::Hijack(_) => {
            let addr = ctx.resolve(&target).await?;
            let connect = TcpStream::connect(addr);
            let remote = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, connect)
                    .await
                    .map_err(|_| Error::DeadlineExceeded)??,
                None => connect.await?,
            };
            pipe(local, remote, ctx.timeout).await?
        }
    };

    tracing::trace!(%source, target, up, down, "TCP relay finished");
    Ok(())
}

/// Where one UDP flow's packets go.
enum FlowPath {
    Tunnel(UdpSession),
    Direct(UdpSocket),
    Blocked,
}

impl FlowPath {
    async fn send(&self, target: &str, payload: &[u8]) -> Result<()> {
        match self {
            FlowPath::Tunnel(session) => session.send(target, payload),
            FlowPath::Direct(socket) => socket.send(payload).await.map(|_| ()).map_err(Error::from),
            FlowPath::Blocked => Ok(()),
        }
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<Bytes> {
        match self {
            FlowPath::Tunnel(session) => session.recv().await.map(|(_, payload)| payload),
            FlowPath::Direct(socket) => {
                let n = socket.recv(buf).await?;
                Ok(Bytes::copy_from_slice(&buf[..n]))
            }
            FlowPath::Blocked => std::future::pending().await,
        }
    }

    fn close(&self) {
        if let FlowPath::Tunnel(session) = self {
            session.close();
        }
    }
}

/// One local source address and its path to the remote.
struct Flow {
    path: FlowPath,
    target: String,
    activity: Activity,
}

enum FlowSlot {
    /// Setup in progress; early packets wait here.
    Opening(Vec<Bytes>),
    Open(Arc<Flow>),
}

type FlowMap = Arc<Mutex<HashMap<SocketAddr, FlowSlot>>>;

/// Forwards UDP packets to a fixed remote, one session per local source address.
pub struct UdpRelay {
    socket: Arc<UdpSocket>,
    ctx: Arc<RelayContext>,
    flows: FlowMap,
}

impl UdpRelay {
    pub async fn bind(
        config: &RelayConfig,
        client: Client,
        acl: Arc<AclEngine>,
        observer: Arc<dyn RequestObserver>,
    ) -> Result<Self> {
        let mut config = config.clone();
        if config.timeout.is_zero() {
            config.timeout = DEFAULT_UDP_TIMEOUT;
        }
        let ctx = RelayContext::new(&config, client, acl, observer)?;
        let socket = UdpSocket::bind(&config.listen)
            .await
            .map_err(|e| Error::ListenFailed(format!("{}: {}", config.listen, e)))?;
        Ok(Self {
            socket: Arc::new(socket),
            ctx: Arc::new(ctx),
            flows: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Number of live flows, including ones still being set up.
    pub fn flow_count(&self) -> usize {
        self.flows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Relays packets until the socket fails or the tunnel closes.
    ///
    /// Flow setup runs in its own task so a slow lookup or session request
    /// never holds up packets from other sources. Flow tasks are aborted
    /// when this future returns or is dropped.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            listen = %self.local_addr()?,
            remote = %self.ctx.remote,
            "UDP relay up and running"
        );

        let mut flow_tasks = JoinSet::new();
        let mut buf = vec![0u8; UDP_BUFFER_SIZE];
        loop {
            let (n, source) = tokio::select! {
                received = self.socket.recv_from(&mut buf) => received
                    .map_err(|e| Error::ListenFailed(format!("receive failed: {}", e)))?,
                Some(_) = flow_tasks.join_next() => continue,
                e = self.ctx.client.closed() => return Err(e),
            };
            let packet = &buf[..n];

            let flow = {
                let mut flows = self.flows.lock().unwrap_or_else(|e| e.into_inner());
                match flows.get_mut(&source) {
                    Some(FlowSlot::Open(flow)) => Arc::clone(flow),
                    Some(FlowSlot::Opening(pending)) => {
                        if pending.len() < PENDING_PACKET_LIMIT {
                            pending.push(Bytes::copy_from_slice(packet));
                        }
                        continue;
                    }
                    None => {
                        flows.insert(
                            source,
                            FlowSlot::Opening(vec![Bytes::copy_from_slice(packet)]),
                        );
                        flow_tasks.spawn(run_flow(
                            source,
                            Arc::clone(&self.socket),
                            Arc::clone(&self.ctx),
                            Arc::clone(&self.flows),
                        ));
                        continue;
                    }
                }
            };

            flow.activity.touch();
            if let Err(e) = flow.path.send(&flow.target, packet).await {
                self.ctx.report(Network::Udp, source, &e);
            }
        }
    }
}

async fn open_flow(ctx: &RelayContext, source: SocketAddr) -> Result<Flow> {
    let (action, target) = ctx.route(Network::Udp, source).await;
    let path = match action {
        Action::Block => FlowPath::Blocked,
        Action::Proxy => FlowPath::Tunnel(ctx.client.listen_udp().await?),
        Action::Direct | Action::Hijack(_) => {
            let addr = ctx.resolve(&target).await?;
            let socket = UdpSocket::bind(unspecified_for(&addr)).await?;
            socket.connect(addr).await?;
            FlowPath::Direct(socket)
        }
    };

    Ok(Flow {
        path,
        target,
        activity: Activity::new(),
    })
}

/// Sets up the flow for `source`, flushes its queued packets, then serves
/// the downlink until the flow idles out.
async fn run_flow(
    source: SocketAddr,
    socket: Arc<UdpSocket>,
    ctx: Arc<RelayContext>,
    flows: FlowMap,
) {
    let flow = match open_flow(&ctx, source).await {
        Ok(flow) => Arc::new(flow),
        Err(e) => {
            flows
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&source);
            ctx.report(Network::Udp, source, &e);
            return;
        }
    };

    let pending = match flows
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .insert(source, FlowSlot::Open(Arc::clone(&flow)))
    {
        Some(FlowSlot::Opening(pending)) => pending,
        _ => Vec::new(),
    };
    for packet in pending {
        if let Err(e) = flow.path.send(&flow.target, &packet).await {
            ctx.report(Network::Udp, source, &e);
        }
    }

    flow_downlink(flow, source, socket, ctx, flows).await;
}

/// Returns packets from the remote to `source` until the flow idles out.
async fn flow_downlink(
    flow: Arc<Flow>,
    source: SocketAddr,
    socket: Arc<UdpSocket>,
    ctx: Arc<RelayContext>,
    flows: FlowMap,
) {
    let idle = ctx.timeout.unwrap_or(DEFAULT_UDP_TIMEOUT);
    let mut buf = vec![0u8; UDP_BUFFER_SIZE];

    let error = loop {
        let payload = tokio::select! {
            received = flow.path.recv(&mut buf) => received,
            _ = flow.activity.idle(idle) => Err(Error::DeadlineExceeded),
        };
        match payload {
            Ok(payload) => {
                flow.activity.touch();
                if let Err(e) = socket.send_to(&payload, source).await {
                    break Error::from(e);
                }
            }
            Err(e) => break e,
        }
    };

    flows
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&source);
    flow.path.close();
    ctx.report(Network::Udp, source, &error);
}
