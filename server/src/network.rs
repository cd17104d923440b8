//! Server assembly: listeners, dispatcher, and the echo endpoint.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use log::{error, info};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::dispatcher::{self, Lifecycle};
use crate::transport;

/// Listener and timeout configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    /// Newline-framed TCP relay port.
    pub tcp_port: u16,
    /// WebSocket relay port.
    pub ws_port: u16,
    /// Auxiliary echo port, for connectivity probes.
    pub echo_port: u16,
    /// Silent clients are dropped after this long.
    pub idle_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            tcp_port: 9121,
            ws_port: 9122,
            echo_port: 9120,
            idle_timeout: Duration::from_millis(30_000),
        }
    }
}

/// A bound but not yet running relay. Binding separately from running lets
/// tests use port 0 and read back the chosen addresses.
pub struct Server {
    tcp_listener: TcpListener,
    ws_listener: TcpListener,
    echo_listener: TcpListener,
    tcp_addr: SocketAddr,
    ws_addr: SocketAddr,
    echo_addr: SocketAddr,
    idle_timeout: Duration,
}

impl Server {
    /// Binds all three listeners.
    pub async fn bind(config: &ServerConfig) -> io::Result<Server> {
        let tcp_listener =
            TcpListener::bind(format!("{}:{}", config.host, config.tcp_port)).await?;
        let ws_listener = TcpListener::bind(format!("{}:{}", config.host, config.ws_port)).await?;
        let echo_listener =
            TcpListener::bind(format!("{}:{}", config.host, config.echo_port)).await?;
        let tcp_addr = tcp_listener.local_addr()?;
        let ws_addr = ws_listener.local_addr()?;
        let echo_addr = echo_listener.local_addr()?;
        Ok(Server {
            tcp_listener,
            ws_listener,
            echo_listener,
            tcp_addr,
            ws_addr,
            echo_addr,
            idle_timeout: config.idle_timeout,
        })
    }

    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    pub fn ws_addr(&self) -> SocketAddr {
        self.ws_addr
    }

    pub fn echo_addr(&self) -> SocketAddr {
        self.echo_addr
    }

    /// Runs the relay: spawns the dispatcher and the WebSocket and echo
    /// accept loops, then accepts TCP connections until the process ends.
    pub async fn run(self) {
        let Server {
            tcp_listener,
            ws_listener,
            echo_listener,
            idle_timeout,
            ..
        } = self;

        let (event_tx, event_rx) = mpsc::unbounded_channel::<Lifecycle>();
        tokio::spawn(dispatcher::run(event_rx));

        let ws_events = event_tx.clone();
        tokio::spawn(async move {
            accept_loop(ws_listener, "WebSocket", move |stream, addr| {
                let events = ws_events.clone();
                tokio::spawn(transport::handle_ws_client(stream, addr, events, idle_timeout));
            })
            .await;
        });

        tokio::spawn(async move {
            accept_loop(echo_listener, "echo", |stream, addr| {
                tokio::spawn(echo_client(stream, addr));
            })
            .await;
        });

        info!("relay started");
        accept_loop(tcp_listener, "TCP", move |stream, addr| {
            let events = event_tx.clone();
            tokio::spawn(transport::handle_tcp_client(stream, addr, events, idle_timeout));
        })
        .await;
    }
}

/// Accepts connections forever, pausing briefly after transient errors so a
/// bad accept cannot spin the loop.
async fn accept_loop<F>(listener: TcpListener, label: &str, mut handle: F)
where
    F: FnMut(TcpStream, SocketAddr),
{
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => handle(stream, addr),
            Err(e) => {
                error!("{} accept failed: {}", label, e);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

/// The auxiliary echo endpoint: bytes in, same bytes out.
async fn echo_client(mut stream: TcpStream, addr: SocketAddr) {
    let (mut reader, mut writer) = stream.split();
    if let Err(e) = tokio::io::copy(&mut reader, &mut writer).await {
        log::debug!("echo connection from {} ended: {}", addr, e);
    }
}
