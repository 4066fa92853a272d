//! The readiness loop: accepts connections, dispatches per-connection I/O
//! to the worker pool, and is the sole owner of registration state and the
//! idle timer. Workers never touch `mio::Registry` directly — they send a
//! `WorkerSignal` back over a channel and wake the loop with a `Waker`, so
//! "the loop thread is the sole mutator of registration state" holds without
//! a lock around the connection table itself.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::Config;
use crate::db::DbPool;
use crate::error::{Error, Result};
use crate::http::HttpConnection;
use crate::timer::HeapTimer;
use crate::worker_pool::WorkerPool;

/// Hard ceiling on concurrently tracked connections, independent of
/// `ulimit -n`; a well-behaved deployment tunes the OS limit to match.
const MAX_FD: usize = 65_536;
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Tracks how many live connections the process holds, mirroring the
/// source's process-wide atomic connection counter.
pub static CONNECTION_COUNT: AtomicUsize = AtomicUsize::new(0);

enum WorkerSignal {
    Rearm { token: Token, interest: Interest },
    Close { token: Token },
}

struct ListenerEntry {
    listener: TcpListener,
    port: u16,
}

pub struct Server {
    poll: Poll,
    listeners: Vec<ListenerEntry>,
    connections: HashMap<Token, Arc<Mutex<HttpConnection>>>,
    next_token: usize,
    timer: HeapTimer,
    worker_pool: WorkerPool,
    db_pool: Option<Arc<DbPool>>,
    config: Arc<Config>,
    signal_tx: Sender<WorkerSignal>,
    signal_rx: Receiver<WorkerSignal>,
    waker: Arc<Waker>,
}

impl Server {
    pub fn new(config: Config) -> Result<Self> {
        let config = Arc::new(config);
        let poll = Poll::new().map_err(Error::Io)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).map_err(Error::Io)?);

        let mut listeners = Vec::new();
        let mut next_token = 0usize;
        let mut seen_ports = std::collections::HashSet::new();
        for server_cfg in &config.servers {
            for &port in &server_cfg.ports {
                if !seen_ports.insert(port) {
                    continue;
                }
                let addr: SocketAddr = format!("{}:{}", server_cfg.host, port)
                    .parse()
                    .map_err(Error::Addr)?;
                let mut listener = TcpListener::from_std(bind_listener(addr, &config)?);
                let token = Token(next_token);
                next_token += 1;
                poll.registry()
                    .register(&mut listener, token, Interest::READABLE)
                    .map_err(Error::Io)?;
                listeners.push(ListenerEntry { listener, port });
                proxy_log::info!("listening on {addr}");
            }
        }

        let db_pool = config.db.as_ref().map(|db_cfg| Arc::new(DbPool::init(db_cfg)));
        let worker_pool = WorkerPool::new(config.worker_count);
        let (signal_tx, signal_rx) = mpsc::channel();

        Ok(Server {
            poll,
            listeners,
            connections: HashMap::new(),
            next_token,
            timer: HeapTimer::new(),
            worker_pool,
            db_pool,
            config,
            signal_tx,
            signal_rx,
            waker,
        })
    }

    fn alloc_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn listener_port(&self, token: Token) -> Option<u16> {
        self.listeners.get(token.0).map(|entry| entry.port)
    }

    /// The bound address of the first configured listener. Mainly useful in
    /// tests that bind to port 0 and need the OS-assigned port back.
    pub fn local_addr(&self) -> SocketAddr {
        self.listeners[0]
            .listener
            .local_addr()
            .expect("listener always has a local address")
    }

    /// Runs until a fatal I/O error occurs. There is no external shutdown
    /// signal wired up here; an embedder wraps this in a thread and drops
    /// the `Server` to trigger the `Drop`-driven connection/DB teardown.
    pub fn run(&mut self) -> Result<()> {
        let mut events = Events::with_capacity(1024);
        loop {
            let timeout = self.timer.next_tick_ms().map(Duration::from_millis);
            self.poll.poll(&mut events, timeout).map_err(Error::Io)?;

            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    continue;
                }
                if let Some(port) = self.listener_port(token) {
                    self.accept_loop(token, port);
                    continue;
                }
                let errored = event.is_error() || event.is_read_closed();
                self.handle_connection_event(token, event.is_readable(), event.is_writable(), errored);
            }

            self.drain_signals();
            self.timer.tick();
        }
    }

    fn accept_loop(&mut self, token: Token, port: u16) {
        let edge_triggered = self.config.listener_trigger.is_edge_triggered();
        loop {
            let accepted = self.listeners[token.0].listener.accept();
            match accepted {
                Ok((stream, addr)) => {
                    if self.connections.len() >= MAX_FD {
                        proxy_log::warn!("connection limit reached, rejecting {addr}");
                        continue;
                    }
                    if let Err(e) = self.register_connection(stream, addr, port) {
                        proxy_log::error!("failed to register connection from {addr}: {e}");
                    }
                    if !edge_triggered {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    proxy_log::error!("accept error on listener: {e}");
                    break;
                }
            }
        }
    }

    fn register_connection(&mut self, stream: TcpStream, addr: SocketAddr, port: u16) -> Result<()> {
        let mut conn = HttpConnection::init(stream, addr, port);
        let token = self.alloc_token();
        self.poll
            .registry()
            .register(&mut conn.stream, token, Interest::READABLE)
            .map_err(Error::Io)?;

        CONNECTION_COUNT.fetch_add(1, Ordering::SeqCst);
        self.connections.insert(token, Arc::new(Mutex::new(conn)));

        let tx = self.signal_tx.clone();
        let waker = Arc::clone(&self.waker);
        self.timer.add(
            token.0,
            Duration::from_millis(self.config.idle_timeout_ms),
            Box::new(move || {
                let _ = tx.send(WorkerSignal::Close { token });
                let _ = waker.wake();
            }),
        );
        Ok(())
    }

    fn handle_connection_event(&mut self, token: Token, readable: bool, writable: bool, errored: bool) {
        let Some(conn) = self.connections.get(&token).cloned() else {
            return;
        };

        if errored {
            self.close_connection(token);
            return;
        }

        self.timer
            .adjust(token.0, Duration::from_millis(self.config.idle_timeout_ms));

        if readable {
            self.dispatch_read(token, conn.clone());
        }
        if writable {
            self.dispatch_write(token, conn);
        }
    }

    fn dispatch_read(&self, token: Token, conn: Arc<Mutex<HttpConnection>>) {
        let tx = self.signal_tx.clone();
        let waker = Arc::clone(&self.waker);
        let config = Arc::clone(&self.config);
        let db = self.db_pool.clone();
        let edge_triggered = config.connection_trigger.is_edge_triggered();

        self.worker_pool.submit(move || {
            let outcome = {
                let mut guard = conn.lock().unwrap();
                guard.read_socket(edge_triggered)
            };

            let signal = match outcome {
                Err(_) => WorkerSignal::Close { token },
                Ok(read) if read.eof => WorkerSignal::Close { token },
                Ok(_) => {
                    let ready = {
                        let mut guard = conn.lock().unwrap();
                        guard.process(&config, db.as_deref())
                    };
                    let interest = if ready { Interest::WRITABLE } else { Interest::READABLE };
                    WorkerSignal::Rearm { token, interest }
                }
            };
            let _ = tx.send(signal);
            let _ = waker.wake();
        });
    }

    fn dispatch_write(&self, token: Token, conn: Arc<Mutex<HttpConnection>>) {
        let tx = self.signal_tx.clone();
        let waker = Arc::clone(&self.waker);
        let edge_triggered = self.config.connection_trigger.is_edge_triggered();

        self.worker_pool.submit(move || {
            let result = {
                let mut guard = conn.lock().unwrap();
                guard.write_socket(edge_triggered)
            };

            let signal = match result {
                Err(_) => WorkerSignal::Close { token },
                Ok(_) => {
                    let mut guard = conn.lock().unwrap();
                    if guard.to_write_bytes() > 0 {
                        WorkerSignal::Rearm { token, interest: Interest::WRITABLE }
                    } else if guard.is_keep_alive() {
                        guard.reset_for_next_request();
                        WorkerSignal::Rearm { token, interest: Interest::READABLE }
                    } else {
                        WorkerSignal::Close { token }
                    }
                }
            };
            let _ = tx.send(signal);
            let _ = waker.wake();
        });
    }

    fn drain_signals(&mut self) {
        while let Ok(signal) = self.signal_rx.try_recv() {
            match signal {
                WorkerSignal::Rearm { token, interest } => self.rearm(token, interest),
                WorkerSignal::Close { token } => self.close_connection(token),
            }
        }
    }

    fn rearm(&mut self, token: Token, interest: Interest) {
        let Some(conn) = self.connections.get(&token) else {
            return;
        };
        let mut guard = conn.lock().unwrap();
        if guard.closed {
            drop(guard);
            self.close_connection(token);
            return;
        }
        let failed = self
            .poll
            .registry()
            .reregister(&mut guard.stream, token, interest)
            .is_err();
        drop(guard);
        if failed {
            self.close_connection(token);
        }
    }

    fn close_connection(&mut self, token: Token) {
        self.timer.cancel(token.0);
        if let Some(conn) = self.connections.remove(&token) {
            let mut guard = conn.lock().unwrap();
            let _ = self.poll.registry().deregister(&mut guard.stream);
            guard.close();
            CONNECTION_COUNT.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close_connection(token);
        }
        if let Some(pool) = &self.db_pool {
            pool.close();
        }
    }
}

/// Binds a non-blocking listener with `SO_REUSEADDR` set and, when
/// configured, a short `SO_LINGER` so a closing socket flushes its last
/// write instead of resetting the connection.
fn bind_listener(addr: SocketAddr, config: &Config) -> Result<std::net::TcpListener> {
    let socket = Socket::new(
        match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        },
        Type::STREAM,
        Some(Protocol::TCP),
    )
    .map_err(Error::Io)?;

    socket.set_reuse_address(true).map_err(Error::Io)?;
    if config.linger_on_close {
        socket
            .set_linger(Some(Duration::from_secs(1)))
            .map_err(Error::Io)?;
    }
    socket.set_nonblocking(true).map_err(Error::Io)?;
    socket.bind(&addr.into()).map_err(Error::Io)?;
    socket.listen(1024).map_err(Error::Io)?;
    Ok(socket.into())
}
