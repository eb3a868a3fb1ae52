//! UDP receive loop feeding the jitter buffer
//!
//! The receiver runs a current-thread tokio runtime on its own thread.
//! Every accepted datagram is decoded straight into the buffer's tail slot.
//! An idle timer, re-armed by each datagram, closes and rebinds the socket
//! when the stream stalls; the jitter buffer keeps draining meanwhile.

use parking_lot::Mutex;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::audio::buffer::SharedPacketBuffer;
use crate::config::NetworkConfig;
use crate::constants::MAX_DATAGRAM_SIZE;
use crate::error::NetworkError;
use crate::network::packet::{Framing, SequenceTracker};
use crate::network::udp::create_socket;

/// Receiver counters, shared with diagnostics
#[derive(Debug, Default)]
struct Counters {
    packets_received: AtomicU64,
    bytes_received: AtomicU64,
    discarded: AtomicU64,
    restarts: AtomicU64,
    sequence_gaps: AtomicU64,
    idle: AtomicBool,
}

/// Receiver statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReceiverStats {
    pub packets_received: u64,
    pub bytes_received: u64,
    /// Datagrams of the wrong size
    pub discarded: u64,
    /// Socket restarts after a stall or error
    pub restarts: u64,
    /// Packets missing from the RTP sequence
    pub sequence_gaps: u64,
    /// No datagram within the idle timeout
    pub idle: bool,
}

struct Running {
    shutdown: watch::Sender<bool>,
    thread: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Network producer for the packet buffer
pub struct NetworkReceiver {
    buffer: SharedPacketBuffer,
    config: NetworkConfig,
    counters: Arc<Counters>,
    running: Mutex<Option<Running>>,
}

impl NetworkReceiver {
    pub fn new(buffer: SharedPacketBuffer, config: NetworkConfig) -> Self {
        Self {
            buffer,
            config,
            counters: Arc::new(Counters::default()),
            running: Mutex::new(None),
        }
    }

    /// Bind the socket and start the receive thread.
    ///
    /// Binding happens before this returns, so a taken port fails here.
    pub fn start(&self) -> Result<(), NetworkError> {
        let mut running = self.running.lock();
        if running.is_some() {
            return Ok(());
        }

        let addr = self
            .config
            .socket_addr()
            .map_err(|e| NetworkError::InvalidAddress(e.to_string()))?;
        let socket =
            create_socket(addr).map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .enable_time()
            .build()
            .map_err(|e| NetworkError::Thread(e.to_string()))?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let receive_loop = ReceiveLoop {
            buffer: self.buffer.clone(),
            framing: Framing::new(self.config.header_bytes, self.config.mtu),
            idle_timeout: Duration::from_millis(self.config.idle_timeout_ms),
            local_addr,
            counters: self.counters.clone(),
            sequence: SequenceTracker::default(),
        };

        let thread = thread::Builder::new()
            .name("net-receiver".into())
            .spawn(move || runtime.block_on(receive_loop.run(socket, shutdown_rx)))
            .map_err(|e| NetworkError::Thread(e.to_string()))?;

        tracing::info!("Network receiver listening on {}", local_addr);

        *running = Some(Running {
            shutdown: shutdown_tx,
            thread,
            local_addr,
        });
        Ok(())
    }

    /// Stop the receive thread and close the socket. Safe to call from
    /// any thread and more than once.
    pub fn stop(&self) {
        let running = self.running.lock().take();
        if let Some(running) = running {
            let _ = running.shutdown.send(true);
            if running.thread.join().is_err() {
                tracing::error!("Network receiver thread panicked");
            }
            tracing::info!("Network receiver on {} stopped", running.local_addr);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Address actually bound, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    pub fn packets_received(&self) -> u64 {
        self.counters.packets_received.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> ReceiverStats {
        let c = &self.counters;
        ReceiverStats {
            packets_received: c.packets_received.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            discarded: c.discarded.load(Ordering::Relaxed),
            restarts: c.restarts.load(Ordering::Relaxed),
            sequence_gaps: c.sequence_gaps.load(Ordering::Relaxed),
            idle: c.idle.load(Ordering::Relaxed),
        }
    }
}

impl Drop for NetworkReceiver {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Why a socket's receive cycle ended
enum Exit {
    Shutdown,
    Stalled,
    Failed(io::Error),
}

/// State owned by the receive thread
struct ReceiveLoop {
    buffer: SharedPacketBuffer,
    framing: Framing,
    idle_timeout: Duration,
    local_addr: SocketAddr,
    counters: Arc<Counters>,
    sequence: SequenceTracker,
}

impl ReceiveLoop {
    async fn run(mut self, socket: std::net::UdpSocket, mut shutdown: watch::Receiver<bool>) {
        let mut socket = match UdpSocket::from_std(socket) {
            Ok(socket) => Some(socket),
            Err(e) => {
                tracing::warn!("Failed to register socket: {}", e);
                None
            }
        };
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

        loop {
            let exit = match &socket {
                Some(socket) => self.receive(socket, &mut buf, &mut shutdown).await,
                None => Exit::Failed(io::Error::from(io::ErrorKind::NotConnected)),
            };

            match exit {
                Exit::Shutdown => break,
                Exit::Stalled => {
                    if !self.counters.idle.swap(true, Ordering::Relaxed) {
                        tracing::info!(
                            "No audio for {:?} on {}, restarting socket",
                            self.idle_timeout,
                            self.local_addr
                        );
                    } else {
                        tracing::debug!("Still idle on {}, restarting socket", self.local_addr);
                    }
                }
                Exit::Failed(e) => {
                    tracing::warn!("Receive on {} failed: {}", self.local_addr, e);
                    if !pause(self.idle_timeout, &mut shutdown).await {
                        break;
                    }
                }
            }

            // Close before rebinding the same port
            drop(socket.take());
            match self.rebind(&mut shutdown).await {
                Some(fresh) => socket = Some(fresh),
                None => break,
            }
        }

        tracing::debug!("Receive loop on {} exiting", self.local_addr);
    }

    /// Receive until shutdown, stall or socket error
    async fn receive(
        &mut self,
        socket: &UdpSocket,
        buf: &mut [u8],
        shutdown: &mut watch::Receiver<bool>,
    ) -> Exit {
        // Only accepted packets push the deadline back
        let mut deadline = Instant::now() + self.idle_timeout;
        loop {
            if *shutdown.borrow() {
                return Exit::Shutdown;
            }

            let received = tokio::select! {
                _ = shutdown.changed() => return Exit::Shutdown,
                result = tokio::time::timeout_at(deadline, socket.recv_from(buf)) => result,
            };

            match received {
                Err(_elapsed) => return Exit::Stalled,
                Ok(Ok((len, _from))) => {
                    if self.handle_datagram(&buf[..len]) {
                        deadline = Instant::now() + self.idle_timeout;
                    }
                }
                Ok(Err(e)) => return Exit::Failed(e),
            }
        }
    }

    /// Decode into the buffer. Returns false for a discarded datagram.
    fn handle_datagram(&mut self, datagram: &[u8]) -> bool {
        let Some(payload) = self.framing.payload(datagram) else {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(
                "Discarding {} byte datagram, expected {}",
                datagram.len(),
                self.framing.datagram_bytes()
            );
            return false;
        };

        if !self.buffer.acquire_write_tail().fill_from_le_bytes(payload) {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        self.buffer.commit_write_tail();

        if let Some(sequence) = self.framing.sequence(datagram) {
            let gap = self.sequence.observe(sequence);
            if gap > 0 {
                self.counters.sequence_gaps.fetch_add(gap, Ordering::Relaxed);
            }
        }

        self.counters.packets_received.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_received
            .fetch_add(datagram.len() as u64, Ordering::Relaxed);

        if self.counters.idle.swap(false, Ordering::Relaxed) {
            tracing::info!("Audio stream on {} resumed", self.local_addr);
        }
        true
    }

    /// Bind the same local address again, retrying once per idle timeout.
    /// Returns `None` on shutdown.
    async fn rebind(&self, shutdown: &mut watch::Receiver<bool>) -> Option<UdpSocket> {
        loop {
            if *shutdown.borrow() {
                return None;
            }

            match create_socket(self.local_addr).and_then(UdpSocket::from_std) {
                Ok(socket) => {
                    self.counters.restarts.fetch_add(1, Ordering::Relaxed);
                    return Some(socket);
                }
                Err(e) => {
                    tracing::warn!("Rebinding {} failed: {}", self.local_addr, e);
                    if !pause(self.idle_timeout, shutdown).await {
                        return None;
                    }
                }
            }
        }
    }
}

/// Sleep unless shut down first. Returns false on shutdown.
async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = shutdown.changed() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::buffer::create_shared_buffer;

    fn config(idle_timeout_ms: u64) -> NetworkConfig {
        NetworkConfig {
            bind_address: "127.0.0.1".into(),
            udp_port: 0,
            mtu: 8,
            header_bytes: 12,
            idle_timeout_ms,
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn test_start_stop_idempotent() {
        let buffer = create_shared_buffer(4, 4);
        let receiver = NetworkReceiver::new(buffer, config(1000));
        assert!(receiver.start().is_ok());
        let addr = receiver.local_addr().unwrap();
        assert!(receiver.start().is_ok());
        assert_eq!(receiver.local_addr(), Some(addr));

        receiver.stop();
        receiver.stop();
        assert!(!receiver.is_running());
    }

    #[test]
    fn test_bind_failure_reported() {
        let taken = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut cfg = config(1000);
        cfg.udp_port = taken.local_addr().unwrap().port();

        let receiver = NetworkReceiver::new(create_shared_buffer(4, 4), cfg);
        assert!(matches!(receiver.start(), Err(NetworkError::BindFailed(_))));
        assert!(!receiver.is_running());
    }

    #[test]
    fn test_receives_and_discards() {
        let buffer = create_shared_buffer(4, 4);
        let receiver = NetworkReceiver::new(buffer.clone(), config(1000));
        receiver.start().unwrap();
        let addr = receiver.local_addr().unwrap();

        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut datagram = vec![0x80, 127, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0];
        datagram.extend_from_slice(&[1, 0, 2, 0, 3, 0, 4, 0]);
        sender.send_to(&datagram[..15], addr).unwrap();
        sender.send_to(&datagram, addr).unwrap();

        assert!(wait_for(|| receiver.packets_received() == 1));
        assert_eq!(buffer.peek_read_head().unwrap().to_vec(), vec![1, 2, 3, 4]);
        assert!(wait_for(|| receiver.stats().discarded == 1));
        assert_eq!(buffer.size(), 1);
    }

    #[test]
    fn test_discarded_datagrams_do_not_hold_off_restart() {
        let receiver = NetworkReceiver::new(create_shared_buffer(4, 4), config(300));
        receiver.start().unwrap();
        let addr = receiver.local_addr().unwrap();
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();

        // Wrong-size traffic every 10ms, well inside the idle timeout
        let restarted = wait_for(|| {
            let _ = sender.send_to(&[0u8; 5], addr);
            receiver.stats().restarts >= 1
        });
        assert!(restarted);
        let stats = receiver.stats();
        assert_eq!(stats.packets_received, 0);
        assert!(stats.discarded > 0);
    }

    #[test]
    fn test_stop_while_reading_is_prompt() {
        let receiver = NetworkReceiver::new(create_shared_buffer(4, 4), config(60_000));
        receiver.start().unwrap();
        thread::sleep(Duration::from_millis(20));

        let started = std::time::Instant::now();
        receiver.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
