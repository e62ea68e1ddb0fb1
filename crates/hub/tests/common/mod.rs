//! Reusable test harness for relay-hub integration tests.
//!
//! Provides a scripted fake agent that speaks the framed TCP protocol from
//! a plain blocking thread, with its own frame encoder so the controller's
//! codec is checked against an independent implementation.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

// ── Message types (must match relay_hub::MessageKind) ───────────────

pub const MSG_PING: u32 = 0;
pub const MSG_CMD: u32 = 1;
pub const MSG_GET: u32 = 2;
pub const MSG_PUT: u32 = 3;
pub const MSG_HANDSHAKE: u32 = 4;
pub const MSG_OUTPUT: u32 = 5;
pub const MSG_RESPONSE: u32 = 6;
pub const MSG_CONTENT: u32 = 7;
pub const MSG_CWD: u32 = 8;
pub const MSG_GET_CWD: u32 = 9;

pub const HEADER_LEN: usize = 4 + 8;
pub const DEFAULT_CWD: &str = "/home/agent";

// ── Frame encoding/decoding ─────────────────────────────────────────

/// `[4B type][8B base64 length][base64 payload]`
pub fn encode_frame(msg_type: u32, data: &[u8]) -> Vec<u8> {
    let encoded = STANDARD.encode(data);
    let mut frame = Vec::with_capacity(HEADER_LEN + encoded.len());
    frame.extend_from_slice(&msg_type.to_be_bytes());
    frame.extend_from_slice(&(encoded.len() as u64).to_be_bytes());
    frame.extend_from_slice(encoded.as_bytes());
    frame
}

#[derive(Clone, Debug)]
pub struct Frame {
    pub msg_type: u32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Pull one frame off the front of `buf`, if it holds a complete one.
fn take_frame(buf: &mut Vec<u8>) -> Option<Frame> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let msg_type = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&buf[4..HEADER_LEN]);
    let len = u64::from_be_bytes(len_bytes) as usize;
    if buf.len() < HEADER_LEN + len {
        return None;
    }
    let data = STANDARD
        .decode(&buf[HEADER_LEN..HEADER_LEN + len])
        .expect("controller sent invalid base64");
    buf.drain(..HEADER_LEN + len);
    Some(Frame { msg_type, data })
}

// ── SocketClient ────────────────────────────────────────────────────

/// Blocking TCP client with frame-level read/write.
pub struct SocketClient {
    stream: TcpStream,
    read_buf: Vec<u8>,
}

impl SocketClient {
    pub fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).expect("failed to connect to controller");
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }

    pub fn send_frame(&mut self, msg_type: u32, data: &[u8]) -> io::Result<()> {
        self.stream.write_all(&encode_frame(msg_type, data))
    }

    pub fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes)
    }

    /// Read the next frame, waiting at most `timeout` (forever if `None`).
    /// Returns None on timeout or disconnect.
    pub fn recv_frame(&mut self, timeout: Option<Duration>) -> Option<Frame> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(frame) = take_frame(&mut self.read_buf) {
                return Some(frame);
            }

            let read_timeout = match deadline {
                Some(deadline) => {
                    if Instant::now() > deadline {
                        return None;
                    }
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    Some(remaining.max(Duration::from_millis(50)))
                }
                None => None,
            };
            self.stream.set_read_timeout(read_timeout).ok();

            let mut buf = [0u8; 65536];
            match self.stream.read(&mut buf) {
                Ok(0) => return None, // disconnected
                Ok(n) => self.read_buf.extend_from_slice(&buf[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(ref e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return None,
            }
        }
    }

    /// True once the controller has closed its side of the connection.
    pub fn is_closed_by_peer(&mut self, timeout: Duration) -> bool {
        self.stream.set_read_timeout(Some(timeout)).ok();
        let mut buf = [0u8; 1024];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => continue,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    return false
                }
                Err(_) => return true,
            }
        }
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.stream.local_addr().expect("failed to read local addr")
    }

    fn try_clone_stream(&self) -> TcpStream {
        self.stream.try_clone().expect("failed to clone agent stream")
    }
}

// ── FakeAgent ───────────────────────────────────────────────────────

/// Configuration for a scripted agent.
pub struct FakeAgent {
    label: String,
    cwd: String,
    files: HashMap<String, Vec<u8>>,
}

impl FakeAgent {
    pub fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            cwd: DEFAULT_CWD.to_string(),
            files: HashMap::new(),
        }
    }

    pub fn file(mut self, path: &str, content: &[u8]) -> Self {
        self.files.insert(path.to_string(), content.to_vec());
        self
    }

    /// Connect, identify, and serve requests from a background thread.
    pub fn connect(self, addr: SocketAddr) -> AgentHandle {
        let mut client = SocketClient::connect(addr);
        client
            .send_frame(MSG_HANDSHAKE, self.label.as_bytes())
            .expect("failed to send handshake");

        let local_addr = client.local_addr();
        let control = client.try_clone_stream();
        let received = Arc::new(Mutex::new(Vec::new()));
        let files = Arc::new(Mutex::new(self.files));

        let thread = {
            let received = Arc::clone(&received);
            let files = Arc::clone(&files);
            let cwd = self.cwd;
            thread::spawn(move || serve(client, cwd, files, received))
        };

        AgentHandle {
            label: self.label,
            local_addr,
            control,
            received,
            files,
            thread: Some(thread),
        }
    }
}

fn serve(
    mut client: SocketClient,
    mut cwd: String,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    received: Arc<Mutex<Vec<Frame>>>,
) {
    while let Some(frame) = client.recv_frame(None) {
        received.lock().unwrap().push(frame.clone());
        let sent = match frame.msg_type {
            MSG_GET_CWD => client.send_frame(MSG_GET_CWD, cwd.as_bytes()),
            MSG_CWD => {
                let target = frame.text();
                cwd = if target.starts_with('/') {
                    target
                } else {
                    format!("{}/{}", cwd.trim_end_matches('/'), target)
                };
                Ok(())
            }
            MSG_CMD => {
                let reply = serde_json::json!([0, format!("{}\n", frame.text())]);
                client.send_frame(MSG_OUTPUT, reply.to_string().as_bytes())
            }
            MSG_GET => {
                let content = files.lock().unwrap().get(&frame.text()).cloned();
                match content {
                    Some(content) => client
                        .send_frame(MSG_RESPONSE, b"1")
                        .and_then(|_| client.send_frame(MSG_CONTENT, &content)),
                    None => client.send_frame(MSG_RESPONSE, b"0"),
                }
            }
            MSG_PUT => match client.recv_frame(None) {
                Some(content) if content.msg_type == MSG_CONTENT => {
                    received.lock().unwrap().push(content.clone());
                    files.lock().unwrap().insert(frame.text(), content.data);
                    Ok(())
                }
                _ => return,
            },
            _ => Ok(()), // PING and anything unexpected
        };
        if sent.is_err() {
            return;
        }
    }
}

// ── AgentHandle ─────────────────────────────────────────────────────

/// Handle to a running fake agent. Disconnects and joins on drop.
pub struct AgentHandle {
    pub label: String,
    pub local_addr: SocketAddr,
    control: TcpStream,
    received: Arc<Mutex<Vec<Frame>>>,
    files: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    thread: Option<JoinHandle<()>>,
}

impl AgentHandle {
    /// Port the controller sees this agent connecting from.
    pub fn port_label(&self) -> String {
        self.local_addr.port().to_string()
    }

    pub fn received(&self) -> Vec<Frame> {
        self.received.lock().unwrap().clone()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    /// Wait until a frame of `msg_type` has been received.
    pub fn wait_for_message(&self, msg_type: u32, timeout: Duration) -> Option<Frame> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(frame) = self
                .received()
                .into_iter()
                .find(|frame| frame.msg_type == msg_type)
            {
                return Some(frame);
            }
            if Instant::now() > deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }

    /// Drop the connection the way a crashed agent would.
    pub fn disconnect(&mut self) {
        let _ = self.control.shutdown(Shutdown::Both);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// Poll `check` until it returns true or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
