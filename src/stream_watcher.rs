// jobsentry: framed stream watcher — delivers byte blobs from a FIFO, a TCP
// listener, or a tailed file to a callback, via edge-triggered readiness

// ACCEPTABLE: Mutex poisoning .expect() is allowed in this module (unrecoverable error)
#![allow(clippy::expect_used)]

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::ffi::CString;
use std::fs::File;
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub type FrameCallback = Box<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Debug, Clone)]
pub enum WatcherKind {
    Tcp { host: String, port: u16 },
    Fifo { path: PathBuf },
    File { path: PathBuf },
}

const LISTENER_TOKEN: Token = Token(0);
const SOURCE_TOKEN: Token = Token(1);
const READ_CHUNK: usize = 4096;
const FIRST_PEER_TOKEN: usize = 2;

enum Source {
    Listener(TcpListener),
    Fifo(File),
    Tailed(File),
}

/// Single-thread event loop backed by an epoll poller. A TCP source accepts
/// new peer connections and registers each edge-triggered; FIFO and tailed
/// file sources are read directly on their own fixed token.
pub struct StreamWatcher {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl StreamWatcher {
    pub fn start(kind: WatcherKind, callback: FrameCallback) -> std::io::Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);

        let mut poll = Poll::new()?;
        let mut source = open_source(&kind)?;
        register_source(&mut poll, &mut source)?;

        let thread = std::thread::spawn(move || {
            let mut events = Events::with_capacity(64);
            let mut peers: HashMap<Token, TcpStream> = HashMap::new();
            let mut next_token = FIRST_PEER_TOKEN;

            while !stop_for_thread.load(Ordering::SeqCst) {
                match poll.poll(&mut events, Some(Duration::from_millis(200))) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        tracing::warn!(error = %e, "stream watcher: poll failed");
                        continue;
                    }
                }

                for event in events.iter() {
                    match event.token() {
                        LISTENER_TOKEN => {
                            if let Source::Listener(listener) = &mut source {
                                accept_new_peers(listener, &mut poll, &mut peers, &mut next_token);
                            }
                        }
                        SOURCE_TOKEN => match &mut source {
                            Source::Fifo(file) => {
                                if read_available(file, &callback) {
                                    // All writers closed: a FIFO delivers
                                    // EOF once its last writer disconnects,
                                    // even though more writers may open it
                                    // later. Reopen so the watcher keeps
                                    // delivering frames to future writers.
                                    if let Err(e) = reopen_fifo(&kind, &mut poll, &mut source) {
                                        tracing::warn!(error = %e, "stream watcher: failed to reopen fifo after EOF");
                                    }
                                }
                            }
                            Source::Tailed(file) => {
                                read_available(file, &callback);
                            }
                            Source::Listener(_) => {}
                        },
                        token => {
                            service_peer(token, &mut peers, &callback);
                        }
                    }
                }
            }
        });

        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StreamWatcher {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.stop();
        }
    }
}

fn accept_new_peers(
    listener: &mut TcpListener,
    poll: &mut Poll,
    peers: &mut HashMap<Token, TcpStream>,
    next_token: &mut usize,
) {
    loop {
        match listener.accept() {
            Ok((mut stream, _addr)) => {
                let token = Token(*next_token);
                *next_token += 1;
                if poll
                    .registry()
                    .register(&mut stream, token, Interest::READABLE)
                    .is_ok()
                {
                    peers.insert(token, stream);
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(_) => break,
        }
    }
}

fn service_peer(token: Token, peers: &mut HashMap<Token, TcpStream>, callback: &FrameCallback) {
    let Some(stream) = peers.get_mut(&token) else {
        return;
    };
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => {
                peers.remove(&token);
                break;
            }
            Ok(n) => callback(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(_) => {
                peers.remove(&token);
                break;
            }
        }
    }
}

/// Reads every currently-available chunk, delivering each to `callback` as
/// its own buffer. Returns `true` if the stream hit EOF (`read` returned 0).
fn read_available(file: &mut File, callback: &FrameCallback) -> bool {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match file.read(&mut buf) {
            Ok(0) => return true,
            Ok(n) => callback(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return false,
            Err(_) => return false,
        }
    }
}

/// Deregisters the stale fd, reopens the FIFO read-only/non-blocking, and
/// re-registers it on the same token.
fn reopen_fifo(kind: &WatcherKind, poll: &mut Poll, source: &mut Source) -> std::io::Result<()> {
    let WatcherKind::Fifo { path } = kind else {
        return Ok(());
    };
    if let Source::Fifo(old) = source {
        let fd = old.as_raw_fd();
        let mut source_fd = mio::unix::SourceFd(&fd);
        let _ = poll.registry().deregister(&mut source_fd);
    }
    let c_path = path_to_cstring(path)?;
    let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY | libc::O_NONBLOCK) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let new_file = unsafe { File::from_raw_fd(fd) };
    let new_fd = new_file.as_raw_fd();
    let mut source_fd = mio::unix::SourceFd(&new_fd);
    poll.registry().register(&mut source_fd, SOURCE_TOKEN, Interest::READABLE)?;
    *source = Source::Fifo(new_file);
    Ok(())
}

fn open_source(kind: &WatcherKind) -> std::io::Result<Source> {
    match kind {
        WatcherKind::Tcp { host, port } => {
            let addr = if host == "*" {
                format!("0.0.0.0:{port}")
            } else {
                format!("{host}:{port}")
            };
            let socket_addr = addr
                .parse()
                .map_err(|_| std::io::Error::new(ErrorKind::InvalidInput, "invalid bind address"))?;
            let listener = TcpListener::bind(socket_addr)?;
            Ok(Source::Listener(listener))
        }
        WatcherKind::Fifo { path } => {
            if let Err(e) = make_fifo(path) {
                if e.kind() != ErrorKind::AlreadyExists {
                    return Err(e);
                }
            }
            let c_path = path_to_cstring(path)?;
            let fd = unsafe { libc::open(c_path.as_ptr(), libc::O_RDONLY | libc::O_NONBLOCK) };
            if fd < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(Source::Fifo(unsafe { File::from_raw_fd(fd) }))
        }
        WatcherKind::File { path } => {
            let file = File::open(path)?;
            let mut file = file;
            file.seek(SeekFrom::End(0))?;
            set_nonblocking(&file)?;
            Ok(Source::Tailed(file))
        }
    }
}

fn register_source(poll: &mut Poll, source: &mut Source) -> std::io::Result<()> {
    match source {
        Source::Listener(listener) => {
            poll.registry().register(listener, LISTENER_TOKEN, Interest::READABLE)
        }
        Source::Fifo(file) | Source::Tailed(file) => {
            let fd = file.as_raw_fd();
            let mut source_fd = mio::unix::SourceFd(&fd);
            poll.registry().register(&mut source_fd, SOURCE_TOKEN, Interest::READABLE)
        }
    }
}

fn make_fifo(path: &Path) -> std::io::Result<()> {
    let c_path = path_to_cstring(path)?;
    let result = unsafe { libc::mkfifo(c_path.as_ptr(), 0o644) };
    if result != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn set_nonblocking(file: &File) -> std::io::Result<()> {
    let fd = file.as_raw_fd();
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let result = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if result < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn path_to_cstring(path: &Path) -> std::io::Result<CString> {
    CString::new(path.to_string_lossy().as_bytes())
        .map_err(|_| std::io::Error::new(ErrorKind::InvalidInput, "path contains NUL byte"))
}
