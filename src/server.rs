//! The dispatcher: accept connections and serve each one in a forked handler process.
//!
//! Every handler runs a single request/response exchange and exits. The dispatcher never waits
//! for handlers; `SIGCHLD` is ignored so the kernel reaps them.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::time::TimeVal;
use nix::unistd::{close, fork, ForkResult};

use crate::answer::Answerer;
use crate::http::{
    head_length, parse_request_line, request_line, Body, ClfDate, LogEncoded, Response, Status,
    MAX_REQUEST_LENGTH,
};

/// How long a client may stay silent while sending its request or receiving our reply.
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);

/// How often the dispatcher wakes up to look for a stop request.
const POLL_INTERVAL: libc::time_t = 1;

/// Bounds on draining unread request bytes before closing.
const LINGER_TIME: Duration = Duration::from_secs(1);
const LINGER_BYTES: usize = 1 << 16;

/// Number of the signal that asked us to stop, or 0.
static STOP_SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn stop_running(signal: libc::c_int) {
    STOP_SIGNAL.store(signal, Ordering::Relaxed);
}

fn stop_signal() -> Option<i32> {
    match STOP_SIGNAL.load(Ordering::Relaxed) {
        0 => None,
        signal => Some(signal),
    }
}

/// Set the dispositions the dispatcher relies on.
pub fn install_signal_handlers() -> Result<()> {
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGCHLD, SigHandler::SigIgn) }
        .context("failed to set SIGCHLD handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;
    Ok(())
}

/// Append-only access log shared by all handlers.
///
/// Each entry goes out in a single `write`, so entries from concurrent handlers never interleave.
#[derive(Debug)]
pub struct AccessLog {
    file: File,
}

impl AccessLog {
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        Ok(Self { file })
    }

    /// Add an exchange to the log in Common Log Format.
    fn log(&self, client: IpAddr, request: &str, status: Status, sent: u64, now: SystemTime) {
        let message = format!(
            "{} - - {} \"{}\" {} {}\n",
            client,
            ClfDate(now),
            LogEncoded(request),
            status.code(),
            sent
        );
        if let Err(e) = (&self.file).write_all(message.as_bytes()) {
            eprintln!("warning: failed to write log message: {}", e);
        }
    }
}

/// A bound listener plus everything a handler needs to answer requests.
#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    answerer: Answerer,
    log: AccessLog,
}

impl Server {
    pub fn new(listener: TcpListener, answerer: Answerer, log: AccessLog) -> Self {
        Self {
            listener,
            answerer,
            log,
        }
    }

    /// Accept and dispatch connections until SIGINT or SIGTERM arrives.
    ///
    /// Returns the number of the signal that stopped the server.
    pub fn run(self) -> Result<i32> {
        let listen_fd = self.listener.as_raw_fd();
        loop {
            if let Some(signal) = stop_signal() {
                return Ok(self.shutdown(signal));
            }

            let mut recv_set = FdSet::new();
            recv_set.insert(listen_fd);
            let mut timeout = TimeVal::from(libc::timeval {
                tv_sec: POLL_INTERVAL,
                tv_usec: 0,
            });
            match select(None, Some(&mut recv_set), None, None, Some(&mut timeout)) {
                Ok(0) => continue,
                Ok(_) => {}
                Err(e) => {
                    if e.as_errno() == Some(Errno::EINTR) {
                        continue; // interrupted by signal
                    }
                    return Err(e).context("select() failed");
                }
            }

            let (stream, addr) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) => {
                    eprintln!("warning: accept() failed: {}", e);
                    continue;
                }
            };

            match unsafe { fork() } {
                Ok(ForkResult::Child) => {
                    if let Err(e) = close(listen_fd) {
                        eprintln!("warning: failed to close listening socket: {}", e);
                    }
                    if let Err(e) = unsafe { signal(Signal::SIGCHLD, SigHandler::SigDfl) } {
                        eprintln!("warning: failed to reset SIGCHLD handler: {}", e);
                        std::process::exit(1);
                    }
                    self.handle_connection(stream, addr.ip());
                    std::process::exit(0);
                }
                Ok(ForkResult::Parent { .. }) => {}
                Err(e) => eprintln!("warning: fork() failed: {}", e),
            }
        }
    }

    /// The only place the dispatcher stops.
    fn shutdown(self, signal: i32) -> i32 {
        drop(self.listener);
        eprintln!("server stopped (signal {})", signal);
        signal
    }

    fn handle_connection(&self, mut stream: TcpStream, client: IpAddr) {
        if let Err(e) = stream
            .set_read_timeout(Some(IDLE_TIMEOUT))
            .and_then(|_| stream.set_write_timeout(Some(IDLE_TIMEOUT)))
        {
            eprintln!("warning: failed to set timeouts for {}: {}", client, e);
            return;
        }
        self.exchange(&mut stream, client);
        linger_close(&mut stream);
    }

    /// Read one request from `stream`, write the reply and log it.
    fn exchange<S: Read + Write>(&self, stream: &mut S, client: IpAddr) {
        let received = match receive(stream) {
            Ok(received) => received,
            Err(e) => {
                eprintln!("warning: failed to read request from {}: {}", client, e);
                return;
            }
        };
        let now = SystemTime::now();
        let (line, response) = match received {
            Received::Nothing => return,
            Received::TooLarge(head) => (
                request_line(&head).unwrap_or("-").to_string(),
                Response::error(Status::RequestHeaderFieldsTooLarge, now),
            ),
            Received::Head(head) => match request_line(&head) {
                Some(line) => {
                    let response = match parse_request_line(line) {
                        Some(request) => self.answerer.answer(&request, client, now),
                        None => Response::error(Status::BadRequest, now),
                    };
                    (line.to_string(), response)
                }
                None => ("-".to_string(), Response::error(Status::BadRequest, now)),
            },
        };

        let status = response.status;
        let sent = match send(stream, response, now) {
            Ok(sent) => sent,
            Err(e) => {
                eprintln!("warning: failed to send reply to {}: {}", client, e);
                0
            }
        };
        self.log.log(client, &line, status, sent, SystemTime::now());
    }
}

#[derive(Debug, PartialEq)]
enum Received {
    /// The client closed the connection without sending anything.
    Nothing,
    Head(Vec<u8>),
    TooLarge(Vec<u8>),
}

/// Read until the request head is complete (any body that arrived with it is dropped), the client stops sending, or the size limit is hit.
fn receive<R: Read>(stream: &mut R) -> io::Result<Received> {
    let mut head = Vec::with_capacity(MAX_REQUEST_LENGTH);
    let mut buf = [0; MAX_REQUEST_LENGTH];
    loop {
        let want = MAX_REQUEST_LENGTH - head.len();
        let n = match stream.read(&mut buf[..want]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if n == 0 {
            return Ok(if head.is_empty() {
                Received::Nothing
            } else {
                Received::Head(head)
            });
        }
        head.extend_from_slice(&buf[..n]);
        if let Some(len) = head_length(&head) {
            head.truncate(len);
            return Ok(Received::Head(head));
        }
        if head.len() >= MAX_REQUEST_LENGTH {
            return Ok(Received::TooLarge(head));
        }
    }
}

/// Write the reply and return the number of body bytes sent.
fn send<W: Write>(stream: &mut W, response: Response, now: SystemTime) -> io::Result<u64> {
    stream.write_all(response.head(now).as_bytes())?;
    let sent = match response.body {
        Body::Bytes(bytes) => {
            stream.write_all(&bytes)?;
            bytes.len() as u64
        }
        Body::File(file, len) => io::copy(&mut file.take(len), stream)?,
    };
    stream.flush()?;
    Ok(sent)
}

/// Close our side, then discard whatever the client is still sending so the reply is not lost
/// to a reset.
fn linger_close(stream: &mut TcpStream) {
    if stream.shutdown(Shutdown::Write).is_err()
        || stream.set_read_timeout(Some(LINGER_TIME)).is_err()
    {
        return;
    }
    let deadline = Instant::now() + LINGER_TIME;
    let mut drained = 0;
    let mut buf = [0; 4096];
    while drained < LINGER_BYTES && Instant::now() < deadline {
        match stream.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => drained += n,
        }
    }
}
