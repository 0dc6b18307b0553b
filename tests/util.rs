#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::{self, create_dir, File};
use std::io;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tempfile::{tempdir, TempDir};

pub const SERVER_BIN: &str = env!("CARGO_BIN_EXE_jailhttpd");
pub const HELPER_BIN: &str = env!("CARGO_BIN_EXE_jailhttpd-helper");

fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("127.0.0.1", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..5000 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(1));
    }
    false
}

/// Poll `condition` until it holds or `limit` passes.
pub fn eventually<F: FnMut() -> bool>(limit: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10));
    }
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

impl From<Child> for ScopedChild {
    fn from(child: Child) -> Self {
        ScopedChild(child)
    }
}

/// Write a config file into `dir` from `key = value` pairs.
pub fn write_config(dir: &Path, pairs: &[(&str, &str)]) -> PathBuf {
    let path = dir.join("jailhttpd.conf");
    let mut file = File::create(&path).expect("failed to create config file");
    for (key, value) in pairs {
        writeln!(file, "{} = {}", key, value).expect("failed to write config file");
    }
    path
}

/// A running server on a free port, serving `<tempdir>/www`.
pub struct Server {
    child: ScopedChild,
    port: u16,
    dir: TempDir,
}

impl Server {
    pub fn start() -> Self {
        Self::with_config(&[])
    }

    /// Start with the given settings on top of the defaults.
    pub fn with_config(extra: &[(&str, &str)]) -> Self {
        let dir = tempdir().expect("failed to create tempdir");
        create_dir(dir.path().join("www")).expect("failed to create www");

        // Get an unused port. Assumes the port won't be reused before the server starts.
        let port = get_unused_port().expect("failed to get unused port");
        let port_string = port.to_string();
        let home = dir.path().join("www");
        let log = dir.path().join("access.log");
        let mut pairs = vec![
            ("port", port_string.as_str()),
            ("addr", "127.0.0.1"),
            ("home", home.to_str().expect("path is not valid UTF-8")),
            ("log", log.to_str().expect("path is not valid UTF-8")),
        ];
        pairs.extend_from_slice(extra);
        let config = write_config(dir.path(), &pairs);

        let child = Command::new(SERVER_BIN)
            .arg(&config)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn jailhttpd")
            .into();

        // Create server early so it will be dropped if it fails to start.
        let server = Self { child, port, dir };
        assert!(wait_for_port(port), "failed to connect to jailhttpd");
        server
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn www(&self) -> PathBuf {
        self.dir.path().join("www")
    }

    pub fn pid(&self) -> u32 {
        self.child.0.id()
    }

    pub fn create_dir(&self, name: &str) {
        create_dir(self.www().join(name)).expect("failed to create directory");
    }

    pub fn create_file(&self, name: &str, contents: &[u8]) {
        fs::write(self.www().join(name), contents).expect("failed to create file");
    }

    /// Create an executable shell script, which the server treats as a CGI program.
    pub fn create_script(&self, name: &str, body: &str) {
        let path = self.www().join(name);
        fs::write(&path, format!("#!/bin/sh\n{}\n", body)).expect("failed to create script");
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))
            .expect("failed to make script executable");
    }

    pub fn log(&self) -> String {
        fs::read_to_string(self.dir.path().join("access.log")).unwrap_or_default()
    }

    pub fn stream(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("127.0.0.1", self.port)).expect("failed to connect to jailhttpd");
        // Set timeouts to prevent tests from hanging
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    pub fn get(&self, target: &str) -> Response {
        self.send(format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", target).as_bytes())
    }

    pub fn send(&self, request: &[u8]) -> Response {
        let mut stream = self.stream();
        stream.write_all(request).unwrap();
        Response::from_reader(&mut stream).expect("failed to read response")
    }

    /// Send `signal` and wait for the server to exit.
    pub fn stop(mut self, signal: Signal) -> Option<ExitStatus> {
        kill(Pid::from_raw(self.pid() as i32), signal).expect("failed to signal jailhttpd");
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(status) = self.child.0.try_wait().unwrap() {
                return Some(status);
            }
            sleep(Duration::from_millis(10));
        }
        None
    }
}

/// Pids of live processes whose parent is `pid`.
pub fn children_of(pid: u32) -> Vec<u32> {
    let mut children = Vec::new();
    for entry in fs::read_dir("/proc").unwrap().filter_map(|entry| entry.ok()) {
        let child: u32 = match entry.file_name().to_str().and_then(|name| name.parse().ok()) {
            Some(child) => child,
            None => continue,
        };
        let stat = match fs::read_to_string(entry.path().join("stat")) {
            Ok(stat) => stat,
            Err(_) => continue, // already gone
        };
        // The command name may contain spaces, so split after its closing parenthesis.
        let fields: Vec<&str> = match stat.rfind(')') {
            Some(end) => stat[end + 1..].split_whitespace().collect(),
            None => continue,
        };
        if fields.get(1) == Some(&pid.to_string().as_str()) {
            children.push(child);
        }
    }
    children
}

/// True if `pid` no longer runs (gone, or a zombie waiting to be reaped).
pub fn is_dead(pid: u32) -> bool {
    match fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => match stat.rfind(')') {
            Some(end) => stat[end + 1..].trim_start().starts_with('Z'),
            None => false,
        },
        Err(_) => true,
    }
}

/// HTTP Response from jailhttpd.
pub struct Response {
    response_line: String,
    headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
}

impl Response {
    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let response_line = Self::read_header(reader)?;
        let headers = Self::read_headers(reader)?;
        let body = headers
            .get("Content-Length")
            .map(|length| length.parse::<usize>().expect("invalid content length"))
            .map(|length| Self::read_body(reader, length))
            .transpose()?;
        Ok(Self {
            response_line,
            headers,
            body,
        })
    }
    fn read_headers<R: Read>(reader: &mut R) -> io::Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        loop {
            let header_line = Self::read_header(reader)?;
            if header_line.is_empty() {
                break;
            }
            let mut header = header_line.splitn(2, ": ");
            let key = header.next().expect("invalid header").to_string();
            let value = header.next().expect("invalid header").to_string();
            headers.insert(key, value);
        }
        Ok(headers)
    }
    fn read_header<R: Read>(reader: &mut R) -> io::Result<String> {
        read_until_slice(reader, b"\r\n")
            .map(|vec| String::from_utf8(vec).expect("response header is not valid UTF-8"))
    }
    fn read_body<R: Read>(reader: &mut R, content_length: usize) -> io::Result<Vec<u8>> {
        let mut body = vec![0; content_length];
        reader.read_exact(&mut body)?;
        Ok(body)
    }
    pub fn status(&self) -> &str {
        self.response_line
            .splitn(2, ' ')
            .nth(1)
            .expect("invalid response line")
    }
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|name| name.as_str())
    }
    pub fn text(&self) -> Option<&str> {
        self.body
            .as_ref()
            .map(|body| std::str::from_utf8(body).expect("body is not valid UTF-8"))
    }
}

fn read_until_slice<R: Read>(reader: &mut R, separator: &[u8]) -> io::Result<Vec<u8>> {
    let mut byte = [0; 1];
    let mut buf = Vec::new();
    loop {
        reader.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if buf.as_slice().ends_with(separator) {
            buf.truncate(buf.len() - separator.len());
            return Ok(buf);
        }
    }
}
