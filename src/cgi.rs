//! CGI program execution.
//!
//! Every invocation forks exactly one child whose standard output is a pipe back to us. The child
//! either execs the program directly or, when a jail is configured, execs the setuid helper which
//! confines itself and then execs the program staged inside the jail. The parent reads the pipe
//! against a hard deadline and kills the child's process group once it passes.

use std::ffi::{CString, OsStr};
use std::fs;
use std::net::IpAddr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::select::{select, FdSet};
use nix::sys::signal::{kill, killpg, signal, SigHandler, Signal};
use nix::sys::time::TimeVal;
use nix::sys::utsname::uname;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{
    access, close, dup2, execve, fork, getcwd, getpid, pipe2, read, setpgid, AccessFlags,
    ForkResult, Pid,
};
use thiserror::Error;

use crate::config::Jail;
use crate::SERVER_SOFTWARE;

const READ_SIZE: usize = 4096;
const REAP_INTERVAL: Duration = Duration::from_millis(2);
/// How long to wait for a killed child to disappear before leaving it to the system.
const KILL_GRACE: Duration = Duration::from_millis(100);

#[derive(Error, Debug)]
pub enum CgiError {
    #[error("{} is not executable", .0.display())]
    Forbidden(PathBuf),
    #[error("program did not finish within {0:?}")]
    Timeout(Duration),
    #[error("gateway error: {0}")]
    Gateway(String),
    #[error("failed to stage {} into {}", .program.display(), .jail.display())]
    Stage {
        program: PathBuf,
        jail: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{context}")]
    Sys {
        context: &'static str,
        #[source]
        source: nix::Error,
    },
}

fn sys(context: &'static str) -> impl FnOnce(nix::Error) -> CgiError {
    move |source| CgiError::Sys { context, source }
}

/// What the server knows about a request when it builds the CGI environment.
#[derive(Debug, Clone)]
pub struct RequestInfo<'a> {
    pub port: u16,
    /// Path of the program relative to the served root.
    pub script: &'a str,
    pub query: &'a str,
    pub remote_addr: IpAddr,
}

/// Ordered CGI variables passed to the program as its entire environment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CgiEnvironment(Vec<(String, String)>);

impl CgiEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// The standard CGI/1.1 variables for a request served from the current directory.
    pub fn for_request(request: &RequestInfo) -> Result<Self, CgiError> {
        let cwd = getcwd().map_err(sys("failed to get working directory"))?;
        let mut env = Self::new();
        env.set("SERVER_SOFTWARE", SERVER_SOFTWARE);
        env.set("SERVER_NAME", uname().nodename());
        env.set("GATEWAY_INTERFACE", "CGI/1.1");
        env.set("SERVER_PROTOCOL", "HTTP/1.1");
        env.set("SERVER_PORT", &request.port.to_string());
        env.set("REQUEST_METHOD", "GET");
        env.set("PATH_INFO", "");
        env.set("PATH_TRANSLATED", &cwd.to_string_lossy());
        env.set("SCRIPT_NAME", &format!("/{}", request.script));
        env.set("QUERY_STRING", request.query);
        env.set("REMOTE_ADDR", &request.remote_addr.to_string());
        Ok(env)
    }

    /// Set a variable, replacing any previous value in place.
    pub fn set(&mut self, name: &str, value: &str) {
        match self.0.iter_mut().find(|(key, _)| key == name) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.0.push((name.to_string(), value.to_string())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    fn to_envp(&self) -> Result<Vec<CString>, CgiError> {
        self.0
            .iter()
            .map(|(key, value)| {
                CString::new(format!("{}={}", key, value))
                    .map_err(|_| CgiError::Gateway(format!("NUL byte in {}", key)))
            })
            .collect()
    }
}

/// Run `program` with `environment` and return everything it wrote to standard output.
///
/// With a jail the program is first copied into the jail directory and then started through the
/// privilege helper as `helper <user> <jail> <name>`.
pub fn execute(
    program: &Path,
    environment: &CgiEnvironment,
    jail: Option<&Jail>,
    timeout: Duration,
) -> Result<Vec<u8>, CgiError> {
    if access(program, AccessFlags::X_OK).is_err() {
        return Err(CgiError::Forbidden(program.to_path_buf()));
    }
    let deadline = Instant::now() + timeout;

    let argv = match jail {
        None => vec![c_string(program.as_os_str())?],
        Some(jail) => {
            let name = stage(program, &jail.dir)?;
            vec![
                c_string(jail.helper.as_os_str())?,
                c_string(OsStr::new(&jail.user))?,
                c_string(jail.dir.as_os_str())?,
                c_string(&name)?,
            ]
        }
    };
    let envp = environment.to_envp()?;

    let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC).map_err(sys("failed to create pipe"))?;
    let read_end = PipeEnd(read_end);
    let write_end = PipeEnd(write_end);

    let child = match unsafe { fork() } {
        Ok(ForkResult::Child) => exec_child(read_end.0, write_end.0, &argv, &envp),
        Ok(ForkResult::Parent { child }) => child,
        Err(e) => return Err(sys("failed to fork")(e)),
    };
    // Also done by the child; whichever runs first wins the race against killpg().
    setpgid(child, child).ok();
    drop(write_end);

    match capture(read_end.0, deadline) {
        Ok(output) => {
            drop(read_end);
            match reap(child, deadline) {
                Reaped::Exited(0) | Reaped::Gone => Ok(output),
                Reaped::Exited(code) => Err(CgiError::Gateway(format!(
                    "{} exited with status {}",
                    argv[0].to_string_lossy(),
                    code
                ))),
                Reaped::Signaled(signal) => Err(CgiError::Gateway(format!(
                    "{} killed by {:?}",
                    argv[0].to_string_lossy(),
                    signal
                ))),
                Reaped::Running => {
                    terminate(child);
                    Err(CgiError::Timeout(timeout))
                }
                Reaped::Failed(e) => {
                    terminate(child);
                    Err(sys("failed to wait for program")(e))
                }
            }
        }
        Err(Capture::TimedOut) => {
            terminate(child);
            Err(CgiError::Timeout(timeout))
        }
        Err(Capture::Failed(e)) => {
            terminate(child);
            Err(sys("failed to read program output")(e))
        }
    }
}

/// Copy `program` into `jail` under its own file name and return that name.
///
/// The copy is written under a per-process temporary name and renamed into place, so a program
/// that is being executed by a concurrent request is replaced rather than rewritten.
pub fn stage(program: &Path, jail: &Path) -> Result<std::ffi::OsString, CgiError> {
    let stage_error = |source: std::io::Error| CgiError::Stage {
        program: program.to_path_buf(),
        jail: jail.to_path_buf(),
        source,
    };
    let name = program
        .file_name()
        .ok_or_else(|| stage_error(std::io::ErrorKind::InvalidInput.into()))?;
    let mut temporary = std::ffi::OsString::from(".");
    temporary.push(name);
    temporary.push(format!(".{}", getpid()));
    let temporary = jail.join(temporary);

    if let Err(e) = fs::copy(program, &temporary).and_then(|_| fs::rename(&temporary, jail.join(name)))
    {
        fs::remove_file(&temporary).ok();
        return Err(stage_error(e));
    }
    Ok(name.to_os_string())
}

fn c_string(s: &OsStr) -> Result<CString, CgiError> {
    CString::new(s.as_bytes())
        .map_err(|_| CgiError::Gateway(format!("NUL byte in {}", s.to_string_lossy())))
}

/// Closes the descriptor when dropped.
struct PipeEnd(RawFd);

impl Drop for PipeEnd {
    fn drop(&mut self) {
        if let Err(e) = close(self.0) {
            eprintln!("warning: failed to close pipe: {}", e);
        }
    }
}

/// Runs in the forked child. Only async-signal-safe calls from here to exec.
fn exec_child(read_end: RawFd, write_end: RawFd, argv: &[CString], envp: &[CString]) -> ! {
    setpgid(Pid::from_raw(0), Pid::from_raw(0)).ok();
    let ready = close(read_end).is_ok()
        && dup2(write_end, libc::STDOUT_FILENO).is_ok()
        && (write_end == libc::STDOUT_FILENO || close(write_end).is_ok())
        // ignored signals survive exec
        && unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) }.is_ok();
    if ready {
        execve(&argv[0], argv, envp).ok();
    }
    unsafe { libc::_exit(127) }
}

enum Capture {
    TimedOut,
    Failed(nix::Error),
}

/// Read `fd` to end of stream, giving up at `deadline`.
fn capture(fd: RawFd, deadline: Instant) -> Result<Vec<u8>, Capture> {
    let mut output = Vec::new();
    let mut buf = [0; READ_SIZE];
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(Capture::TimedOut);
        }
        let remaining = deadline - now;
        let mut timeout = TimeVal::from(libc::timeval {
            tv_sec: remaining.as_secs() as libc::time_t,
            tv_usec: remaining.subsec_micros() as libc::suseconds_t,
        });
        let mut read_set = FdSet::new();
        read_set.insert(fd);
        match select(None, Some(&mut read_set), None, None, Some(&mut timeout)) {
            Ok(0) | Err(nix::Error::Sys(Errno::EINTR)) => continue,
            Ok(_) => {}
            Err(e) => return Err(Capture::Failed(e)),
        }
        match read(fd, &mut buf) {
            Ok(0) => return Ok(output),
            Ok(n) => output.extend_from_slice(&buf[..n]),
            Err(nix::Error::Sys(Errno::EINTR)) | Err(nix::Error::Sys(Errno::EAGAIN)) => {}
            Err(e) => return Err(Capture::Failed(e)),
        }
    }
}

#[derive(Debug, PartialEq)]
enum Reaped {
    Exited(i32),
    Signaled(Signal),
    /// Already collected elsewhere, e.g. by an ignored SIGCHLD.
    Gone,
    Running,
    Failed(nix::Error),
}

/// Interpret one non-blocking `waitpid`. None means the child is still running.
fn wait_outcome(result: nix::Result<WaitStatus>) -> Option<Reaped> {
    match result {
        Ok(WaitStatus::Exited(_, code)) => Some(Reaped::Exited(code)),
        Ok(WaitStatus::Signaled(_, signal, _)) => Some(Reaped::Signaled(signal)),
        Ok(_) | Err(nix::Error::Sys(Errno::EINTR)) => None,
        Err(nix::Error::Sys(Errno::ECHILD)) => Some(Reaped::Gone),
        Err(e) => Some(Reaped::Failed(e)),
    }
}

/// Wait for `child` to exit, but not past `deadline`.
fn reap(child: Pid, deadline: Instant) -> Reaped {
    loop {
        if let Some(reaped) = wait_outcome(waitpid(child, Some(WaitPidFlag::WNOHANG))) {
            return reaped;
        }
        if Instant::now() >= deadline {
            return Reaped::Running;
        }
        sleep(REAP_INTERVAL);
    }
}

/// Kill the child and everything in its process group.
fn terminate(child: Pid) {
    if killpg(child, Signal::SIGKILL).is_err() {
        if let Err(e) = kill(child, Signal::SIGKILL) {
            // A jailed program runs under another uid and may be out of our reach.
            eprintln!("warning: failed to kill process {}: {}", child, e);
        }
    }
    match reap(child, Instant::now() + KILL_GRACE) {
        Reaped::Running => eprintln!("warning: process {} left to exit on its own", child),
        Reaped::Failed(e) => eprintln!("warning: failed to wait for process {}: {}", child, e),
        _ => {}
    }
}
