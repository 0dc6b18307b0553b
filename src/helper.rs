//! The setuid helper that starts a CGI program inside the jail.
//!
//! `jailhttpd-helper <user> <jail> <program>` runs as root (setuid), so anyone on the machine can
//! start it. It only proceeds when its parent process is the installed server binary, and then
//! performs, strictly in order: user lookup, `chdir` + `chroot` into the jail, privilege drop,
//! exec. The first failing step ends the process.

use std::ffi::{CString, OsStr, OsString};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::unistd::{self, Gid, Uid, User};
use thiserror::Error;

/// The only binary allowed to invoke the helper.
pub const SERVER_PATH: &str = match option_env!("JAILHTTPD_SERVER_PATH") {
    Some(path) => path,
    None => concat!("/usr/bin/", env!("CARGO_PKG_NAME")),
};

#[derive(Error, Debug)]
pub enum HelperError {
    #[error("usage: {}-helper user chroot program", env!("CARGO_PKG_NAME"))]
    Usage,
    #[error("not allowed to run by security reasons: caller is {0}")]
    UnknownCaller(String),
    #[error("can't find specified user `{0}'")]
    UnknownUser(String),
    #[error("refusing to run programs as root")]
    RootUser,
    #[error("invalid program name `{0}'")]
    BadProgram(String),
    #[error("can't change directory to {}", .0.display())]
    Chdir(PathBuf, #[source] nix::Error),
    #[error("can't chroot")]
    Chroot(#[source] nix::Error),
    #[error("can't drop privileges")]
    DropPrivilege(#[source] nix::Error),
    #[error("can't start program {0}")]
    Exec(String, #[source] nix::Error),
}

/// The validated argument vector.
#[derive(Debug, PartialEq)]
pub struct HelperRequest {
    pub user: String,
    pub jail: PathBuf,
    pub program: CString,
}

impl HelperRequest {
    /// Parse `<user> <jail> <program>`, the arguments after argv[0].
    pub fn parse(args: &[OsString]) -> Result<Self, HelperError> {
        let (user, jail, program) = match args {
            [user, jail, program] => (user, jail, program),
            _ => return Err(HelperError::Usage),
        };
        let user = user
            .to_str()
            .ok_or_else(|| HelperError::UnknownUser(user.to_string_lossy().into_owned()))?;
        let bad_program = || HelperError::BadProgram(program.to_string_lossy().into_owned());
        let name = program.as_bytes();
        if name.is_empty() || name == b"." || name == b".." || name.contains(&b'/') {
            return Err(bad_program());
        }
        // Resolved against the new root once confined.
        let mut path = b"/".to_vec();
        path.extend_from_slice(name);
        let program = CString::new(path).map_err(|_| bad_program())?;
        Ok(Self {
            user: user.to_string(),
            jail: PathBuf::from(jail),
            program,
        })
    }
}

/// Identity a program runs as.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RunAs {
    pub uid: Uid,
    pub gid: Gid,
}

/// The system calls the helper makes, in the order it makes them.
pub trait Confinement {
    /// Executable of the process that started us.
    fn parent_exe(&self) -> std::io::Result<PathBuf>;
    fn lookup_user(&self, name: &str) -> nix::Result<Option<RunAs>>;
    fn chdir(&mut self, dir: &Path) -> nix::Result<()>;
    /// Make the current directory the filesystem root.
    fn chroot_here(&mut self) -> nix::Result<()>;
    fn drop_to(&mut self, run_as: RunAs) -> nix::Result<()>;
    /// Replace the process image. Only returns on failure.
    fn exec(&mut self, program: &CString) -> nix::Error;
}

/// Validate and run one helper invocation. Only returns when a step failed.
pub fn run<C: Confinement>(
    system: &mut C,
    args: &[OsString],
    allowed_caller: &str,
) -> HelperError {
    match confine(system, args, allowed_caller) {
        Ok(request) => {
            let e = system.exec(&request.program);
            HelperError::Exec(request.program.to_string_lossy().into_owned(), e)
        }
        Err(e) => e,
    }
}

fn confine<C: Confinement>(
    system: &mut C,
    args: &[OsString],
    allowed_caller: &str,
) -> Result<HelperRequest, HelperError> {
    let request = HelperRequest::parse(args)?;
    check_caller(system, allowed_caller)?;
    let run_as = system
        .lookup_user(&request.user)
        .ok()
        .flatten()
        .ok_or_else(|| HelperError::UnknownUser(request.user.clone()))?;
    if run_as.uid.is_root() {
        return Err(HelperError::RootUser);
    }
    system
        .chdir(&request.jail)
        .map_err(|e| HelperError::Chdir(request.jail.clone(), e))?;
    system.chroot_here().map_err(HelperError::Chroot)?;
    system.drop_to(run_as).map_err(HelperError::DropPrivilege)?;
    Ok(request)
}

fn check_caller<C: Confinement>(system: &C, allowed_caller: &str) -> Result<(), HelperError> {
    match system.parent_exe() {
        Ok(path) if path.as_os_str() == OsStr::new(allowed_caller) => Ok(()),
        Ok(path) => Err(HelperError::UnknownCaller(path.display().to_string())),
        Err(e) => Err(HelperError::UnknownCaller(format!("unreadable ({})", e))),
    }
}

/// The real system.
pub struct System;

impl Confinement for System {
    fn parent_exe(&self) -> std::io::Result<PathBuf> {
        std::fs::read_link(format!("/proc/{}/exe", unistd::getppid()))
    }
    fn lookup_user(&self, name: &str) -> nix::Result<Option<RunAs>> {
        Ok(User::from_name(name)?.map(|user| RunAs {
            uid: user.uid,
            gid: user.gid,
        }))
    }
    fn chdir(&mut self, dir: &Path) -> nix::Result<()> {
        unistd::chdir(dir)
    }
    fn chroot_here(&mut self) -> nix::Result<()> {
        unistd::chroot(".")
    }
    fn drop_to(&mut self, run_as: RunAs) -> nix::Result<()> {
        unistd::setgroups(&[run_as.gid])?;
        unistd::setgid(run_as.gid)?;
        unistd::setuid(run_as.uid)
    }
    fn exec(&mut self, program: &CString) -> nix::Error {
        match unistd::execv(program, &[program.clone()]) {
            Err(e) => e,
            Ok(never) => match never {},
        }
    }
}
