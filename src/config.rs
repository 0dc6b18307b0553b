use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

const DEFAULT_RUN_AS_USER: &str = env!("CARGO_PKG_NAME");
const DEFAULT_HELPER_PATH: &str = concat!("/usr/bin/", env!("CARGO_PKG_NAME"), "-helper");
const DEFAULT_CGI_TIMEOUT: Duration = Duration::from_secs(1);

/// Settings shared by every connection handler. Loaded once at startup, never changed afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub addr: IpAddr,
    pub port: u16,
    pub home: PathBuf,
    pub log: PathBuf,
    pub jail: Option<Jail>,
    pub cgi_timeout: Duration,
}

/// Where and as whom sandboxed CGI programs run.
#[derive(Debug, Clone, PartialEq)]
pub struct Jail {
    pub dir: PathBuf,
    pub user: String,
    pub helper: PathBuf,
}

impl ServerConfig {
    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self> {
        let pairs = read_config(path)?;
        Self::from_pairs(&pairs).with_context(|| format!("config file {} invalid", path.display()))
    }

    /// Build a config from `key = value` pairs. Unknown keys are ignored and later keys win.
    pub fn from_pairs(pairs: &[(String, String)]) -> Result<Self> {
        let mut addr = None;
        let mut port = None;
        let mut home = None;
        let mut log = None;
        let mut chroot = None;
        let mut user = None;
        let mut helper = None;
        let mut cgi_timeout = None;
        for (key, value) in pairs {
            match key.as_str() {
                "port" => port = Some(parse_port(value)?),
                "home" => home = Some(PathBuf::from(value)),
                "log" => log = Some(PathBuf::from(value)),
                "chroot" => chroot = Some(PathBuf::from(value)).filter(|_| !value.is_empty()),
                "user" => user = Some(value.clone()),
                "helper" => helper = Some(PathBuf::from(value)),
                "addr" => {
                    addr = Some(
                        value
                            .parse()
                            .with_context(|| format!("address {} is invalid", value))?,
                    )
                }
                "cgi_timeout" => {
                    let secs = value
                        .parse::<u64>()
                        .ok()
                        .filter(|&secs| secs > 0)
                        .with_context(|| format!("cgi_timeout {} is invalid", value))?;
                    cgi_timeout = Some(Duration::from_secs(secs));
                }
                _ => {}
            }
        }
        let jail = chroot.map(|dir| Jail {
            dir,
            user: user.unwrap_or_else(|| DEFAULT_RUN_AS_USER.to_string()),
            helper: helper.unwrap_or_else(|| PathBuf::from(DEFAULT_HELPER_PATH)),
        });
        Ok(Self {
            addr: addr.unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            port: port.context("missing port")?,
            home: home.context("missing home")?,
            log: log.context("missing log")?,
            jail,
            cgi_timeout: cgi_timeout.unwrap_or(DEFAULT_CGI_TIMEOUT),
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.addr, self.port)
    }
}

fn parse_port(value: &str) -> Result<u16> {
    match value.parse::<u16>() {
        Ok(0) | Err(_) => Err(anyhow!("port number {} is invalid", value)),
        Ok(port) => Ok(port),
    }
}

/// Read the `key = value` lines of a config file. Lines without `=` are skipped.
pub fn read_config(path: &Path) -> Result<Vec<(String, String)>> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut pairs = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.with_context(|| format!("failed to read {}", path.display()))?;
        if let Some(pair) = parse_line(&line) {
            pairs.push(pair);
        }
    }
    Ok(pairs)
}

fn parse_line(line: &str) -> Option<(String, String)> {
    let mut parts = line.splitn(2, '=');
    let key = parts.next()?.trim();
    let value = parts.next()?.trim();
    Some((key.to_string(), value.to_string()))
}
