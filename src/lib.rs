//! A small forking HTTP/1.1 file server with a CGI gateway that can run programs inside a chroot
//! jail through a separately installed setuid helper.

/// Prints message to standard error and exits with code 1.
#[macro_export]
macro_rules! abort {
    ($($arg:tt)*) => ({
        eprint!("{}: ", env!("CARGO_BIN_NAME"));
        eprintln!($($arg)*);
        std::process::exit(1);
    })
}

pub mod answer;
pub mod cgi;
pub mod config;
pub mod helper;
pub mod http;
pub mod mime;
pub mod server;

/// Value of the `Server` header and of `SERVER_SOFTWARE`.
pub const SERVER_SOFTWARE: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));
