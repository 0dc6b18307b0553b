//! Installed setuid root next to the server; see `jailhttpd::helper`.

use std::ffi::OsString;

use jailhttpd::abort;
use jailhttpd::helper::{self, System, SERVER_PATH};

fn main() {
    let args: Vec<OsString> = std::env::args_os().skip(1).collect();
    let error = helper::run(&mut System, &args, SERVER_PATH);
    abort!("{:#}", anyhow::Error::new(error))
}
