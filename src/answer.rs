use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::ErrorKind;
use std::net::IpAddr;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use nix::unistd::{access, AccessFlags};

use crate::cgi::{self, CgiEnvironment, CgiError, RequestInfo};
use crate::config::{Jail, ServerConfig};
use crate::http::{find, Body, GeneratedOn, HtmlEscaped, Request, Response, Status, UrlEncoded};
use crate::mime::MimeMap;

/// Any of the user, group or other execute bits.
const EXECUTABLE: u32 = 0o111;

/// Header fields a CGI program may not set on its own.
const RESERVED_HEADERS: &[&str] = &["content-length", "connection", "date", "server"];

/// Turns a parsed request into a response, running CGI programs where needed.
#[derive(Debug)]
pub struct Answerer {
    root: PathBuf,
    port: u16,
    jail: Option<Jail>,
    cgi_timeout: Duration,
    mime_map: MimeMap,
}

impl Answerer {
    /// Serve files below `root`.
    pub fn new(config: &ServerConfig, root: PathBuf) -> Self {
        Self {
            root,
            port: config.port,
            jail: config.jail.clone(),
            cgi_timeout: config.cgi_timeout,
            mime_map: MimeMap::default(),
        }
    }

    pub fn answer(&self, request: &Request, remote_addr: IpAddr, now: SystemTime) -> Response {
        if request.path.is_empty() {
            return self.listing(&self.root, request, now);
        }
        let path = self.root.join(OsStr::from_bytes(&request.path));
        let metadata = match fs::metadata(&path) {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                return Response::error(Status::Forbidden, now)
            }
            Err(_) => return Response::error(Status::NotFound, now),
        };

        if metadata.is_dir() {
            if !request.path.ends_with(b"/") {
                let url = request.url.splitn(2, '?').next().unwrap_or("");
                return Response::redirect(&format!("{}/", url), now);
            }
            return self.listing(&path, request, now);
        }
        if !metadata.is_file() {
            return Response::error(Status::NotFound, now);
        }
        if access(&path, AccessFlags::R_OK).is_err() {
            return Response::error(Status::Forbidden, now);
        }
        if metadata.permissions().mode() & EXECUTABLE != 0 {
            self.cgi(&path, request, remote_addr, now)
        } else {
            self.file(&path, request, metadata.len(), now)
        }
    }

    fn file(&self, path: &Path, request: &Request, len: u64, now: SystemTime) -> Response {
        match File::open(path) {
            Ok(file) => {
                let name = String::from_utf8_lossy(&request.path);
                let mimetype = self.mime_map.content_type(&name);
                Response::new(Status::Ok, mimetype, Body::File(file, len))
            }
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                Response::error(Status::Forbidden, now)
            }
            Err(e) => {
                eprintln!("warning: failed to open {}: {}", path.display(), e);
                Response::error(Status::InternalServerError, now)
            }
        }
    }

    fn cgi(&self, path: &Path, request: &Request, remote_addr: IpAddr, now: SystemTime) -> Response {
        let script = String::from_utf8_lossy(&request.path);
        let output = CgiEnvironment::for_request(&RequestInfo {
            port: self.port,
            script: &script,
            query: &request.query,
            remote_addr,
        })
        .and_then(|env| cgi::execute(path, &env, self.jail.as_ref(), self.cgi_timeout));
        match output {
            Ok(output) => match CgiResponse::parse(output) {
                Some(response) => response.into_response(),
                None => {
                    eprintln!("warning: {} produced malformed headers", script);
                    Response::error(Status::InternalServerError, now)
                }
            },
            Err(CgiError::Forbidden(_)) => Response::error(Status::Forbidden, now),
            Err(e) => {
                eprintln!("warning: {}: {:#}", script, anyhow::Error::new(e));
                Response::error(Status::InternalServerError, now)
            }
        }
    }

    fn listing(&self, dir: &Path, request: &Request, now: SystemTime) -> Response {
        if access(dir, AccessFlags::R_OK).is_err() {
            return Response::error(Status::Forbidden, now);
        }
        let mut entries: Vec<_> = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(_) => return Response::error(Status::Forbidden, now),
        }
        .filter_map(|entry| entry.ok())
        .collect();
        entries
            .as_mut_slice()
            .sort_by_key(|dir_entry| dir_entry.file_name());

        let title = format!("/{}", String::from_utf8_lossy(&request.path));
        let page = format!(
            "<html>\n<head>\n<title>{}</title>\n\
            <meta charset=\"utf-8\">\n\
            <meta name=\"viewport\" content=\"width=device-width, initial-scale=1\">\n\
            </head>\n<body>\n<h1>{}</h1>\n<tt><pre>\n\
            {}\
            </pre></tt>\n\
            <hr>\n\
            {}\
            </body>\n</html>\n",
            HtmlEscaped(&title),
            HtmlEscaped(&title),
            Listing(entries, !request.path.is_empty()),
            GeneratedOn(now),
        );
        Response::new(
            Status::Ok,
            "text/html; charset=UTF-8",
            Body::Bytes(page.into_bytes()),
        )
    }
}

/// Directory listing. The flag adds a link to the parent directory.
struct Listing(Vec<fs::DirEntry>, bool);

impl std::fmt::Display for Listing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let max_len = self
            .0
            .iter()
            .map(|dir_entry| dir_entry.file_name().len())
            .max()
            .unwrap_or(2);

        if self.1 {
            writeln!(f, "<a href=\"..\">..</a>/")?;
        }

        for dir_entry in &self.0 {
            let metadata = match dir_entry.metadata() {
                Ok(metadata) => metadata,
                Err(_) => continue,
            };
            let name = dir_entry.file_name();
            let name = name.to_string_lossy();
            if metadata.is_dir() {
                writeln!(
                    f,
                    "<a href=\"{}/\">{}</a>/",
                    UrlEncoded(&name),
                    HtmlEscaped(&name)
                )?;
            } else {
                write!(
                    f,
                    "<a href=\"{}\">{}</a>",
                    UrlEncoded(&name),
                    HtmlEscaped(&name)
                )?;
                for _ in name.len()..max_len {
                    write!(f, " ")?;
                }
                writeln!(f, "{:10}", metadata.len())?;
            }
        }
        Ok(())
    }
}

/// Output of a CGI program split into its header fields and body.
#[derive(Debug, PartialEq)]
pub struct CgiResponse {
    pub content_type: String,
    /// Other header fields to pass on to the client.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CgiResponse {
    /// Split at the first blank line. Returns None unless the header block is well formed and
    /// has a Content-Type.
    pub fn parse(mut output: Vec<u8>) -> Option<Self> {
        let (end, delimiter_len) = match (find(b"\n\n", &output), find(b"\r\n\r\n", &output)) {
            (Some(lf), Some(crlf)) if crlf < lf => (crlf, 4),
            (Some(lf), _) => (lf, 2),
            (None, Some(crlf)) => (crlf, 4),
            (None, None) => return None,
        };
        let body = output.split_off(end + delimiter_len);
        output.truncate(end);
        let head = String::from_utf8(output).ok()?;

        let mut content_type = None;
        let mut headers = Vec::new();
        for line in head.split('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            let mut field = line.splitn(2, ':');
            let name = field.next()?;
            let value = field.next()?.trim();
            if name.is_empty() || name.contains(|c: char| c.is_whitespace() || c.is_control()) {
                return None;
            }
            if name.eq_ignore_ascii_case("content-type") {
                content_type = Some(value.to_string()).filter(|value| !value.is_empty());
            } else if !RESERVED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                headers.push((name.to_string(), value.to_string()));
            }
        }
        Some(Self {
            content_type: content_type?,
            headers,
            body,
        })
    }

    pub fn into_response(self) -> Response {
        let mut response = Response::new(Status::Ok, &self.content_type, Body::Bytes(self.body));
        for (name, value) in &self.headers {
            response
                .extra_headers
                .push_str(&format!("{}: {}\r\n", name, value));
        }
        response
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Write;
    use std::net::Ipv4Addr;

    use tempfile::{tempdir, TempDir};
    use test_case::test_case;

    use crate::http::parse_request_line;

    fn answerer(root: &TempDir) -> Answerer {
        let config = ServerConfig::from_pairs(&[
            ("port".to_string(), "8080".to_string()),
            ("home".to_string(), root.path().display().to_string()),
            ("log".to_string(), "/dev/null".to_string()),
        ])
        .unwrap();
        Answerer::new(&config, root.path().to_path_buf())
    }

    fn get(root: &TempDir, target: &str) -> Response {
        let request = parse_request_line(&format!("GET {} HTTP/1.1", target)).unwrap();
        answerer(root).answer(&request, IpAddr::V4(Ipv4Addr::LOCALHOST), SystemTime::now())
    }

    fn create(root: &TempDir, name: &str, contents: &str, mode: u32) {
        let path = root.path().join(name);
        File::create(&path)
            .unwrap()
            .write_all(contents.as_bytes())
            .unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).unwrap();
    }

    fn body(response: &Response) -> String {
        match &response.body {
            Body::Bytes(bytes) => String::from_utf8(bytes.clone()).unwrap(),
            Body::File(..) => panic!("expected generated body"),
        }
    }

    #[test]
    fn static_file() {
        let root = tempdir().unwrap();
        create(&root, "index.html", "<p>hi</p>", 0o644);
        let response = get(&root, "/index.html");
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.content_type, "text/html");
        assert!(matches!(response.body, Body::File(_, 9)));
    }

    #[test]
    fn missing_file() {
        let root = tempdir().unwrap();
        assert_eq!(get(&root, "/nope").status, Status::NotFound);
        assert_eq!(get(&root, "/nope/").status, Status::NotFound);
    }

    #[test]
    fn directory_redirect() {
        let root = tempdir().unwrap();
        fs::create_dir(root.path().join("docs")).unwrap();
        let response = get(&root, "/docs?x=1");
        assert_eq!(response.status, Status::MovedPermanently);
        assert_eq!(response.extra_headers, "Location: /docs/\r\n");
    }

    #[test]
    fn directory_listing() {
        let root = tempdir().unwrap();
        fs::create_dir(root.path().join("docs")).unwrap();
        create(&root, "docs/b file.txt", "bbb", 0o644);
        create(&root, "docs/a<.txt", "a", 0o644);
        fs::create_dir(root.path().join("docs/sub")).unwrap();
        let response = get(&root, "/docs/");
        assert_eq!(response.status, Status::Ok);
        let page = body(&response);
        assert!(page.contains("<a href=\"..\">..</a>/"));
        assert!(page.contains("<a href=\"a%3C.txt\">a&lt;.txt</a>"));
        assert!(page.contains("<a href=\"b%20file.txt\">b file.txt</a>"));
        assert!(page.contains("<a href=\"sub/\">sub</a>/"));
        assert!(page.find("a%3C.txt").unwrap() < page.find("b%20file.txt").unwrap());
    }

    #[test]
    fn root_listing() {
        let root = tempdir().unwrap();
        create(&root, "hello.txt", "hi", 0o644);
        let response = get(&root, "/");
        assert_eq!(response.status, Status::Ok);
        let page = body(&response);
        assert!(page.contains("hello.txt"));
        assert!(!page.contains("<a href=\"..\">"));
    }

    #[test]
    fn unreadable_file_is_forbidden() {
        if nix::unistd::geteuid().is_root() {
            return; // root can read anything
        }
        let root = tempdir().unwrap();
        create(&root, "secret.txt", "s", 0o000);
        assert_eq!(get(&root, "/secret.txt").status, Status::Forbidden);
    }

    #[test]
    fn cgi_program() {
        let root = tempdir().unwrap();
        create(
            &root,
            "hello",
            "#!/bin/sh\nprintf 'Content-Type: text/plain\\nX-Query: %s\\n\\nhello world' \"$QUERY_STRING\"\n",
            0o755,
        );
        let response = get(&root, "/hello?name=crab");
        assert_eq!(response.status, Status::Ok);
        assert_eq!(response.content_type, "text/plain");
        assert_eq!(response.extra_headers, "X-Query: name=crab\r\n");
        assert_eq!(body(&response), "hello world");
        assert_eq!(response.body.len(), 11);
    }

    #[test]
    fn cgi_program_without_content_type() {
        let root = tempdir().unwrap();
        create(&root, "bad", "#!/bin/sh\necho hello\n", 0o755);
        assert_eq!(get(&root, "/bad").status, Status::InternalServerError);
    }

    #[test]
    fn cgi_program_timeout() {
        let root = tempdir().unwrap();
        create(
            &root,
            "slow",
            "#!/bin/sh\nsleep 5\nprintf 'Content-Type: text/plain\\n\\nlate'\n",
            0o755,
        );
        assert_eq!(get(&root, "/slow").status, Status::InternalServerError);
    }

    #[test_case(b"Content-Type: text/plain\n\nbody", "text/plain", &[], b"body" ; "lf")]
    #[test_case(b"Content-Type: text/plain\r\n\r\nbody", "text/plain", &[], b"body" ; "crlf")]
    #[test_case(b"content-type:text/html; charset=utf-8\n\n", "text/html; charset=utf-8", &[], b"" ; "empty body")]
    #[test_case(b"X-A: 1\nContent-Type: a/b\nContent-Length: 99\n\nx\n\ny", "a/b", &[("X-A", "1")], b"x\n\ny" ; "first blank line")]
    fn cgi_response_parse(
        output: &[u8],
        content_type: &str,
        headers: &[(&str, &str)],
        body: &[u8],
    ) {
        let response = CgiResponse::parse(output.to_vec()).unwrap();
        assert_eq!(response.content_type, content_type);
        let expected: Vec<(String, String)> = headers
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(response.headers, expected);
        assert_eq!(response.body, body);
    }

    #[test_case(b"" ; "empty")]
    #[test_case(b"Content-Type: text/plain\nbody" ; "no blank line")]
    #[test_case(b"X-A: 1\n\nbody" ; "no content type")]
    #[test_case(b"Content-Type:\n\nbody" ; "empty content type")]
    #[test_case(b"Content-Type: text/plain\ngarbage\n\nbody" ; "line without colon")]
    #[test_case(b"Bad Name: x\nContent-Type: a/b\n\n" ; "space in name")]
    fn cgi_response_rejects(output: &[u8]) {
        assert_eq!(CgiResponse::parse(output.to_vec()), None);
    }
}
