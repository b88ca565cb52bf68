//! Minimal HTTP/1.1 tile server for integration tests.
//!
//! Serves canned routes by request path: tile bodies, redirects (with the
//! `Location` header exactly as given, so relative targets can be tested) and
//! bare status codes. Every response closes the connection.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum Route {
    Tile(Vec<u8>),
    Redirect(String),
    Status(u16),
}

#[derive(Default)]
struct Shared {
    routes: HashMap<String, Route>,
    hits: HashMap<String, usize>,
    user_agents: Vec<String>,
}

pub struct TileServer {
    base: String,
    shared: Arc<Mutex<Shared>>,
}

impl TileServer {
    /// Start serving `routes` (path → response) on a background thread.
    /// The server runs until the process exits.
    pub fn start(routes: Vec<(&str, Route)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(Mutex::new(Shared {
            routes: routes.into_iter().map(|(p, r)| (p.to_string(), r)).collect(),
            ..Shared::default()
        }));
        let accept_shared = Arc::clone(&shared);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let shared = Arc::clone(&accept_shared);
                thread::spawn(move || handle(stream, &shared));
            }
        });
        Self {
            base: format!("http://127.0.0.1:{port}"),
            shared,
        }
    }

    /// Absolute URL for `path` (which starts with `/`).
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn hits(&self, path: &str) -> usize {
        self.shared.lock().unwrap().hits.get(path).copied().unwrap_or(0)
    }

    pub fn user_agents(&self) -> Vec<String> {
        self.shared.lock().unwrap().user_agents.clone()
    }
}

fn handle(mut stream: TcpStream, shared: &Mutex<Shared>) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
    let _ = stream.set_write_timeout(Some(Duration::from_secs(2)));
    let mut buf = [0u8; 8192];
    let n = match stream.read(&mut buf) {
        Ok(0) | Err(_) => return,
        Ok(n) => n,
    };
    let Ok(request) = std::str::from_utf8(&buf[..n]) else {
        return;
    };
    let (path, user_agent) = parse_request(request);

    let route = {
        let mut shared = shared.lock().unwrap();
        *shared.hits.entry(path.to_string()).or_default() += 1;
        if let Some(ua) = user_agent {
            shared.user_agents.push(ua.to_string());
        }
        shared.routes.get(path).cloned()
    };

    let (head, body) = match route {
        Some(Route::Tile(body)) => (
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: image/png\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            ),
            body,
        ),
        Some(Route::Redirect(location)) => (
            format!(
                "HTTP/1.1 302 Found\r\nLocation: {location}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            ),
            Vec::new(),
        ),
        Some(Route::Status(code)) => (
            format!("HTTP/1.1 {code} Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"),
            Vec::new(),
        ),
        None => (
            "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_string(),
            Vec::new(),
        ),
    };
    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(&body);
}

/// Returns (path, optional User-Agent).
fn parse_request(request: &str) -> (&str, Option<&str>) {
    let mut lines = request.lines();
    let path = lines
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .unwrap_or("/");
    let user_agent = lines
        .take_while(|l| !l.trim().is_empty())
        .filter_map(|l| l.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("user-agent"))
        .map(|(_, value)| value.trim());
    (path, user_agent)
}
