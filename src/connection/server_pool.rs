use std::fmt::{Display, Formatter};

use rand::seq::SliceRandom;
use rustc_hash::FxHashSet;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{NatsError, Result};

pub const DEFAULT_PORT: u16 = 4222;
pub const DEFAULT_URL: &str = "nats://localhost:4222";

/// A candidate server. Credentials embedded in the URL are kept here rather than in the URL
///  so that URLs can be logged.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ServerEndpoint {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub token: Option<String>,
    /// from a `tls://` URL
    pub tls_required: bool,
    /// learned from the `connect_urls` of a server's INFO rather than configured
    pub discovered: bool,

    pub(crate) last_attempt: Option<Instant>,
    pub(crate) reconnect_attempts: u32,
    pub(crate) did_connect: bool,
}

impl ServerEndpoint {
    /// Parses `nats://[user[:pass]@]host[:port]`, `tls://...`, or a bare `host:port` as
    ///  found in `connect_urls`. IPv6 hosts go in brackets. A user without a password is an
    ///  auth token.
    pub fn parse(url: &str) -> Result<ServerEndpoint> {
        let url = url.trim();
        let (tls_required, rest) = if let Some(rest) = url.strip_prefix("nats://") {
            (false, rest)
        }
        else if let Some(rest) = url.strip_prefix("tls://") {
            (true, rest)
        }
        else if url.contains("://") {
            return Err(NatsError::InvalidConfig(format!("unsupported URL scheme: {}", url)));
        }
        else {
            (false, url)
        };
        let rest = rest.trim_end_matches('/');

        let (user_info, host_port) = match rest.rsplit_once('@') {
            Some((user_info, host_port)) => (Some(user_info), host_port),
            None => (None, rest),
        };
        let (user, pass, token) = match user_info {
            None => (None, None, None),
            Some(user_info) => match user_info.split_once(':') {
                Some((user, pass)) => (Some(user.to_string()), Some(pass.to_string()), None),
                None => (None, None, Some(user_info.to_string())),
            },
        };

        let (host, port) = split_host_port(host_port)
            .ok_or_else(|| NatsError::InvalidConfig(format!("invalid server URL: {}", url)))?;

        Ok(ServerEndpoint {
            host,
            port,
            user,
            pass,
            token,
            tls_required,
            discovered: false,
            last_attempt: None,
            reconnect_attempts: 0,
            did_connect: false,
        })
    }

    /// `host:port`, with IPv6 hosts in brackets. This is the identity of an endpoint in the
    ///  pool.
    pub fn address(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        }
        else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// the URL without credentials
    pub fn url(&self) -> String {
        let scheme = if self.tls_required { "tls" } else { "nats" };
        format!("{}://{}", scheme, self.address())
    }

    pub fn has_credentials(&self) -> bool {
        self.user.is_some() || self.token.is_some()
    }
}

impl Display for ServerEndpoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.url())
    }
}

fn split_host_port(s: &str) -> Option<(String, u16)> {
    if let Some(rest) = s.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(port) => port.parse().ok()?,
            None if after.is_empty() => DEFAULT_PORT,
            None => return None,
        };
        if host.is_empty() {
            return None;
        }
        return Some((host.to_string(), port));
    }

    let (host, port) = match s.rsplit_once(':') {
        Some((host, port)) => (host, port.parse().ok()?),
        None => (s, DEFAULT_PORT),
    };
    if host.is_empty() || host.contains(':') {
        return None;
    }
    Some((host.to_string(), port))
}

/// The candidate servers of a connection, in the order in which they are tried.
///
/// The pool only grows: servers announced by the cluster are added, but nothing is ever
///  removed because a server stopped being announced.
#[derive(Debug)]
pub struct ServerPool {
    servers: Vec<ServerEndpoint>,
    current: Option<usize>,
    randomize: bool,
    known: FxHashSet<String>,
}

impl ServerPool {
    pub fn initialize(urls: &[String], randomize: bool) -> Result<ServerPool> {
        let mut pool = ServerPool {
            servers: Vec::new(),
            current: None,
            randomize,
            known: Default::default(),
        };

        for url in urls {
            let endpoint = ServerEndpoint::parse(url)?;
            if pool.known.insert(endpoint.address()) {
                pool.servers.push(endpoint);
            }
        }

        if randomize {
            pool.servers.shuffle(&mut rand::thread_rng());
        }
        Ok(pool)
    }

    /// Makes the endpoint after the current one the current endpoint, cycling back to the start
    ///  after the last one.
    pub fn advance(&mut self) -> Option<&mut ServerEndpoint> {
        if self.servers.is_empty() {
            return None;
        }
        let next = match self.current {
            None => 0,
            Some(idx) => (idx + 1) % self.servers.len(),
        };
        self.current = Some(next);
        self.servers.get_mut(next)
    }

    /// Like [ServerPool::advance], but skips endpoints whose reconnect budget is used up.
    ///  `None` if no endpoint has any attempts left.
    pub(crate) fn advance_with_budget(&mut self, max_attempts: Option<u32>) -> Option<&mut ServerEndpoint> {
        let Some(max_attempts) = max_attempts else {
            return self.advance();
        };

        for _ in 0..self.servers.len() {
            let has_budget = self.advance()
                .map(|s| s.reconnect_attempts < max_attempts)
                .unwrap_or(false);
            if has_budget {
                return self.current_endpoint_mut();
            }
        }
        None
    }

    /// Adds servers announced by the cluster that are not in the pool yet. Returns the URLs
    ///  that were added.
    ///
    /// When the pool is randomized, it is reshuffled after additions, but the current endpoint
    ///  keeps its position.
    pub fn merge_discovered(&mut self, urls: &[String]) -> Vec<String> {
        let mut added = Vec::new();
        for url in urls {
            match ServerEndpoint::parse(url) {
                Ok(mut endpoint) => {
                    if self.known.insert(endpoint.address()) {
                        endpoint.discovered = true;
                        added.push(endpoint.url());
                        self.servers.push(endpoint);
                    }
                }
                Err(e) => debug!("ignoring announced server {}: {}", url, e),
            }
        }

        if self.randomize && !added.is_empty() {
            self.shuffle_around_current();
        }
        added
    }

    fn shuffle_around_current(&mut self) {
        let current = self.current;
        let mut current_endpoint = None;
        let mut others = Vec::with_capacity(self.servers.len());
        for (idx, endpoint) in self.servers.drain(..).enumerate() {
            if Some(idx) == current {
                current_endpoint = Some(endpoint);
            }
            else {
                others.push(endpoint);
            }
        }
        others.shuffle(&mut rand::thread_rng());

        let mut others = others.into_iter();
        let total = others.len() + usize::from(current_endpoint.is_some());
        for idx in 0..total {
            let next = if Some(idx) == current {
                current_endpoint.take()
            }
            else {
                others.next()
            };
            if let Some(endpoint) = next {
                self.servers.push(endpoint);
            }
        }
    }

    pub fn current_endpoint(&self) -> Option<&ServerEndpoint> {
        self.current
            .and_then(|idx| self.servers.get(idx))
    }

    pub(crate) fn current_endpoint_mut(&mut self) -> Option<&mut ServerEndpoint> {
        self.current
            .and_then(|idx| self.servers.get_mut(idx))
    }

    pub fn endpoints(&self) -> &[ServerEndpoint] {
        &self.servers
    }

    /// URLs of all servers in the pool, in pool order
    pub fn urls(&self) -> Vec<String> {
        self.servers.iter()
            .map(|s| s.url())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub(crate) fn reset_reconnect_attempts(&mut self) {
        for s in self.servers.iter_mut() {
            s.reconnect_attempts = 0;
        }
    }
}
