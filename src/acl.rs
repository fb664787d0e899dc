//! ACL (Access Control List) engine.
//!
//! Decides per destination whether a request is proxied through the tunnel,
//! connected directly, blocked, or hijacked to another address.
//!
//! Rule document format, one rule per line:
//!
//! ```text
//! # action  matcher        value            [hijack-to]   [ports]
//! block     domain-suffix  facebook.com
//! direct    cidr           192.168.0.0/16
//! hijack    domain         dns.example.com  127.0.0.1     53
//! direct    ip             10.0.0.1                       8000-9000
//! proxy     all
//! ```
//!
//! `all` followed by a domain (`block all facebook.com`) is accepted as a
//! `domain-suffix` rule; `all` alone or followed by a port range matches
//! every destination.
//!
//! Rules are evaluated in order and the first match wins. When nothing
//! matches, the engine's default action applies (`proxy` unless configured).
//! The engine performs no I/O: IP rules against a hostname only match when
//! the caller supplies a resolved address.

use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::path::Path;

use ipnet::IpNet;
use thiserror::Error;

use crate::common::join_host_port;

/// ACL error types.
#[derive(Debug, Error)]
pub enum AclError {
    #[error("ACL parse error at line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("failed to read ACL file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// What to do with a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    /// Connect from the local machine, bypassing the tunnel.
    Direct,
    /// Send through the tunnel.
    Proxy,
    /// Refuse silently.
    Block,
    /// Replace the destination with a literal address and connect to it directly.
    Hijack(String),
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Direct => write!(f, "direct"),
            Action::Proxy => write!(f, "proxy"),
            Action::Block => write!(f, "block"),
            Action::Hijack(addr) => write!(f, "hijack({})", addr),
        }
    }
}

/// Destination matcher of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matcher {
    /// Exact domain, lowercase.
    Domain(String),
    /// Domain and all of its subdomains, lowercase, without leading dot.
    DomainSuffix(String),
    Cidr(IpNet),
    Ip(IpAddr),
    All,
}

impl Matcher {
    /// Whether matching requires an IP address.
    pub fn needs_ip(&self) -> bool {
        matches!(self, Matcher::Cidr(_) | Matcher::Ip(_))
    }

    fn matches(&self, domain: Option<&str>, ip: Option<IpAddr>) -> bool {
        match self {
            Matcher::Domain(d) => domain == Some(d.as_str()),
            Matcher::DomainSuffix(suffix) => domain.is_some_and(|host| {
                host == suffix
                    || (host.len() > suffix.len()
                        && host.ends_with(suffix.as_str())
                        && host.as_bytes()[host.len() - suffix.len() - 1] == b'.')
            }),
            Matcher::Cidr(net) => ip.is_some_and(|ip| net.contains(&ip)),
            Matcher::Ip(addr) => ip == Some(*addr),
            Matcher::All => true,
        }
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Domain(d) => write!(f, "domain {}", d),
            Matcher::DomainSuffix(s) => write!(f, "domain-suffix {}", s),
            Matcher::Cidr(net) => write!(f, "cidr {}", net),
            Matcher::Ip(ip) => write!(f, "ip {}", ip),
            Matcher::All => write!(f, "all"),
        }
    }
}

/// Inclusive port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    fn parse(s: &str) -> Option<Self> {
        match s.split_once('-') {
            Some((a, b)) => {
                let start = a.parse().ok()?;
                let end = b.parse().ok()?;
                (start <= end).then_some(Self { start, end })
            }
            None => {
                let port = s.parse().ok()?;
                Some(Self {
                    start: port,
                    end: port,
                })
            }
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

/// One parsed ACL rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub action: Action,
    pub matcher: Matcher,
    pub ports: Option<PortRange>,
    /// 1-based line in the source document.
    pub line: usize,
    index: usize,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            Action::Hijack(addr) => write!(f, "hijack {} {}", self.matcher, addr)?,
            action => write!(f, "{} {}", action, self.matcher)?,
        }
        if let Some(ports) = self.ports {
            write!(f, " {}", ports)?;
        }
        Ok(())
    }
}

/// Result of evaluating a destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision<'a> {
    pub action: &'a Action,
    /// The rule that matched; `None` when the default action applied.
    pub rule: Option<&'a Rule>,
}

impl Decision<'_> {
    /// Destination to actually connect to, with hijacking applied.
    ///
    /// A hijack address without a port keeps the requested port.
    pub fn target(&self, host: &str, port: u16) -> String {
        match self.action {
            Action::Hijack(addr) => {
                if addr.parse::<std::net::SocketAddr>().is_ok() {
                    addr.clone()
                } else if addr.parse::<IpAddr>().is_ok() {
                    join_host_port(addr, port)
                } else if addr.rsplit_once(':').is_some_and(|(_, p)| p.parse::<u16>().is_ok()) {
                    addr.clone()
                } else {
                    join_host_port(addr, port)
                }
            }
            _ => join_host_port(host, port),
        }
    }

    /// Rule description for logging.
    pub fn describe(&self) -> String {
        match self.rule {
            Some(rule) => rule.to_string(),
            None => format!("default {}", self.action),
        }
    }
}

/// Resolves hostnames for IP rules. Supplied by the caller.
pub trait Resolve {
    fn resolve_ip(&self, host: &str) -> impl Future<Output = Option<IpAddr>> + Send;
}

/// Immutable rule set. Safe to share across tasks without locking.
#[derive(Debug, Clone)]
pub struct AclEngine {
    rules: Vec<Rule>,
    default_action: Action,
}

impl Default for AclEngine {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            default_action: Action::Proxy,
        }
    }
}

impl AclEngine {
    /// Parses a rule document.
    pub fn load(text: &str) -> Result<Self, AclError> {
        let mut rules = Vec::new();
        for (i, raw) in text.lines().enumerate() {
            let line = i + 1;
            let content = raw.split('#').next().unwrap_or("").trim();
            if content.is_empty() {
                continue;
            }
            let mut rule = parse_rule(content).map_err(|message| AclError::Parse { line, message })?;
            rule.line = line;
            rule.index = rules.len();
            rules.push(rule);
        }
        Ok(Self {
            rules,
            default_action: Action::Proxy,
        })
    }

    /// Reads and parses a rule document from disk.
    pub fn load_from_file(path: &Path) -> Result<Self, AclError> {
        let text = std::fs::read_to_string(path).map_err(|source| AclError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let engine = Self::load(&text)?;
        tracing::info!(file = %path.display(), rules = engine.rules.len(), "ACL loaded");
        Ok(engine)
    }

    /// Replaces the action used when no rule matches.
    pub fn with_default(mut self, action: Action) -> Self {
        self.default_action = action;
        self
    }

    pub fn default_action(&self) -> &Action {
        &self.default_action
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Evaluates a destination. Pure: depends only on the arguments and the rules.
    pub fn evaluate(&self, host: &str, port: u16, resolved_ip: Option<IpAddr>) -> Decision<'_> {
        let host = normalize_host(host);
        let literal_ip = host.parse::<IpAddr>().ok();
        let domain = if literal_ip.is_some() {
            None
        } else {
            Some(host.as_str())
        };
        let ip = literal_ip.or(resolved_ip).map(|ip| ip.to_canonical());

        self.rules
            .iter()
            .filter(|rule| rule.ports.is_none_or(|ports| ports.contains(port)))
            .find(|rule| rule.matcher.matches(domain, ip))
            .map(|rule| Decision {
                action: &rule.action,
                rule: Some(rule),
            })
            .unwrap_or(Decision {
                action: &self.default_action,
                rule: None,
            })
    }

    /// Evaluates a destination, resolving the host only if an IP rule could
    /// match before the name-only decision.
    pub async fn evaluate_with_resolver<R: Resolve>(
        &self,
        host: &str,
        port: u16,
        resolver: &R,
    ) -> Decision<'_> {
        let decision = self.evaluate(host, port, None);
        if normalize_host(host).parse::<IpAddr>().is_ok() {
            return decision;
        }
        let limit = decision.rule.map_or(self.rules.len(), |rule| rule.index);
        if !self.rules[..limit].iter().any(|rule| rule.matcher.needs_ip()) {
            return decision;
        }
        match resolver.resolve_ip(host).await {
            Some(ip) => self.evaluate(host, port, Some(ip)),
            None => decision,
        }
    }
}

fn normalize_host(host: &str) -> String {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .trim_end_matches('.')
        .to_ascii_lowercase()
}

fn normalize_domain(value: &str) -> Result<String, String> {
    let domain = value
        .trim_start_matches("*.")
        .trim_start_matches('.')
        .trim_end_matches('.')
        .to_ascii_lowercase();
    if domain.is_empty() {
        return Err(format!("invalid domain '{}'", value));
    }
    Ok(domain)
}

fn parse_rule(content: &str) -> Result<Rule, String> {
    let fields: Vec<&str> = content.split_whitespace().collect();
    if fields.len() < 2 {
        return Err(format!("expected at least 2 fields, got {}", fields.len()));
    }

    let action_name = fields[0].to_ascii_lowercase();
    let matcher_type = fields[1].to_ascii_lowercase();
    let mut rest = &fields[2..];

    let matcher = match matcher_type.as_str() {
        // `block all facebook.com` is shorthand for a domain-suffix rule.
        "all" => match rest.split_first() {
            Some((value, tail))
                if action_name != "hijack" && value.bytes().any(|b| b.is_ascii_alphabetic()) =>
            {
                rest = tail;
                Matcher::DomainSuffix(normalize_domain(value)?)
            }
            _ => Matcher::All,
        },
        kind => {
            let (value, tail) = rest
                .split_first()
                .ok_or_else(|| format!("matcher '{}' requires a value", kind))?;
            rest = tail;
            match kind {
                "domain" => Matcher::Domain(normalize_domain(value)?),
                "domain-suffix" => Matcher::DomainSuffix(normalize_domain(value)?),
                "cidr" => Matcher::Cidr(
                    value
                        .parse::<IpNet>()
                        .map(|net| net.trunc())
                        .map_err(|e| format!("invalid CIDR '{}': {}", value, e))?,
                ),
                "ip" => Matcher::Ip(
                    value
                        .parse::<IpAddr>()
                        .map(|ip| ip.to_canonical())
                        .map_err(|e| format!("invalid IP '{}': {}", value, e))?,
                ),
                "country" => return Err("country matcher is not supported".to_string()),
                other => return Err(format!("unknown matcher type '{}'", other)),
            }
        }
    };

    let action = match action_name.as_str() {
        "direct" => Action::Direct,
        "proxy" => Action::Proxy,
        "block" => Action::Block,
        "hijack" => {
            let (addr, tail) = rest
                .split_first()
                .ok_or_else(|| "hijack requires a target address".to_string())?;
            rest = tail;
            Action::Hijack((*addr).to_string())
        }
        other => return Err(format!("unknown action '{}'", other)),
    };

    let ports = match rest {
        [] => None,
        [ports] => Some(
            PortRange::parse(ports).ok_or_else(|| format!("invalid port range '{}'", ports))?,
        ),
        extra => return Err(format!("unexpected trailing fields: {}", extra.join(" "))),
    };

    Ok(Rule {
        action,
        matcher,
        ports,
        line: 0,
        index: 0,
    })
}
