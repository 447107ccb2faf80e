//! The permission model: typed capabilities with an inclusion lattice.
//!
//! A permission carries a kind and can include narrower permissions, for
//! example `[read path(s) /tmp/...]` includes `[read path(s) /tmp/a.txt]`.
//! Permissions form a closed enum so inclusion checks stay allocation-free.

use std::fmt;

use thiserror::Error;
use url::Url;

use crate::pattern::{AbsolutePath, Host, HostPattern, PathPattern, UrlPattern};

/// A permission kind. Major kinds occupy the low byte; minor kinds combine
/// their major's bit with a bit in the high half. A major kind includes all
/// of its minors.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PermissionKind(u32);

impl PermissionKind {
    pub const READ: Self = Self(1 << 0);
    pub const WRITE: Self = Self(1 << 1);
    pub const DELETE: Self = Self(1 << 2);
    pub const USE: Self = Self(1 << 3);
    pub const CONSUME: Self = Self(1 << 4);
    pub const PROVIDE: Self = Self(1 << 5);
    pub const SEE: Self = Self(1 << 6);

    pub const UPDATE: Self = Self(Self::WRITE.0 | 1 << 16);
    pub const CREATE: Self = Self(Self::WRITE.0 | 2 << 16);
    pub const WRITE_STREAM: Self = Self(Self::WRITE.0 | 4 << 16);

    const NAMES: [(PermissionKind, &'static str); 10] = [
        (Self::READ, "read"),
        (Self::WRITE, "write"),
        (Self::DELETE, "delete"),
        (Self::USE, "use"),
        (Self::CONSUME, "consume"),
        (Self::PROVIDE, "provide"),
        (Self::SEE, "see"),
        (Self::UPDATE, "update"),
        (Self::CREATE, "create"),
        (Self::WRITE_STREAM, "write-stream"),
    ];

    pub fn major(self) -> Self {
        Self(self.0 & 0xff)
    }

    pub fn is_major(self) -> bool {
        self == self.major()
    }

    pub fn is_minor(self) -> bool {
        !self.is_major()
    }

    pub fn includes(self, other: Self) -> bool {
        self.major() == other.major() && ((self.is_major() && other.is_minor()) || self == other)
    }

    pub fn name(self) -> &'static str {
        Self::NAMES
            .iter()
            .find(|(kind, _)| *kind == self)
            .map(|(_, name)| *name)
            .unwrap_or("<invalid permission kind>")
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(kind, _)| *kind)
    }
}

impl fmt::Display for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl fmt::Debug for PermissionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Subject of a filesystem permission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PathSpec {
    Path(AbsolutePath),
    Pattern(PathPattern),
}

impl PathSpec {
    fn covers(&self, other: &PathSpec) -> bool {
        match (self, other) {
            (PathSpec::Path(a), PathSpec::Path(b)) => a == b,
            (PathSpec::Pattern(pattern), PathSpec::Path(path)) => pattern.test(path),
            (PathSpec::Pattern(a), PathSpec::Pattern(b)) => a.includes_pattern(b),
            (PathSpec::Path(_), PathSpec::Pattern(_)) => false,
        }
    }
}

impl fmt::Display for PathSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSpec::Path(path) => path.fmt(f),
            PathSpec::Pattern(pattern) => pattern.fmt(f),
        }
    }
}

impl From<&str> for PathSpec {
    fn from(s: &str) -> Self {
        if s.contains("...") || s.contains('*') {
            PathSpec::Pattern(PathPattern::from(s))
        } else {
            PathSpec::Path(AbsolutePath::from(s))
        }
    }
}

/// Subject of an HTTP permission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HttpSpec {
    Url(String),
    UrlPattern(UrlPattern),
    Host(Host),
    HostPattern(HostPattern),
}

impl HttpSpec {
    fn covers(&self, other: &HttpSpec) -> bool {
        match (self, other) {
            (HttpSpec::Url(a), HttpSpec::Url(b)) => urls_equal_modulo_query(a, b),
            (HttpSpec::UrlPattern(a), HttpSpec::UrlPattern(b)) => a.includes_pattern(b),
            (HttpSpec::UrlPattern(pattern), HttpSpec::Url(url)) => pattern.test(url),
            (HttpSpec::Host(host), other) => host_covers(host, other),
            (HttpSpec::HostPattern(pattern), HttpSpec::Host(host)) => pattern.test(host),
            (HttpSpec::HostPattern(a), HttpSpec::HostPattern(b)) => a.includes_pattern(b),
            (HttpSpec::HostPattern(pattern), HttpSpec::Url(raw)) => match url_to_host(raw) {
                Some(host) => pattern.test(&host),
                None => false,
            },
            _ => false,
        }
    }
}

/// A URL permission whose subject carries no query matches the same URL with
/// any query; with a query the match is exact.
fn urls_equal_modulo_query(subject: &str, requested: &str) -> bool {
    let (Ok(mut subject), Ok(mut requested)) = (Url::parse(subject), Url::parse(requested)) else {
        return subject == requested;
    };

    if subject.query().is_none() {
        subject.set_query(None);
        requested.set_query(None);
    }
    subject == requested
}

fn url_to_host(raw: &str) -> Option<Host> {
    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?;
    Some(Host::new(format!("{}://{host}", url.scheme())))
}

/// A host literal includes URLs and prefix URL patterns on that scheme+host.
fn host_covers(host: &Host, other: &HttpSpec) -> bool {
    match other {
        HttpSpec::Host(other) => host == other,
        HttpSpec::Url(raw) => url_to_host(raw).as_ref() == Some(host),
        HttpSpec::UrlPattern(pattern) => url_to_host(pattern.as_str()).as_ref() == Some(host),
        HttpSpec::HostPattern(_) => false,
    }
}

impl fmt::Display for HttpSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpSpec::Url(url) => f.write_str(url),
            HttpSpec::UrlPattern(pattern) => pattern.fmt(f),
            HttpSpec::Host(host) => host.fmt(f),
            HttpSpec::HostPattern(pattern) => pattern.fmt(f),
        }
    }
}

/// Subject of a DNS or raw-TCP permission.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DomainSpec {
    Host(Host),
    Pattern(HostPattern),
}

impl DomainSpec {
    fn covers(&self, other: &DomainSpec) -> bool {
        match (self, other) {
            (DomainSpec::Host(a), DomainSpec::Host(b)) => a == b,
            (DomainSpec::Host(_), DomainSpec::Pattern(_)) => false,
            (DomainSpec::Pattern(pattern), DomainSpec::Host(host)) => pattern.test(host),
            (DomainSpec::Pattern(a), DomainSpec::Pattern(b)) => a.includes_pattern(b),
        }
    }
}

impl fmt::Display for DomainSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainSpec::Host(host) => host.fmt(f),
            DomainSpec::Pattern(pattern) => pattern.fmt(f),
        }
    }
}

/// Name of a permitted command: a plain name, a binary path, or a path
/// pattern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandName {
    Name(String),
    Path(AbsolutePath),
    Pattern(PathPattern),
}

impl CommandName {
    fn covers(&self, other: &CommandName) -> bool {
        match (self, other) {
            (CommandName::Name(a), CommandName::Name(b)) => a == b,
            (CommandName::Path(a), CommandName::Path(b)) => a == b,
            (CommandName::Pattern(pattern), CommandName::Path(path)) => pattern.test(path),
            (CommandName::Pattern(a), CommandName::Pattern(b)) => a.includes_pattern(b),
            _ => false,
        }
    }
}

impl fmt::Display for CommandName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandName::Name(name) => f.write_str(name),
            CommandName::Path(path) => path.fmt(f),
            CommandName::Pattern(pattern) => pattern.fmt(f),
        }
    }
}

/// Pattern naming the values a context is allowed to see.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValuePattern(pub String);

impl fmt::Display for ValuePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A typed capability checked at every sensitive operation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Permission {
    Fs {
        kind: PermissionKind,
        entity: PathSpec,
    },
    Http {
        kind: PermissionKind,
        entity: HttpSpec,
    },
    Websocket {
        kind: PermissionKind,
        endpoint: String,
    },
    Dns {
        kind: PermissionKind,
        domain: DomainSpec,
    },
    Tcp {
        kind: PermissionKind,
        domain: DomainSpec,
    },
    Command {
        name: CommandName,
        /// Can be empty.
        subcommands: Vec<String>,
    },
    EnvVar {
        kind: PermissionKind,
        /// `"*"` means any.
        name: String,
    },
    GlobalVar {
        kind: PermissionKind,
        /// `"*"` means any.
        name: String,
    },
    LThread {
        kind: PermissionKind,
    },
    SystemGraph {
        kind: PermissionKind,
    },
    ValueVisibility {
        pattern: ValuePattern,
    },
}

impl Permission {
    /// Shorthand for the most common capability.
    pub fn fs_read(entity: impl Into<PathSpec>) -> Self {
        Permission::Fs {
            kind: PermissionKind::READ,
            entity: entity.into(),
        }
    }

    pub fn fs_write(entity: impl Into<PathSpec>) -> Self {
        Permission::Fs {
            kind: PermissionKind::WRITE,
            entity: entity.into(),
        }
    }

    pub fn fs_delete(entity: impl Into<PathSpec>) -> Self {
        Permission::Fs {
            kind: PermissionKind::DELETE,
            entity: entity.into(),
        }
    }

    pub fn create_lthread() -> Self {
        Permission::LThread {
            kind: PermissionKind::CREATE,
        }
    }

    pub fn kind(&self) -> PermissionKind {
        match self {
            Permission::Fs { kind, .. }
            | Permission::Http { kind, .. }
            | Permission::Websocket { kind, .. }
            | Permission::Dns { kind, .. }
            | Permission::Tcp { kind, .. }
            | Permission::EnvVar { kind, .. }
            | Permission::GlobalVar { kind, .. }
            | Permission::LThread { kind }
            | Permission::SystemGraph { kind } => *kind,
            Permission::Command { .. } => PermissionKind::USE,
            Permission::ValueVisibility { .. } => PermissionKind::SEE,
        }
    }

    /// The inclusion partial order: reflexive, transitive, and `false`
    /// across different variants.
    pub fn includes(&self, other: &Permission) -> bool {
        if !self.kind().includes(other.kind()) {
            return false;
        }

        match (self, other) {
            (Permission::Fs { entity: a, .. }, Permission::Fs { entity: b, .. }) => a.covers(b),
            (Permission::Http { entity: a, .. }, Permission::Http { entity: b, .. }) => a.covers(b),
            (
                Permission::Websocket { kind, endpoint: a },
                Permission::Websocket { endpoint: b, .. },
            ) => *kind == PermissionKind::PROVIDE || a == b,
            (Permission::Dns { domain: a, .. }, Permission::Dns { domain: b, .. }) => a.covers(b),
            (Permission::Tcp { domain: a, .. }, Permission::Tcp { domain: b, .. }) => a.covers(b),
            (
                Permission::Command {
                    name: a,
                    subcommands: a_sub,
                },
                Permission::Command {
                    name: b,
                    subcommands: b_sub,
                },
            ) => a.covers(b) && a_sub == b_sub,
            (Permission::EnvVar { name: a, .. }, Permission::EnvVar { name: b, .. })
            | (Permission::GlobalVar { name: a, .. }, Permission::GlobalVar { name: b, .. }) => {
                a == "*" || a == b
            }
            (Permission::LThread { .. }, Permission::LThread { .. }) => true,
            (Permission::SystemGraph { .. }, Permission::SystemGraph { .. }) => true,
            (
                Permission::ValueVisibility { pattern: a },
                Permission::ValueVisibility { pattern: b },
            ) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Permission::Fs { kind, entity } => write!(f, "[{kind} path(s) {entity}]"),
            Permission::Http { kind, entity } => write!(f, "[{kind} {entity}]"),
            Permission::Websocket { kind, endpoint } => {
                write!(f, "[websocket {kind} {endpoint}]")
            }
            Permission::Dns { kind, domain } => write!(f, "[dns {kind} {domain}]"),
            Permission::Tcp { kind, domain } => write!(f, "[tcp {kind} {domain}]"),
            Permission::Command { name, subcommands } => {
                write!(f, "[exec command:{name}")?;
                if subcommands.is_empty() {
                    write!(f, " <no subcommand>")?;
                }
                for subcommand in subcommands {
                    write!(f, " {subcommand}")?;
                }
                write!(f, "]")
            }
            Permission::EnvVar { kind, name } => write!(f, "[{kind} env '{name}']"),
            Permission::GlobalVar { kind, name } => write!(f, "[{kind} global(s) '{name}']"),
            Permission::LThread { kind } => write!(f, "[{kind} routine]"),
            Permission::SystemGraph { kind } => write!(f, "[{kind} system graph]"),
            Permission::ValueVisibility { pattern } => {
                write!(f, "[see value matching {pattern}]")
            }
        }
    }
}

/// Error returned when a permission check fails; carries the exact
/// permission that was requested.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct NotAllowedError {
    pub permission: Permission,
    pub message: String,
}

impl NotAllowedError {
    pub fn new(permission: Permission) -> Self {
        let message = format!("not allowed, missing permission: {permission}");
        Self {
            permission,
            message,
        }
    }
}

// Two denials are the same error when the involved permissions include each
// other, not merely when they are structurally equal.
impl PartialEq for NotAllowedError {
    fn eq(&self, other: &Self) -> bool {
        self.permission.includes(&other.permission)
            && other.permission.includes(&self.permission)
            && self.message == other.message
    }
}

impl Eq for NotAllowedError {}
