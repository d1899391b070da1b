//! Environment, mount and port bindings

use crate::compose::config::{PortConfig, PortConfigLong, PublishedPort, VolumeMount};
use crate::error::{Result, TandemError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

/// Literal environment variable fixed when the manifest is parsed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvBinding {
    pub key: String,
    pub value: String,
}

impl EnvBinding {
    pub fn new(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            value: value.to_string(),
        }
    }
}

/// Network protocol
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "tcp"),
            Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// Host port → container port publication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    /// Host address to bind; all interfaces when unset
    pub host_ip: Option<IpAddr>,
    /// Host port; the engine picks one when unset
    pub host_port: Option<u16>,
    pub container_port: u16,
    pub protocol: Protocol,
}

impl PortBinding {
    pub fn new(host_port: u16, container_port: u16) -> Self {
        Self {
            host_ip: None,
            host_port: Some(host_port),
            container_port,
            protocol: Protocol::Tcp,
        }
    }

    /// Whether two bindings would claim the same host socket
    pub fn collides_with(&self, other: &PortBinding) -> bool {
        match (self.host_port, other.host_port) {
            (Some(a), Some(b)) if a == b && self.protocol == other.protocol => {
                match (self.host_ip, other.host_ip) {
                    (Some(x), Some(y)) => x == y || x.is_unspecified() || y.is_unspecified(),
                    _ => true,
                }
            }
            _ => false,
        }
    }

    /// Parse the short syntax: `8080`, `8080:80`, `127.0.0.1:8080:80`,
    /// each optionally suffixed with `/tcp` or `/udp`
    pub fn parse(service: &str, spec: &str) -> Result<Self> {
        let invalid = |reason: &str| TandemError::InvalidBinding {
            service: service.to_string(),
            kind: "port",
            value: spec.to_string(),
            reason: reason.to_string(),
        };

        let (body, protocol) = match spec.rsplit_once('/') {
            Some((body, proto)) => (body, parse_protocol(proto).ok_or_else(|| invalid("unknown protocol"))?),
            None => (spec, Protocol::Tcp),
        };

        // IPv6 host addresses are written in brackets: [::1]:8080:80
        let (host_ip, rest) = if let Some(stripped) = body.strip_prefix('[') {
            let (ip, rest) = stripped.split_once("]:").ok_or_else(|| invalid("unterminated IPv6 address"))?;
            let ip: IpAddr = ip.parse().map_err(|_| invalid("invalid host address"))?;
            (Some(ip), rest)
        } else {
            let parts: Vec<&str> = body.split(':').collect();
            if parts.len() == 3 {
                let ip: IpAddr = parts[0].parse().map_err(|_| invalid("invalid host address"))?;
                (Some(ip), &body[parts[0].len() + 1..])
            } else {
                (None, body)
            }
        };

        let port = |s: &str| -> Result<u16> {
            if s.contains('-') {
                return Err(invalid("port ranges are not supported"));
            }
            match s.parse::<u16>() {
                Ok(0) | Err(_) => Err(invalid("port must be between 1 and 65535")),
                Ok(p) => Ok(p),
            }
        };

        let (host_port, container_port) = match rest.split_once(':') {
            Some((host, container)) if host.is_empty() => (None, port(container)?),
            Some((host, container)) => (Some(port(host)?), port(container)?),
            None => (None, port(rest)?),
        };

        Ok(Self {
            host_ip,
            host_port,
            container_port,
            protocol,
        })
    }

    /// Convert any manifest port form
    pub fn from_config(service: &str, config: &PortConfig) -> Result<Self> {
        match config {
            PortConfig::Number(p) => Self::parse(service, &p.to_string()),
            PortConfig::Short(s) => Self::parse(service, s),
            PortConfig::Long(long) => Self::from_long(service, long),
        }
    }

    fn from_long(service: &str, long: &PortConfigLong) -> Result<Self> {
        let invalid = |reason: &str| TandemError::InvalidBinding {
            service: service.to_string(),
            kind: "port",
            value: format!("target {}", long.target),
            reason: reason.to_string(),
        };

        let host_port = match &long.published {
            None => None,
            Some(PublishedPort::Number(p)) => Some(*p),
            Some(PublishedPort::Text(s)) => Some(s.parse().map_err(|_| invalid("invalid published port"))?),
        };
        let host_ip = long
            .host_ip
            .as_deref()
            .map(|ip| ip.parse::<IpAddr>().map_err(|_| invalid("invalid host address")))
            .transpose()?;
        let protocol = match long.protocol.as_deref() {
            None => Protocol::Tcp,
            Some(p) => parse_protocol(p).ok_or_else(|| invalid("unknown protocol"))?,
        };
        if long.target == 0 || host_port == Some(0) {
            return Err(invalid("port must be between 1 and 65535"));
        }

        Ok(Self {
            host_ip,
            host_port,
            container_port: long.target,
            protocol,
        })
    }
}

impl fmt::Display for PortBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.host_ip, self.host_port) {
            (Some(IpAddr::V6(ip)), Some(port)) => write!(f, "[{}]:{}:", ip, port)?,
            (Some(ip), Some(port)) => write!(f, "{}:{}:", ip, port)?,
            (None, Some(port)) => write!(f, "{}:", port)?,
            (_, None) => {}
        }
        write!(f, "{}", self.container_port)?;
        if self.protocol != Protocol::Tcp {
            write!(f, "/{}", self.protocol)?;
        }
        Ok(())
    }
}

fn parse_protocol(s: &str) -> Option<Protocol> {
    match s.to_ascii_lowercase().as_str() {
        "tcp" => Some(Protocol::Tcp),
        "udp" => Some(Protocol::Udp),
        _ => None,
    }
}

/// What a mount exposes inside the process namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MountSource {
    /// Absolute host path
    HostPath(PathBuf),
    /// Engine-managed named volume
    Named(String),
}

/// Mount binding: source → absolute container path
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountBinding {
    pub source: MountSource,
    pub target: String,
    pub read_only: bool,
}

impl MountBinding {
    /// Bind a host path read-write
    pub fn bind(source: PathBuf, target: &str) -> Self {
        Self {
            source: MountSource::HostPath(source),
            target: target.to_string(),
            read_only: false,
        }
    }

    /// Parse the short syntax `source:target[:ro|rw]`
    pub fn parse(service: &str, spec: &str, working_dir: &Path) -> Result<Self> {
        let invalid = |reason: &str| TandemError::InvalidBinding {
            service: service.to_string(),
            kind: "volume",
            value: spec.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = spec.split(':').collect();
        let (source, target, mode) = match parts.as_slice() {
            [source, target] => (*source, *target, None),
            [source, target, mode] => (*source, *target, Some(*mode)),
            [_] => return Err(invalid("anonymous volumes are not supported")),
            _ => return Err(invalid("expected source:target[:mode]")),
        };

        let read_only = match mode {
            None | Some("rw") => false,
            Some("ro") => true,
            Some(modes) => {
                let flags: Vec<&str> = modes.split(',').collect();
                if flags.iter().any(|m| !matches!(*m, "ro" | "rw" | "z" | "Z" | "cached" | "delegated" | "consistent")) {
                    return Err(invalid("unknown mount mode"));
                }
                flags.contains(&"ro")
            }
        };

        Self::resolve(source, target, read_only, working_dir)
            .map_err(|reason| invalid(&reason))
    }

    /// Convert any manifest volume form
    pub fn from_config(service: &str, config: &VolumeMount, working_dir: &Path) -> Result<Self> {
        match config {
            VolumeMount::Short(spec) => Self::parse(service, spec, working_dir),
            VolumeMount::Long(long) => {
                let source = long.source.as_deref().ok_or_else(|| TandemError::InvalidBinding {
                    service: service.to_string(),
                    kind: "volume",
                    value: long.target.clone(),
                    reason: "long syntax mounts need a source".to_string(),
                })?;
                if let Some(kind) = long.mount_type.as_deref() {
                    if !matches!(kind, "bind" | "volume") {
                        return Err(TandemError::InvalidBinding {
                            service: service.to_string(),
                            kind: "volume",
                            value: long.target.clone(),
                            reason: format!("mount type '{}' is not supported", kind),
                        });
                    }
                }
                Self::resolve(
                    source,
                    &long.target,
                    long.read_only.unwrap_or(false),
                    working_dir,
                )
                .map_err(|reason| TandemError::InvalidBinding {
                    service: service.to_string(),
                    kind: "volume",
                    value: format!("{}:{}", source, long.target),
                    reason,
                })
            }
        }
    }

    fn resolve(
        source: &str,
        target: &str,
        read_only: bool,
        working_dir: &Path,
    ) -> std::result::Result<Self, String> {
        if !target.starts_with('/') {
            return Err("container path must be absolute".to_string());
        }
        if source.is_empty() {
            return Err("empty source".to_string());
        }

        Ok(Self {
            source: resolve_source(source, working_dir)?,
            target: target.to_string(),
            read_only,
        })
    }
}

/// Resolve a mount source: `~` is the operator's home directory, paths
/// starting with `.` or `/` are host paths, anything else names a volume.
pub fn resolve_source(source: &str, working_dir: &Path) -> std::result::Result<MountSource, String> {
    if source == "~" || source.starts_with("~/") {
        let home = dirs::home_dir().ok_or_else(|| "cannot determine home directory".to_string())?;
        let rest = source.trim_start_matches('~').trim_start_matches('/');
        return Ok(MountSource::HostPath(if rest.is_empty() { home } else { home.join(rest) }));
    }
    if source.starts_with('/') {
        return Ok(MountSource::HostPath(PathBuf::from(source)));
    }
    if source.starts_with('.') {
        return Ok(MountSource::HostPath(normalize(&working_dir.join(source))));
    }
    Ok(MountSource::Named(source.to_string()))
}

/// Collapse `.` and `..` components without touching the filesystem
pub(crate) fn normalize(path: &Path) -> PathBuf {
    use std::path::Component;

    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_short_ports() {
        let p = PortBinding::parse("web", "8002:8002").unwrap();
        assert_eq!(p, PortBinding::new(8002, 8002));

        let p = PortBinding::parse("web", "127.0.0.1:8080:80/udp").unwrap();
        assert_eq!(p.host_ip, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(p.host_port, Some(8080));
        assert_eq!(p.container_port, 80);
        assert_eq!(p.protocol, Protocol::Udp);

        let p = PortBinding::parse("web", "9000").unwrap();
        assert_eq!(p.host_port, None);
        assert_eq!(p.container_port, 9000);

        let p = PortBinding::parse("web", "[::1]:8080:80").unwrap();
        assert_eq!(p.host_ip, Some("::1".parse().unwrap()));
    }

    #[test]
    fn test_parse_invalid_ports() {
        for spec in ["", "abc", "70000:80", "8000-8001:80", "80:80/sctp", "0:80"] {
            let err = PortBinding::parse("web", spec).unwrap_err();
            assert!(matches!(err, TandemError::InvalidBinding { kind: "port", .. }), "{}", spec);
        }
    }

    #[test]
    fn test_port_collisions() {
        let a = PortBinding::new(8002, 8002);
        let b = PortBinding::new(8002, 9000);
        assert!(a.collides_with(&b));

        let udp = PortBinding::parse("x", "8002:8002/udp").unwrap();
        assert!(!a.collides_with(&udp));

        let lo = PortBinding::parse("x", "127.0.0.1:8002:8002").unwrap();
        let lo2 = PortBinding::parse("x", "127.0.0.2:8002:8002").unwrap();
        assert!(a.collides_with(&lo));
        assert!(!lo.collides_with(&lo2));

        let ephemeral = PortBinding::parse("x", "8002").unwrap();
        assert!(!ephemeral.collides_with(&ephemeral.clone()));
    }

    #[test]
    fn test_parse_mounts() {
        let wd = Path::new("/srv/stack");

        let m = MountBinding::parse("client", "./client:/app", wd).unwrap();
        assert_eq!(m.source, MountSource::HostPath(PathBuf::from("/srv/stack/client")));
        assert_eq!(m.target, "/app");
        assert!(!m.read_only);

        let m = MountBinding::parse("client", "../shared:/data:ro", wd).unwrap();
        assert_eq!(m.source, MountSource::HostPath(PathBuf::from("/srv/shared")));
        assert!(m.read_only);

        let m = MountBinding::parse("db", "pgdata:/var/lib/postgresql", wd).unwrap();
        assert_eq!(m.source, MountSource::Named("pgdata".to_string()));
    }

    #[test]
    fn test_home_relative_mount() {
        let Some(home) = dirs::home_dir() else { return };
        let m = MountBinding::parse("api", "~/.config/gcloud:/root/.config/gcloud", Path::new("/")).unwrap();
        assert_eq!(m.source, MountSource::HostPath(home.join(".config/gcloud")));
    }

    #[test]
    fn test_mount_target_must_be_absolute() {
        let err = MountBinding::parse("api", "./data:data", Path::new("/srv")).unwrap_err();
        assert!(err.to_string().contains("absolute"));
        assert!(MountBinding::parse("api", "/data", Path::new("/srv")).is_err());
        assert!(MountBinding::parse("api", "./a:/b:sideways", Path::new("/srv")).is_err());
    }
}
