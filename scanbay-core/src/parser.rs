//! Extraction of open services from Nmap XML reports.

use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

/// One open port on one host, as reported by a trigger scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiscoveredService {
    pub host: String,
    pub port: String,
    /// URL scheme to use when addressing the service: `http` or `https`.
    pub protocol: String,
    pub service_name: String,
    pub product: String,
    pub version: String,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path} is not an Nmap XML report")]
    NotNmapXml { path: PathBuf },
}

/// Turns a structured scan report into the services it found.
pub trait ServiceParser: Send + Sync {
    fn parse(&self, path: &Path) -> Result<Vec<DiscoveredService>, ParseError>;

    /// Best-effort read of a tool's human-readable output, for tasks whose
    /// structured report is missing. Parsers without a text form find nothing.
    fn parse_text(&self, _text: &str) -> Vec<DiscoveredService> {
        Vec::new()
    }
}

/// Reads the subset of Nmap's `-oX` format needed by playbooks.
#[derive(Debug, Clone, Copy, Default)]
pub struct NmapXmlParser;

static TEXT_HOST_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Nmap scan report for (\S+)(?: \(([^)]+)\))?")
        .expect("host line regex should compile")
});
static TEXT_PORT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+)/(?:tcp|udp)\s+open\s+(\S+)(?:\s+(.*))?$")
        .expect("port line regex should compile")
});

/// `https` when the port number or the service name points at TLS.
pub fn service_protocol(port: &str, service_name: &str) -> &'static str {
    if port.contains("443") || service_name.contains("ssl") {
        "https"
    } else {
        "http"
    }
}

/// Unescaped value of attribute `name`, whichever quote style it used.
fn attribute(element: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    element
        .attributes()
        .flatten()
        .find(|attr| attr.key.as_ref() == name)
        .and_then(|attr| attr.unescape_value().ok().map(Cow::into_owned))
}

#[derive(Default)]
struct HostEntry {
    address: Option<String>,
    ports: Vec<PortEntry>,
}

#[derive(Default)]
struct PortEntry {
    portid: Option<String>,
    open: bool,
    service_name: Option<String>,
    product: Option<String>,
    version: Option<String>,
}

impl HostEntry {
    fn collect_into(self, services: &mut Vec<DiscoveredService>) {
        let Some(host) = self.address else {
            return;
        };
        for port in self.ports.into_iter().filter(|port| port.open) {
            let Some(portid) = port.portid else {
                continue;
            };
            let service_name = port
                .service_name
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| "unknown".to_owned());
            services.push(DiscoveredService {
                host: host.clone(),
                protocol: service_protocol(&portid, &service_name).to_owned(),
                port: portid,
                product: port.product.unwrap_or_default(),
                version: port.version.unwrap_or_default(),
                service_name,
            });
        }
    }
}

/// Record what a child element of `<host>` or `<port>` says.
fn visit(element: &BytesStart<'_>, host: Option<&mut HostEntry>, port: Option<&mut PortEntry>) {
    match (element.name().as_ref(), host, port) {
        // Prefer the IP address over a MAC entry.
        (b"address", Some(host), None) => {
            if host.address.is_none() && attribute(element, b"addrtype").as_deref() != Some("mac") {
                host.address = attribute(element, b"addr");
            }
        }
        (b"state", _, Some(port)) => {
            port.open = attribute(element, b"state").as_deref() == Some("open");
        }
        (b"service", _, Some(port)) => {
            port.service_name = attribute(element, b"name");
            port.product = attribute(element, b"product");
            port.version = attribute(element, b"version");
        }
        _ => {}
    }
}

impl NmapXmlParser {
    /// Services on open ports, in report order. A malformed document yields
    /// the hosts completed before the fault.
    pub fn parse_str(&self, xml: &str) -> Vec<DiscoveredService> {
        let mut reader = Reader::from_str(xml);
        let mut buf = Vec::new();
        let mut services = Vec::new();
        let mut host: Option<HostEntry> = None;
        let mut port: Option<PortEntry> = None;

        loop {
            match reader.read_event_into(&mut buf) {
                Ok(Event::Start(e)) => match e.name().as_ref() {
                    b"host" => host = Some(HostEntry::default()),
                    b"port" if host.is_some() => {
                        port = Some(PortEntry {
                            portid: attribute(&e, b"portid"),
                            ..PortEntry::default()
                        });
                    }
                    _ => visit(&e, host.as_mut(), port.as_mut()),
                },
                Ok(Event::Empty(e)) => visit(&e, host.as_mut(), port.as_mut()),
                Ok(Event::End(e)) => match e.name().as_ref() {
                    b"port" => {
                        if let (Some(host), Some(port)) = (host.as_mut(), port.take()) {
                            host.ports.push(port);
                        }
                    }
                    b"host" => {
                        if let Some(host) = host.take() {
                            host.collect_into(&mut services);
                        }
                    }
                    _ => {}
                },
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(err) => {
                    warn!(
                        position = reader.buffer_position(),
                        error = %err,
                        "malformed nmap report, keeping services read so far"
                    );
                    break;
                }
            }
            buf.clear();
        }
        services
    }
}

impl ServiceParser for NmapXmlParser {
    fn parse(&self, path: &Path) -> Result<Vec<DiscoveredService>, ParseError> {
        let xml = std::fs::read_to_string(path).map_err(|source| ParseError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        if !xml.contains("<nmaprun") {
            return Err(ParseError::NotNmapXml {
                path: path.to_path_buf(),
            });
        }
        Ok(self.parse_str(&xml))
    }

    /// Reads Nmap's normal output: a `Nmap scan report for` line opens each
    /// host and `PORT/proto open service details` lines follow it. The
    /// details column lands in `product`; `version` stays empty.
    fn parse_text(&self, text: &str) -> Vec<DiscoveredService> {
        let mut services = Vec::new();
        let mut host: Option<String> = None;
        for line in text.lines().map(str::trim) {
            if let Some(caps) = TEXT_HOST_LINE.captures(line) {
                host = caps.get(2).or(caps.get(1)).map(|m| m.as_str().to_owned());
                continue;
            }
            let (Some(host), Some(caps)) = (&host, TEXT_PORT_LINE.captures(line)) else {
                continue;
            };
            let port = caps[1].to_owned();
            let service_name = caps[2].to_owned();
            services.push(DiscoveredService {
                host: host.clone(),
                protocol: service_protocol(&port, &service_name).to_owned(),
                port,
                product: caps.get(3).map(|m| m.as_str().trim().to_owned()).unwrap_or_default(),
                version: String::new(),
                service_name,
            });
        }
        services
    }
}
