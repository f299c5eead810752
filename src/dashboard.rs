//! Dashboard server client, used to ask the controller for its software version

use crate::{Result, URError};
use regex::Regex;
use serde::Serialize;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, info};

/// PolyScope software version reported by the dashboard server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PolyscopeVersion {
    pub major: u32,
    pub minor: u32,
    pub bugfix: u32,
}

impl PolyscopeVersion {
    /// Parse a reply such as `URSoftware 3.2.18744 (Nov 30 2015)`
    pub fn parse(reply: &str) -> Result<Self> {
        let pattern = Regex::new(r"(\d+)\.(\d+)\.(\d+)")?;
        let caps = pattern
            .captures(reply)
            .ok_or_else(|| URError::Connection(format!("Unexpected PolyscopeVersion reply: {}", reply.trim())))?;

        let field = |i: usize| -> Result<u32> {
            caps[i]
                .parse()
                .map_err(|e| URError::Connection(format!("Bad version number '{}': {}", &caps[i], e)))
        };
        Ok(Self {
            major: field(1)?,
            minor: field(2)?,
            bugfix: field(3)?,
        })
    }
}

impl std::fmt::Display for PolyscopeVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.bugfix)
    }
}

/// Line-oriented client for the dashboard server.
///
/// Blocking; run it before the control loop starts, never inside a cycle.
pub struct DashboardClient {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl DashboardClient {
    /// Connect and consume the server's greeting line
    pub fn connect(host: &str, port: u16, timeout: Duration) -> Result<Self> {
        let addr = (host, port)
            .to_socket_addrs()
            .map_err(|e| URError::Connection(format!("Failed to resolve {}:{}: {}", host, port, e)))?
            .next()
            .ok_or_else(|| URError::Connection(format!("No addresses found for {}:{}", host, port)))?;

        let stream = TcpStream::connect_timeout(&addr, timeout)
            .map_err(|e| URError::Connection(format!("Failed to connect to dashboard {}: {}", addr, e)))?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let writer = stream.try_clone()?;
        let mut client = Self {
            reader: BufReader::new(stream),
            writer,
        };
        let greeting = client.read_reply()?;
        debug!("Dashboard: {}", greeting);
        Ok(client)
    }

    fn read_reply(&mut self) -> Result<String> {
        let mut line = String::new();
        let count = self.reader.read_line(&mut line).map_err(URError::Socket)?;
        if count == 0 {
            return Err(URError::Connection("Dashboard closed the connection".to_string()));
        }
        Ok(line.trim().to_string())
    }

    /// Send one command and return the single-line reply
    pub fn send_command(&mut self, command: &str) -> Result<String> {
        self.writer
            .write_all(format!("{}\n", command).as_bytes())
            .map_err(URError::Socket)?;
        self.read_reply()
    }

    pub fn polyscope_version(&mut self) -> Result<PolyscopeVersion> {
        let reply = self.send_command("PolyscopeVersion")?;
        let version = PolyscopeVersion::parse(&reply)?;
        info!("PolyScope version {}", version);
        Ok(version)
    }
}

/// Connect, ask for the PolyScope version, and disconnect
pub fn query_polyscope_version(host: &str, port: u16, timeout: Duration) -> Result<PolyscopeVersion> {
    DashboardClient::connect(host, port, timeout)?.polyscope_version()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_parse_versions() {
        let v = PolyscopeVersion::parse("URSoftware 3.2.18744 (Nov 30 2015)").unwrap();
        assert_eq!(
            v,
            PolyscopeVersion {
                major: 3,
                minor: 2,
                bugfix: 18744
            }
        );
        assert_eq!(v.to_string(), "3.2.18744");

        let v = PolyscopeVersion::parse("URSoftware 5.11.1.108318 (Jun 18 2021)").unwrap();
        assert_eq!((v.major, v.minor, v.bugfix), (5, 11, 1));

        assert!(PolyscopeVersion::parse("could not understand: 'PolyscopeVersion'").is_err());
    }

    #[test]
    fn test_query_against_fake_dashboard() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream
                .write_all(b"Connected: Universal Robots Dashboard Server\n")
                .unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request = String::new();
            reader.read_line(&mut request).unwrap();
            assert_eq!(request, "PolyscopeVersion\n");
            stream.write_all(b"URSoftware 1.8.16941 (Feb 05 2015)\n").unwrap();
        });

        let version = query_polyscope_version("127.0.0.1", port, Duration::from_secs(2)).unwrap();
        server.join().unwrap();
        assert_eq!((version.major, version.minor), (1, 8));
    }
}
