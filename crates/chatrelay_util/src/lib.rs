#![forbid(unsafe_code)]

pub mod endpoint {
	use std::net::SocketAddr;

	/// Host used when an endpoint only names a port.
	pub const DEFAULT_BIND_HOST: &str = "0.0.0.0";

	/// Parsed TCP bind endpoint.
	///
	/// Accepted forms: `tcp://host:port`, `host:port`, `:port` and a bare `port`.
	#[derive(Debug, Clone, PartialEq, Eq, Hash)]
	pub struct TcpEndpoint {
		pub host: String,
		pub port: u16,
	}

	impl TcpEndpoint {
		pub fn new(host: impl Into<String>, port: u16) -> Self {
			Self { host: host.into(), port }
		}

		/// Returns `host:port` (host preserved, IPv6 stays bracketed).
		pub fn hostport(&self) -> String {
			format!("{}:{}", self.host, self.port)
		}

		/// Convert to `SocketAddr` only if the host is an IP literal.
		pub fn to_socket_addr_if_ip_literal(&self) -> Result<SocketAddr, String> {
			self.hostport()
				.parse()
				.map_err(|_| format!("host must be an IP literal (DNS names not supported here): {}", self.host))
		}

		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("endpoint must be non-empty (expected tcp://host:port, host:port or port)".to_string());
			}

			let rest = s.strip_prefix("tcp://").unwrap_or(s);
			if rest.contains('/') || rest.contains('?') || rest.contains('#') {
				return Err(format!("invalid endpoint (unexpected path/query/fragment): {s}"));
			}

			let (host, port_str) = match rest.rsplit_once(':') {
				Some((host, port)) if !host.contains(':') || (host.starts_with('[') && host.ends_with(']')) => {
					(host.trim(), port)
				}
				Some(_) => {
					return Err(format!(
						"invalid endpoint host (IPv6 must be bracketed like tcp://[::1]:57452): {s}"
					));
				}
				None if rest.chars().all(|c| c.is_ascii_digit()) => ("", rest),
				None => return Err(format!("invalid endpoint (missing :port): {s}")),
			};

			let host = if host.is_empty() { DEFAULT_BIND_HOST } else { host };

			let port: u16 = port_str
				.trim()
				.parse()
				.map_err(|_| format!("invalid endpoint port (expected 1..=65535): {s}"))?;

			if port == 0 {
				return Err(format!("invalid endpoint port (expected 1..=65535): {s}"));
			}

			Ok(Self::new(host, port))
		}
	}

}
