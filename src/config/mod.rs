use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

pub struct Config {
    pub host: String,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()
                .expect("Invalid SERVER_PORT"),
        }
    }

    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(self.parse_host_to_ipv4()), self.port)
    }

    fn parse_host_to_ipv4(&self) -> Ipv4Addr {
        if let Ok(addr) = self.host.parse::<IpAddr>() {
            match addr {
                IpAddr::V4(ipv4) => return ipv4,
                IpAddr::V6(_) => {
                    tracing::warn!(
                        host = %self.host,
                        "IPv6 address provided but only IPv4 supported, using 0.0.0.0"
                    );
                    return Ipv4Addr::UNSPECIFIED;
                }
            }
        }

        match self.host.as_str() {
            "localhost" => Ipv4Addr::LOCALHOST,
            "" | "0.0.0.0" => Ipv4Addr::UNSPECIFIED,
            _ => {
                tracing::warn!(
                    host = %self.host,
                    "Unable to parse host as IPv4, using 0.0.0.0"
                );
                Ipv4Addr::UNSPECIFIED
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_localhost() {
        let config = Config {
            host: "localhost".to_string(),
            port: 8080,
        };

        assert_eq!(config.bind_address(), "127.0.0.1:8080".parse().unwrap());
    }

    #[test]
    fn test_parse_ipv4_address() {
        let config = Config {
            host: "192.168.1.1".to_string(),
            port: 3000,
        };

        assert_eq!(config.bind_address(), "192.168.1.1:3000".parse().unwrap());
    }

    #[test]
    fn test_parse_invalid_hostname_defaults_to_all() {
        let config = Config {
            host: "invalid-hostname".to_string(),
            port: 9000,
        };

        assert_eq!(config.bind_address(), "0.0.0.0:9000".parse().unwrap());
    }
}
