//! Address parsing for tortuga:// servers

use crate::protocol::DEFAULT_PORT;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteAddr {
    pub host: String,
    pub port: u16,
}

impl RemoteAddr {
    pub fn socket_addr(&self) -> String {
        if self.host.contains(':') {
            // Bare IPv6 literal
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl std::fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tortuga://{}", self.socket_addr())
    }
}

/// Accepts `host`, `host:port`, `[v6]:port` and the same with a `tortuga://` scheme.
/// A trailing path is ignored. Returns None for other schemes or an empty host.
pub fn parse_remote_addr(s: &str) -> Option<RemoteAddr> {
    let s_trim = s.trim();
    let rest = match s_trim.find("://") {
        Some(i) => {
            if !s_trim[..i].eq_ignore_ascii_case("tortuga") {
                return None;
            }
            &s_trim[i + 3..]
        }
        None => s_trim,
    };
    let hp = rest.split('/').next().unwrap_or("");
    if hp.is_empty() {
        return None;
    }

    if let Some(v6) = hp.strip_prefix('[') {
        let (host, after) = v6.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None => DEFAULT_PORT,
        };
        return Some(RemoteAddr {
            host: host.to_string(),
            port,
        });
    }

    let (host, port) = match hp.rsplit_once(':') {
        Some((h, pr)) => (h.to_string(), pr.parse().ok()?),
        None => (hp.to_string(), DEFAULT_PORT),
    };
    if host.is_empty() {
        return None;
    }
    Some(RemoteAddr { host, port })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        assert_eq!(
            parse_remote_addr("books.lan"),
            Some(RemoteAddr { host: "books.lan".into(), port: 9031 })
        );
        assert_eq!(
            parse_remote_addr("books.lan:2222"),
            Some(RemoteAddr { host: "books.lan".into(), port: 2222 })
        );
        assert_eq!(
            parse_remote_addr("tortuga://10.0.0.5:7000/library"),
            Some(RemoteAddr { host: "10.0.0.5".into(), port: 7000 })
        );
        assert_eq!(
            parse_remote_addr("[::1]:7000"),
            Some(RemoteAddr { host: "::1".into(), port: 7000 })
        );
    }

    #[test]
    fn test_parse_rejects() {
        assert_eq!(parse_remote_addr("https://books.lan"), None);
        assert_eq!(parse_remote_addr("tortuga://"), None);
        assert_eq!(parse_remote_addr("books.lan:notaport"), None);
        assert_eq!(parse_remote_addr(":9031"), None);
    }

    #[test]
    fn test_socket_addr() {
        let a = parse_remote_addr("[::1]").unwrap();
        assert_eq!(a.socket_addr(), "[::1]:9031");
        assert_eq!(a.to_string(), "tortuga://[::1]:9031");
    }
}
