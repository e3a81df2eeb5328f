//! Analyse des URLs du lecteur.
//!
//! Le dispatch des sources et des sinks se fait sur le schéma de l'URL ;
//! les paramètres de requête transportent les indications annexes
//! (`mime=`, `if=`, `pt=`). Les chemins `file://` acceptent le préfixe `~`
//! pour le répertoire personnel.

use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum UrlError {
    #[error("URL scheme missing or unknown: {0}")]
    UnknownScheme(String),
    #[error("URL host or port missing: {0}")]
    MissingAuthority(String),
    #[error("invalid port in URL: {0}")]
    InvalidPort(String),
}

/// Schémas compris par le lecteur.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    File,
    Unix,
    Http,
    Https,
    Udp,
    Rtp,
    Db,
    /// Carte son locale (sink uniquement) ; le chemin nomme le
    /// périphérique, `default` à défaut.
    Alsa,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::File => "file",
            Scheme::Unix => "unix",
            Scheme::Http => "http",
            Scheme::Https => "https",
            Scheme::Udp => "udp",
            Scheme::Rtp => "rtp",
            Scheme::Db => "db",
            Scheme::Alsa => "alsa",
        }
    }
}

/// URL décomposée : schéma, chemin ou hôte:port, paramètres de requête.
#[derive(Debug, Clone)]
pub struct MediaUrl {
    raw: String,
    scheme: Scheme,
    path: String,
    host: Option<String>,
    port: Option<u16>,
    query: HashMap<String, String>,
}

impl MediaUrl {
    pub fn parse(url: &str) -> Result<Self, UrlError> {
        let (scheme_str, rest) = url
            .split_once("://")
            .ok_or_else(|| UrlError::UnknownScheme(url.to_string()))?;
        let scheme = match scheme_str {
            "file" => Scheme::File,
            "unix" => Scheme::Unix,
            "http" => Scheme::Http,
            "https" => Scheme::Https,
            "udp" => Scheme::Udp,
            "rtp" => Scheme::Rtp,
            "db" => Scheme::Db,
            "alsa" => Scheme::Alsa,
            other => return Err(UrlError::UnknownScheme(other.to_string())),
        };

        let (body, query_str) = match rest.split_once('?') {
            Some((b, q)) => (b, Some(q)),
            None => (rest, None),
        };

        let mut query = HashMap::new();
        if let Some(q) = query_str {
            for pair in q.split('&') {
                if let Some((k, v)) = pair.split_once('=') {
                    query.insert(k.to_string(), v.to_string());
                }
            }
        }

        let (path, host, port) = match scheme {
            Scheme::Udp | Scheme::Rtp => {
                let (host, port_str) = body
                    .rsplit_once(':')
                    .ok_or_else(|| UrlError::MissingAuthority(url.to_string()))?;
                let port = port_str
                    .parse::<u16>()
                    .map_err(|_| UrlError::InvalidPort(url.to_string()))?;
                (String::new(), Some(host.to_string()), Some(port))
            }
            _ => (body.to_string(), None, None),
        };

        Ok(Self {
            raw: url.to_string(),
            scheme,
            path,
            host,
            port,
            query,
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn scheme(&self) -> Scheme {
        self.scheme
    }

    /// Chemin local, avec expansion de `~` vers le répertoire personnel.
    pub fn file_path(&self) -> PathBuf {
        if let Some(stripped) = self.path.strip_prefix('~') {
            if let Some(home) = dirs::home_dir() {
                return home.join(stripped.trim_start_matches('/'));
            }
        }
        PathBuf::from(&self.path)
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Paramètre de requête brut (`mime`, `if`, `pt`, ...).
    pub fn query(&self, key: &str) -> Option<&str> {
        self.query.get(key).map(String::as_str)
    }

    /// Le type MIME annoncé par l'URL, le cas échéant.
    pub fn mime_hint(&self) -> Option<&str> {
        self.query("mime")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_url() {
        let url = MediaUrl::parse("file:///music/a.mp3").unwrap();
        assert_eq!(url.scheme(), Scheme::File);
        assert_eq!(url.path(), "/music/a.mp3");
    }

    #[test]
    fn test_parse_rtp_url_with_query() {
        let url = MediaUrl::parse("rtp://239.1.2.3:5004?pt=96&mime=audio/mp3&if=eth0").unwrap();
        assert_eq!(url.scheme(), Scheme::Rtp);
        assert_eq!(url.host(), Some("239.1.2.3"));
        assert_eq!(url.port(), Some(5004));
        assert_eq!(url.query("pt"), Some("96"));
        assert_eq!(url.mime_hint(), Some("audio/mp3"));
        assert_eq!(url.query("if"), Some("eth0"));
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        assert!(MediaUrl::parse("ftp://host/file").is_err());
        assert!(MediaUrl::parse("no-scheme-at-all").is_err());
    }

    #[test]
    fn test_udp_needs_port() {
        assert!(MediaUrl::parse("udp://239.0.0.1").is_err());
        assert!(MediaUrl::parse("udp://239.0.0.1:notaport").is_err());
    }

    #[test]
    fn test_tilde_expansion() {
        let url = MediaUrl::parse("file://~/music/a.flac").unwrap();
        let path = url.file_path();
        assert!(path.ends_with("music/a.flac"));
        assert!(!path.to_string_lossy().contains('~'));
    }
}
