use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use std::collections::HashMap;
use std::fmt::{self, Display};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vless,
    Hysteria2,
}

/// Normalized description of a remote proxy server as parsed from a share link.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    pub protocol: Protocol,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub params: HashMap<String, String>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("unrecognized link scheme `{0}`")]
    InvalidScheme(String),
    #[error("link carries no credential")]
    MissingCredential,
    #[error("link carries no host")]
    MissingHost,
    #[error("invalid port")]
    InvalidPort,
    #[error("failed parsing link: {0}")]
    Url(url::ParseError),
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        match e {
            url::ParseError::InvalidPort => Error::InvalidPort,
            url::ParseError::EmptyHost => Error::MissingHost,
            e => Error::Url(e),
        }
    }
}

/// Parses a `vless://`, `hysteria2://` or `hy2://` share link.
pub fn parse(link: &str) -> Result<ServerConfig, Error> {
    let url = Url::parse(link.trim())?;

    let protocol = match url.scheme() {
        "vless" => Protocol::Vless,
        "hysteria2" | "hy2" => Protocol::Hysteria2,
        other => return Err(Error::InvalidScheme(other.to_string())),
    };

    let credential = userinfo(&url).ok_or(Error::MissingCredential)?;

    let address = url
        .host_str()
        .map(|h| h.trim_matches(['[', ']']).to_string())
        .filter(|h| !h.is_empty())
        .ok_or(Error::MissingHost)?;

    let port = match url.port() {
        Some(0) => return Err(Error::InvalidPort),
        Some(p) => p,
        None => 443,
    };

    let mut params: HashMap<String, String> = HashMap::new();
    // multi-valued keys flatten to their first value
    for (key, value) in url.query_pairs() {
        params.entry(key.into_owned()).or_insert_with(|| value.into_owned());
    }

    match protocol {
        Protocol::Vless => {
            params.entry("type".to_string()).or_insert_with(|| "tcp".to_string());
            params.entry("security".to_string()).or_insert_with(|| "none".to_string());
            params.insert("uuid".to_string(), credential);
        }
        Protocol::Hysteria2 => {
            params.insert("password".to_string(), credential);
        }
    }

    let name = display_name(&url).unwrap_or_else(|| address.clone());

    Ok(ServerConfig {
        protocol,
        name,
        address,
        port,
        params,
    })
}

fn userinfo(url: &Url) -> Option<String> {
    let user = decode(url.username());
    let credential = match url.password() {
        Some(pass) => {
            let pass = decode(pass);
            if user.is_empty() {
                pass
            } else {
                format!("{user}:{pass}")
            }
        }
        None => user,
    };
    if credential.is_empty() { None } else { Some(credential) }
}

fn display_name(url: &Url) -> Option<String> {
    let fragment = url.fragment()?;
    let name: String = decode(fragment).chars().filter(|c| !c.is_control()).collect();
    let name = name.trim().to_string();
    if name.is_empty() { None } else { Some(name) }
}

fn decode(s: &str) -> String {
    urlencoding::decode(s).map(|d| d.into_owned()).unwrap_or_else(|_| s.to_string())
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

impl AsRef<str> for Protocol {
    fn as_ref(&self) -> &str {
        match self {
            Protocol::Vless => "vless",
            Protocol::Hysteria2 => "hysteria2",
        }
    }
}
