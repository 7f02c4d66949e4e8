use serde::Serialize;

use std::collections::HashMap;

use crate::config::{Config, DnsProvider};
use crate::link::Protocol;
use crate::split_tunnel::{self, DIRECT_OUTBOUND, PROXY_OUTBOUND};

pub const TUN_TAG: &str = "tun-in";
pub const BLOCK_OUTBOUND: &str = "block";
pub const DNS_OUTBOUND: &str = "dns-out";
pub const INTERFACE_NAME: &str = "MRVPN";
pub const CONTROLLER_ADDR: &str = "127.0.0.1:9090";

const TUN_INET4: &str = "172.19.0.1/30";
const TUN_INET6: &str = "fdfe:dcba:9876::1/126";

/// Complete configuration document handed to the embedded proxy engine.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Document {
    pub log: LogConfig,
    pub dns: DnsConfig,
    pub inbounds: Vec<Inbound>,
    pub outbounds: Vec<Outbound>,
    pub route: RouteConfig,
    pub experimental: Experimental,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LogConfig {
    pub level: String,
    pub timestamp: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DnsConfig {
    pub servers: Vec<DnsServer>,
    pub rules: Vec<DnsRule>,
    #[serde(rename = "final")]
    pub final_server: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DnsServer {
    pub tag: String,
    pub address: String,
    pub detour: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DnsRule {
    pub outbound: Vec<String>,
    pub server: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Inbound {
    Tun {
        tag: String,
        interface_name: String,
        inet4_address: String,
        inet6_address: String,
        mtu: u32,
        auto_route: bool,
        strict_route: bool,
        stack: String,
        sniff: bool,
        sniff_override_destination: bool,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Vless(VlessOutbound),
    Hysteria2(Hysteria2Outbound),
    Direct { tag: String },
    Block { tag: String },
    Dns { tag: String },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VlessOutbound {
    pub tag: String,
    pub server: String,
    pub server_port: u16,
    pub uuid: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport: Option<Transport>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Hysteria2Outbound {
    pub tag: String,
    pub server: String,
    pub server_port: u16,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub up_mbps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub down_mbps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub obfs: Option<Obfs>,
    pub tls: TlsConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TlsConfig {
    pub enabled: bool,
    pub server_name: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub insecure: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alpn: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utls: Option<Utls>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reality: Option<Reality>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Utls {
    pub enabled: bool,
    pub fingerprint: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Reality {
    pub enabled: bool,
    pub public_key: String,
    pub short_id: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Obfs {
    #[serde(rename = "type")]
    pub obfs_type: String,
    pub password: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Transport {
    Ws {
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
    },
    Grpc {
        service_name: String,
    },
    Http {
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        host: Option<Vec<String>>,
    },
    HttpUpgrade {
        #[serde(skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        host: Option<String>,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RouteConfig {
    pub rules: Vec<RouteRule>,
    #[serde(rename = "final")]
    pub final_outbound: String,
    pub auto_detect_interface: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub find_process: Option<bool>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RouteRule {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process_name: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain_suffix: Option<Vec<String>>,
    pub outbound: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Experimental {
    pub clash_api: ClashApi,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClashApi {
    pub external_controller: String,
}

/// Assembles the full engine document for one tunnel attempt.
pub fn build(config: &Config) -> Document {
    let compiled = split_tunnel::compile(&config.split_tunnel);

    let mut rules = vec![RouteRule {
        protocol: Some(vec!["dns".to_string()]),
        outbound: DNS_OUTBOUND.to_string(),
        ..RouteRule::default()
    }];
    rules.extend(compiled.rules);

    Document {
        log: LogConfig {
            level: "info".to_string(),
            timestamp: true,
        },
        dns: dns_config(config),
        inbounds: vec![Inbound::Tun {
            tag: TUN_TAG.to_string(),
            interface_name: INTERFACE_NAME.to_string(),
            inet4_address: TUN_INET4.to_string(),
            inet6_address: TUN_INET6.to_string(),
            mtu: config.mtu,
            auto_route: true,
            strict_route: config.kill_switch,
            stack: "mixed".to_string(),
            sniff: true,
            sniff_override_destination: true,
        }],
        outbounds: vec![
            proxy_outbound(config),
            Outbound::Direct {
                tag: DIRECT_OUTBOUND.to_string(),
            },
            Outbound::Block {
                tag: BLOCK_OUTBOUND.to_string(),
            },
            Outbound::Dns {
                tag: DNS_OUTBOUND.to_string(),
            },
        ],
        route: RouteConfig {
            rules,
            final_outbound: compiled.final_outbound,
            auto_detect_interface: true,
            find_process: compiled.find_process.then_some(true),
        },
        experimental: Experimental {
            clash_api: ClashApi {
                external_controller: CONTROLLER_ADDR.to_string(),
            },
        },
    }
}

fn dns_config(config: &Config) -> DnsConfig {
    let (remote, local) = dns_addresses(config);
    DnsConfig {
        servers: vec![
            DnsServer {
                tag: "dns-remote".to_string(),
                address: remote,
                detour: PROXY_OUTBOUND.to_string(),
            },
            DnsServer {
                tag: "dns-local".to_string(),
                address: local,
                detour: DIRECT_OUTBOUND.to_string(),
            },
        ],
        rules: vec![DnsRule {
            outbound: vec!["any".to_string()],
            server: "dns-local".to_string(),
        }],
        final_server: "dns-remote".to_string(),
    }
}

fn dns_addresses(config: &Config) -> (String, String) {
    let cloudflare = || ("https://cloudflare-dns.com/dns-query".to_string(), "1.1.1.1".to_string());
    match config.dns {
        DnsProvider::Cloudflare => cloudflare(),
        DnsProvider::Google => ("https://dns.google/dns-query".to_string(), "8.8.8.8".to_string()),
        DnsProvider::Custom => match config.custom_dns.as_deref().map(str::trim) {
            Some(custom) if !custom.is_empty() => (custom.to_string(), custom.to_string()),
            _ => cloudflare(),
        },
        DnsProvider::System => ("local".to_string(), "local".to_string()),
    }
}

fn proxy_outbound(config: &Config) -> Outbound {
    let server = &config.server;
    match server.protocol {
        Protocol::Vless => Outbound::Vless(vless_outbound(config)),
        Protocol::Hysteria2 => Outbound::Hysteria2(hysteria2_outbound(config)),
    }
}

fn vless_outbound(config: &Config) -> VlessOutbound {
    let server = &config.server;
    let params = &server.params;

    VlessOutbound {
        tag: PROXY_OUTBOUND.to_string(),
        server: server.address.clone(),
        server_port: server.port,
        uuid: params.get("uuid").cloned().unwrap_or_default(),
        flow: non_empty(params.get("flow")),
        tls: vless_tls(config),
        transport: vless_transport(params),
    }
}

fn vless_tls(config: &Config) -> Option<TlsConfig> {
    let server = &config.server;
    let params = &server.params;
    let security = params.get("security").map(String::as_str).unwrap_or("none");
    if security != "tls" && security != "reality" {
        return None;
    }

    let reality = (security == "reality").then(|| Reality {
        enabled: true,
        public_key: params.get("pbk").cloned().unwrap_or_default(),
        short_id: params.get("sid").cloned().unwrap_or_default(),
    });

    Some(TlsConfig {
        enabled: true,
        server_name: non_empty(params.get("sni")).unwrap_or_else(|| server.address.clone()),
        insecure: false,
        alpn: split_alpn(params.get("alpn")),
        utls: non_empty(params.get("fp")).map(|fingerprint| Utls {
            enabled: true,
            fingerprint,
        }),
        reality,
    })
}

fn vless_transport(params: &HashMap<String, String>) -> Option<Transport> {
    let path = non_empty(params.get("path"));
    let host = non_empty(params.get("host"));
    match params.get("type").map(String::as_str).unwrap_or("tcp") {
        "ws" => Some(Transport::Ws {
            path,
            headers: host.map(|h| HashMap::from([("Host".to_string(), h)])),
        }),
        "grpc" => Some(Transport::Grpc {
            service_name: params.get("serviceName").cloned().unwrap_or_default(),
        }),
        "h2" | "http" => Some(Transport::Http {
            path,
            host: host.map(|h| vec![h]),
        }),
        "httpupgrade" => Some(Transport::HttpUpgrade { path, host }),
        _ => None,
    }
}

fn hysteria2_outbound(config: &Config) -> Hysteria2Outbound {
    let server = &config.server;
    let params = &server.params;

    let insecure = matches!(params.get("insecure").map(String::as_str), Some("1") | Some("true"));
    if insecure {
        tracing::warn!(server = %server.address, "hysteria2 certificate verification disabled by link");
    }

    let obfs = non_empty(params.get("obfs")).map(|obfs_type| Obfs {
        obfs_type,
        password: params.get("obfs-password").cloned().unwrap_or_default(),
    });

    Hysteria2Outbound {
        tag: PROXY_OUTBOUND.to_string(),
        server: server.address.clone(),
        server_port: server.port,
        password: params.get("password").cloned().unwrap_or_default(),
        up_mbps: parse_mbps(params.get("up")),
        down_mbps: parse_mbps(params.get("down")),
        obfs,
        tls: TlsConfig {
            enabled: true,
            server_name: non_empty(params.get("sni")).unwrap_or_else(|| server.address.clone()),
            insecure,
            alpn: split_alpn(params.get("alpn")),
            utls: None,
            reality: None,
        },
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty()).map(str::to_string)
}

fn split_alpn(value: Option<&String>) -> Option<Vec<String>> {
    let csv = non_empty(value)?;
    let entries: Vec<String> = csv
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if entries.is_empty() { None } else { Some(entries) }
}

// bandwidth params carry either a bare number or a "<n> mbps" spelling
fn parse_mbps(value: Option<&String>) -> Option<u32> {
    let digits: String = value?.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link;
    use crate::split_tunnel::{Mode, SplitTunnelConfig};

    fn vless_config(link_str: &str) -> Config {
        Config::new(link::parse(link_str).expect("parse link"))
    }

    #[test]
    fn document_has_expected_shape() -> anyhow::Result<()> {
        let config = vless_config("vless://uuid@example.com:443");
        let doc = serde_json::to_value(build(&config))?;

        let inbounds = doc["inbounds"].as_array().expect("inbounds");
        assert_eq!(inbounds.len(), 1);
        assert_eq!(inbounds[0]["type"], "tun");
        assert_eq!(inbounds[0]["tag"], TUN_TAG);
        assert_eq!(inbounds[0]["interface_name"], INTERFACE_NAME);
        assert_eq!(inbounds[0]["mtu"], 9000);
        assert_eq!(inbounds[0]["strict_route"], false);

        let tags: Vec<&str> = doc["outbounds"]
            .as_array()
            .expect("outbounds")
            .iter()
            .map(|o| o["tag"].as_str().unwrap())
            .collect();
        assert_eq!(tags, vec!["proxy", "direct", "block", "dns-out"]);

        let rules = doc["route"]["rules"].as_array().expect("rules");
        assert_eq!(rules[0]["protocol"][0], "dns");
        assert_eq!(rules[0]["outbound"], DNS_OUTBOUND);
        assert_eq!(doc["route"]["final"], "proxy");
        assert!(doc["route"].get("find_process").is_none());

        assert_eq!(doc["experimental"]["clash_api"]["external_controller"], CONTROLLER_ADDR);
        Ok(())
    }

    #[test]
    fn app_mode_enables_process_matching() -> anyhow::Result<()> {
        let mut config = vless_config("vless://uuid@example.com:443");
        config.split_tunnel = SplitTunnelConfig {
            mode: Mode::App,
            apps: vec!["chrome.exe".to_string()],
            domains: vec![],
            invert: false,
        };
        let doc = serde_json::to_value(build(&config))?;

        assert_eq!(doc["route"]["find_process"], true);
        assert_eq!(doc["route"]["final"], "direct");
        let rules = doc["route"]["rules"].as_array().expect("rules");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[1]["process_name"][0], "chrome.exe");
        assert_eq!(rules[1]["outbound"], "proxy");
        Ok(())
    }

    #[test]
    fn kill_switch_maps_to_strict_route() -> anyhow::Result<()> {
        let mut config = vless_config("vless://uuid@example.com:443");
        config.kill_switch = true;
        let doc = serde_json::to_value(build(&config))?;
        assert_eq!(doc["inbounds"][0]["strict_route"], true);
        Ok(())
    }

    #[test]
    fn vless_reality_and_transport_blocks() -> anyhow::Result<()> {
        let config = vless_config(
            "vless://uuid@example.com:443?type=ws&path=/ws&host=cdn.example&security=reality&sni=sni.example&pbk=PUBKEY&sid=0123&fp=chrome&alpn=h2,http/1.1&flow=xtls-rprx-vision",
        );
        let doc = serde_json::to_value(build(&config))?;
        let proxy = &doc["outbounds"][0];

        assert_eq!(proxy["type"], "vless");
        assert_eq!(proxy["flow"], "xtls-rprx-vision");
        assert_eq!(proxy["transport"]["type"], "ws");
        assert_eq!(proxy["transport"]["path"], "/ws");
        assert_eq!(proxy["transport"]["headers"]["Host"], "cdn.example");
        assert_eq!(proxy["tls"]["enabled"], true);
        assert_eq!(proxy["tls"]["server_name"], "sni.example");
        assert_eq!(proxy["tls"]["alpn"], serde_json::json!(["h2", "http/1.1"]));
        assert_eq!(proxy["tls"]["utls"]["fingerprint"], "chrome");
        assert_eq!(proxy["tls"]["reality"]["public_key"], "PUBKEY");
        assert_eq!(proxy["tls"]["reality"]["short_id"], "0123");
        Ok(())
    }

    #[test]
    fn plain_vless_has_no_tls_or_transport() -> anyhow::Result<()> {
        let config = vless_config("vless://uuid@example.com:443");
        let doc = serde_json::to_value(build(&config))?;
        let proxy = &doc["outbounds"][0];

        assert!(proxy.get("tls").is_none());
        assert!(proxy.get("transport").is_none());
        Ok(())
    }

    #[test]
    fn hysteria2_outbound_carries_obfs_and_bandwidth() -> anyhow::Result<()> {
        let config = vless_config(
            "hy2://pw@1.2.3.4?obfs=salamander&obfs-password=x&insecure=1&up=50&down=100 mbps",
        );
        let doc = serde_json::to_value(build(&config))?;
        let proxy = &doc["outbounds"][0];

        assert_eq!(proxy["type"], "hysteria2");
        assert_eq!(proxy["password"], "pw");
        assert_eq!(proxy["obfs"]["type"], "salamander");
        assert_eq!(proxy["obfs"]["password"], "x");
        assert_eq!(proxy["up_mbps"], 50);
        assert_eq!(proxy["down_mbps"], 100);
        assert_eq!(proxy["tls"]["enabled"], true);
        assert_eq!(proxy["tls"]["insecure"], true);
        Ok(())
    }

    #[test]
    fn dns_servers_follow_the_selected_provider() -> anyhow::Result<()> {
        let mut config = vless_config("vless://uuid@example.com:443");
        config.dns = DnsProvider::Google;
        let doc = serde_json::to_value(build(&config))?;

        assert_eq!(doc["dns"]["servers"][0]["address"], "https://dns.google/dns-query");
        assert_eq!(doc["dns"]["servers"][0]["detour"], "proxy");
        assert_eq!(doc["dns"]["servers"][1]["address"], "8.8.8.8");
        assert_eq!(doc["dns"]["servers"][1]["detour"], "direct");
        assert_eq!(doc["dns"]["rules"][0]["outbound"][0], "any");
        assert_eq!(doc["dns"]["final"], "dns-remote");
        Ok(())
    }

    #[test]
    fn custom_dns_falls_back_when_unset() -> anyhow::Result<()> {
        let mut config = vless_config("vless://uuid@example.com:443");
        config.dns = DnsProvider::Custom;
        let doc = serde_json::to_value(build(&config))?;
        assert_eq!(doc["dns"]["servers"][0]["address"], "https://cloudflare-dns.com/dns-query");

        config.custom_dns = Some("10.10.0.53".to_string());
        let doc = serde_json::to_value(build(&config))?;
        assert_eq!(doc["dns"]["servers"][0]["address"], "10.10.0.53");
        assert_eq!(doc["dns"]["servers"][1]["address"], "10.10.0.53");
        Ok(())
    }
}
