//! INI-based configuration loading.
//!
//! Sections: `[LOGGER]` (`log_level`), `[MIDDLEWARE]` (`server_ip`,
//! `command_port`, `interrupt_port`, `file_path`, `block_size`,
//! `file_transfer`), `[MODEM]` (the ~25 modem parameters plus the
//! connection-layer fields). Values are read and coerced field-by-field
//! rather than via `serde::Deserialize`, mirroring the explicit, auditable
//! style `LOADCONFIG`'s AT-push table uses — reflection is not used
//! anywhere in this crate.

use anyhow::{bail, Context, Result};
use ini::Ini;

use crate::types::SocketAddress;

/// `(field name, AT mnemonic)` for every `ModemConfig` field that is pushed
/// by `LOADCONFIG`. Connection-layer fields (`connection_mode`, `inet_addr`,
/// `inet_port`, `file_inet_port`, `com_port`, `baudrate`) are deliberately
/// absent — they configure the link, not the modem itself.
pub const AT_CONFIG_TABLE: &[(&str, &str)] = &[
    ("extended_protocol_mode", "AT@ZF"),
    ("extended_notifications", "AT@ZX"),
    ("pool_size", "AT@ZL"),
    ("enable_usbl", "AT@ZU"),
    ("hold_timeout", "AT!ZH"),
    ("enable_awake_remote_mode", "AT!DW"),
    ("remote_active_time", "AT!DR"),
    ("tx_power", "AT!L"),
    ("tx_power_autoset", "AT!LC"),
    ("rx_gain", "AT!G"),
    ("carrier_waveform_id", "AT!C"),
    ("modem_address", "AT!AL"),
    ("max_address", "AT!AM"),
    ("cluster_size", "AT!ZC"),
    ("packet_time", "AT!ZP"),
    ("retry_count", "AT!RC"),
    ("retry_timeout", "AT!RT"),
    ("keep_online_count", "AT!KO"),
    ("idle_timeout", "AT!ZI"),
    ("sound_speed", "AT!CA"),
    ("im_retry_count", "AT!RI"),
    ("promiscuous_mode", "AT!RP"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Tcp,
    Rs232,
}

/// The ~25 named modem parameters plus the 6 connection-layer fields.
#[derive(Debug, Clone)]
pub struct ModemConfig {
    pub connection_mode: ConnectionMode,
    pub inet_addr: String,
    pub inet_port: u16,
    pub file_inet_port: u16,
    pub com_port: String,
    pub baudrate: u32,

    pub extended_protocol_mode: String,
    pub extended_notifications: String,
    pub pool_size: String,
    pub enable_usbl: String,
    pub hold_timeout: String,
    pub enable_awake_remote_mode: String,
    pub remote_active_time: String,
    pub tx_power: String,
    pub tx_power_autoset: String,
    pub rx_gain: String,
    pub carrier_waveform_id: String,
    pub modem_address: String,
    pub max_address: String,
    pub cluster_size: String,
    pub packet_time: String,
    pub retry_count: String,
    pub retry_timeout: String,
    pub keep_online_count: String,
    pub idle_timeout: String,
    pub sound_speed: String,
    pub im_retry_count: String,
    pub promiscuous_mode: String,
}

impl ModemConfig {
    /// Fetch the current value for a field named in [`AT_CONFIG_TABLE`], by
    /// name. Used by `LOADCONFIG` to drive the explicit ordered push.
    pub fn field(&self, name: &str) -> &str {
        match name {
            "extended_protocol_mode" => &self.extended_protocol_mode,
            "extended_notifications" => &self.extended_notifications,
            "pool_size" => &self.pool_size,
            "enable_usbl" => &self.enable_usbl,
            "hold_timeout" => &self.hold_timeout,
            "enable_awake_remote_mode" => &self.enable_awake_remote_mode,
            "remote_active_time" => &self.remote_active_time,
            "tx_power" => &self.tx_power,
            "tx_power_autoset" => &self.tx_power_autoset,
            "rx_gain" => &self.rx_gain,
            "carrier_waveform_id" => &self.carrier_waveform_id,
            "modem_address" => &self.modem_address,
            "max_address" => &self.max_address,
            "cluster_size" => &self.cluster_size,
            "packet_time" => &self.packet_time,
            "retry_count" => &self.retry_count,
            "retry_timeout" => &self.retry_timeout,
            "keep_online_count" => &self.keep_online_count,
            "idle_timeout" => &self.idle_timeout,
            "sound_speed" => &self.sound_speed,
            "im_retry_count" => &self.im_retry_count,
            "promiscuous_mode" => &self.promiscuous_mode,
            other => unreachable!("field {other} not in AT_CONFIG_TABLE"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MiddlewareConfig {
    pub server_ip: String,
    pub command_port: u16,
    pub interrupt_port: u16,
    pub file_path: String,
    pub block_size: usize,
    pub file_transfer: bool,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub log_level: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub logging: LoggingConfig,
    pub middleware: MiddlewareConfig,
    pub modem: ModemConfig,
}

fn get<'a>(section: &'a ini::Properties, key: &str, section_name: &str) -> Result<&'a str> {
    section
        .get(key)
        .with_context(|| format!("missing [{section_name}] {key}"))
}

fn get_or<'a>(section: &'a ini::Properties, key: &str, default: &'a str) -> &'a str {
    section.get(key).unwrap_or(default)
}

impl Config {
    /// Parse an INI file into a fully-populated `Config`. Does not resolve
    /// DNS — call [`Config::resolve_addresses`] afterward.
    pub fn load(path: &str) -> Result<Self> {
        let ini = Ini::load_from_file(path)
            .with_context(|| format!("failed to read INI config at {path}"))?;

        let logger = ini.section(Some("LOGGER")).context("missing [LOGGER] section")?;
        let middleware = ini
            .section(Some("MIDDLEWARE"))
            .context("missing [MIDDLEWARE] section")?;
        let modem = ini.section(Some("MODEM")).context("missing [MODEM] section")?;

        let logging = LoggingConfig {
            log_level: get_or(logger, "log_level", "info").to_string(),
        };

        let middleware = MiddlewareConfig {
            server_ip: get(middleware, "server_ip", "MIDDLEWARE")?.to_string(),
            command_port: get(middleware, "command_port", "MIDDLEWARE")?.parse()?,
            interrupt_port: get(middleware, "interrupt_port", "MIDDLEWARE")?.parse()?,
            file_path: get(middleware, "file_path", "MIDDLEWARE")?.to_string(),
            block_size: get(middleware, "block_size", "MIDDLEWARE")?.parse()?,
            file_transfer: get_or(middleware, "file_transfer", "false")
                .eq_ignore_ascii_case("true"),
        };

        let connection_mode = match get(modem, "connection_mode", "MODEM")?.to_lowercase().as_str() {
            "tcp" => ConnectionMode::Tcp,
            "rs232" => ConnectionMode::Rs232,
            other => bail!("unknown connection_mode '{other}', expected tcp|rs232"),
        };

        let modem = ModemConfig {
            connection_mode,
            inet_addr: get_or(modem, "inet_addr", "").to_string(),
            inet_port: get_or(modem, "inet_port", "0").parse()?,
            file_inet_port: get_or(modem, "file_inet_port", "0").parse()?,
            com_port: get_or(modem, "com_port", "").to_string(),
            baudrate: get_or(modem, "baudrate", "9600").parse()?,

            extended_protocol_mode: get_or(modem, "extended_protocol_mode", "0").to_string(),
            extended_notifications: get_or(modem, "extended_notifications", "0").to_string(),
            pool_size: get_or(modem, "pool_size", "0").to_string(),
            enable_usbl: get_or(modem, "enable_usbl", "0").to_string(),
            hold_timeout: get_or(modem, "hold_timeout", "0").to_string(),
            enable_awake_remote_mode: get_or(modem, "enable_awake_remote_mode", "0").to_string(),
            remote_active_time: get_or(modem, "remote_active_time", "0").to_string(),
            tx_power: get_or(modem, "tx_power", "0").to_string(),
            tx_power_autoset: get_or(modem, "tx_power_autoset", "0").to_string(),
            rx_gain: get_or(modem, "rx_gain", "0").to_string(),
            carrier_waveform_id: get_or(modem, "carrier_waveform_id", "0").to_string(),
            modem_address: get_or(modem, "modem_address", "0").to_string(),
            max_address: get_or(modem, "max_address", "0").to_string(),
            cluster_size: get_or(modem, "cluster_size", "0").to_string(),
            packet_time: get_or(modem, "packet_time", "0").to_string(),
            retry_count: get_or(modem, "retry_count", "0").to_string(),
            retry_timeout: get_or(modem, "retry_timeout", "0").to_string(),
            keep_online_count: get_or(modem, "keep_online_count", "0").to_string(),
            idle_timeout: get_or(modem, "idle_timeout", "0").to_string(),
            sound_speed: get_or(modem, "sound_speed", "0").to_string(),
            im_retry_count: get_or(modem, "im_retry_count", "0").to_string(),
            promiscuous_mode: get_or(modem, "promiscuous_mode", "0").to_string(),
        };

        Ok(Self {
            logging,
            middleware,
            modem,
        })
    }

    /// Resolve `server_ip` and `inet_addr` to dotted IPs via DNS, matching
    /// the original's `SocketAddress` fallback to `gethostbyname` when the
    /// configured host isn't already numeric.
    pub async fn resolve_addresses(
        &self,
    ) -> Result<(SocketAddress, SocketAddress, SocketAddress)> {
        let command = resolve_one(&self.middleware.server_ip, self.middleware.command_port).await?;
        let interrupt =
            resolve_one(&self.middleware.server_ip, self.middleware.interrupt_port).await?;
        let modem_cmd = resolve_one(&self.modem.inet_addr, self.modem.inet_port).await?;
        Ok((command, interrupt, modem_cmd))
    }

    pub async fn resolve_modem_file_address(&self) -> Result<SocketAddress> {
        resolve_one(&self.modem.inet_addr, self.modem.file_inet_port).await
    }
}

async fn resolve_one(host: &str, port: u16) -> Result<SocketAddress> {
    if host.parse::<std::net::Ipv4Addr>().is_ok() {
        return Ok(SocketAddress::new(host, port));
    }
    let mut addrs = tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("DNS resolution failed for {host}"))?;
    let addr = addrs
        .next()
        .with_context(|| format!("no addresses found for {host}"))?;
    Ok(SocketAddress::new(addr.ip().to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn at_config_table_has_21_entries() {
        assert_eq!(AT_CONFIG_TABLE.len(), 21);
    }

    #[test]
    fn modem_config_field_lookup_matches_table() {
        let cfg = ModemConfig {
            connection_mode: ConnectionMode::Tcp,
            inet_addr: String::new(),
            inet_port: 0,
            file_inet_port: 0,
            com_port: String::new(),
            baudrate: 9600,
            extended_protocol_mode: "1".into(),
            extended_notifications: "0".into(),
            pool_size: "0".into(),
            enable_usbl: "0".into(),
            hold_timeout: "0".into(),
            enable_awake_remote_mode: "0".into(),
            remote_active_time: "0".into(),
            tx_power: "0".into(),
            tx_power_autoset: "0".into(),
            rx_gain: "0".into(),
            carrier_waveform_id: "0".into(),
            modem_address: "0".into(),
            max_address: "0".into(),
            cluster_size: "0".into(),
            packet_time: "0".into(),
            retry_count: "0".into(),
            retry_timeout: "0".into(),
            keep_online_count: "0".into(),
            idle_timeout: "0".into(),
            sound_speed: "0".into(),
            im_retry_count: "0".into(),
            promiscuous_mode: "0".into(),
        };
        for (name, _) in AT_CONFIG_TABLE {
            let _ = cfg.field(name);
        }
        assert_eq!(cfg.field("extended_protocol_mode"), "1");
    }
}
