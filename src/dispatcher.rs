//! Dispatcher: consumes client commands serially, drives the AT
//! request/response exchange with the modem, and produces the client reply
//! (SPEC_FULL.md §4.2). Exchanges are strictly sequential — there is no
//! pipelining of one client command's AT traffic with another's.

use std::path::PathBuf;

use tracing::{debug, warn};

use crate::config::{ModemConfig, AT_CONFIG_TABLE};
use crate::file_handler::FileCommand;
use crate::queues::{Receiver, Sender, Signals};
use crate::types::{ClientCommand, ClientCommandResponse, Measure, ModemMessage};

/// This crate's own version string, emitted as the first line of `MODEM
/// INFO`.
const MIDDLEWARE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// `(label, AT query mnemonic)` for the remaining three `MODEM INFO` lines,
/// queried and emitted in this exact order after `middleware`.
const MODEM_INFO_QUERIES: &[(&str, &str)] =
    &[("firmware", "ATI0"), ("serial", "ATI2"), ("address", "AT?AL")];

pub struct Dispatcher {
    tcp_server_rx: Receiver<ClientCommand>,
    tcp_server_tx: Sender<ClientCommandResponse>,

    at_command_tx: Sender<String>,
    at_command_rx: Receiver<ModemMessage>,

    file_command_tx: Sender<FileCommand>,
    file_command_reply_rx: Receiver<ClientCommandResponse>,

    signals: Signals,
    modem_config: ModemConfig,
    file_path: PathBuf,
}

enum DispatchOutcome {
    Replies(Vec<ClientCommandResponse>),
    /// The modem returned `ERROR...`; the handler aborts the command.
    CmdError,
}

impl Dispatcher {
    pub fn new(
        tcp_server_rx: Receiver<ClientCommand>,
        tcp_server_tx: Sender<ClientCommandResponse>,
        at_command_tx: Sender<String>,
        at_command_rx: Receiver<ModemMessage>,
        file_command_tx: Sender<FileCommand>,
        file_command_reply_rx: Receiver<ClientCommandResponse>,
        signals: Signals,
        modem_config: ModemConfig,
        file_path: PathBuf,
    ) -> Self {
        Self {
            tcp_server_rx,
            tcp_server_tx,
            at_command_tx,
            at_command_rx,
            file_command_tx,
            file_command_reply_rx,
            signals,
            modem_config,
            file_path,
        }
    }

    pub async fn run(mut self) {
        loop {
            match tokio::time::timeout(
                std::time::Duration::from_millis(crate::queues::QUEUE_TIMEOUT_MS),
                self.tcp_server_rx.recv(),
            )
            .await
            {
                Ok(Some(cmd)) => self.handle_command(cmd).await,
                Ok(None) => return,
                Err(_) => {}
            }
            if self.signals.kill_threads.is_set() {
                debug!("Dispatcher CLOSED!");
                return;
            }
        }
    }

    /// One blocking AT request/response exchange: push `cmd` on the AT-tx
    /// queue, block for exactly one reply.
    async fn process_at_command(&mut self, cmd: &str) -> Result<ModemMessage, ()> {
        if self.at_command_tx.send(cmd.to_string()).await.is_err() {
            return Err(());
        }
        match self.at_command_rx.recv().await {
            Some(reply) if reply.is_error() => Err(()),
            Some(reply) => Ok(reply),
            None => Err(()),
        }
    }

    /// Builds and sends `AT*SENDIM,<len>,<addr>,<ack|noack>,<data>`, awaits
    /// the immediate echo, then (if `ack`) awaits the delivery report.
    async fn send_im(&mut self, addr: &str, payload: &str, ack: bool) -> Result<bool, ()> {
        let flag = if ack { "ack" } else { "noack" };
        let cmd = format!("AT*SENDIM,{},{},{},{}", payload.len(), addr, flag, payload);
        self.process_at_command(&cmd).await?;
        if !ack {
            return Ok(true);
        }
        let delivery = self.at_command_rx.recv().await.ok_or(())?;
        Ok(delivery.raw().starts_with("DELIVEREDIM"))
    }

    /// Builds and sends `AT*SEND,<len>,<addr>,<data>` (no ack/noack field),
    /// awaits the echo, then the delivery report, matching `DELIVERED`
    /// rather than `DELIVEREDIM`.
    async fn send_raw_msg(&mut self, addr: &str, payload: &str) -> Result<bool, ()> {
        let cmd = format!("AT*SEND,{},{},{}", payload.len(), addr, payload);
        self.process_at_command(&cmd).await?;
        let delivery = self.at_command_rx.recv().await.ok_or(())?;
        Ok(delivery.raw().starts_with("DELIVERED"))
    }

    async fn handle_command(&mut self, cmd: ClientCommand) {
        let outcome = self.dispatch(&cmd).await;
        match outcome {
            DispatchOutcome::Replies(replies) => {
                for r in replies {
                    let _ = self.tcp_server_tx.send(r).await;
                }
            }
            DispatchOutcome::CmdError => {
                let _ = self
                    .tcp_server_tx
                    .send(ClientCommandResponse::new("CMD ERROR"))
                    .await;
            }
        }
    }

    async fn dispatch(&mut self, cmd: &ClientCommand) -> DispatchOutcome {
        match cmd.verb() {
            "REBOOT" => self.reboot().await,
            "LOADCONFIG" => self.load_config().await,
            "KILL" => {
                self.signals.kill_request.set();
                one(ClientCommandResponse::new("OK"))
            }
            "MODEM" => self.modem(cmd).await,
            "PING" => self.ping(cmd).await,
            "GETMEAS" => self.getmeas(cmd).await,
            "SENDMEAS" => self.sendmeas(cmd).await,
            "GETFILE" => self.getfile(cmd).await,
            "SENDRAW" => self.sendraw(cmd).await,
            "GETDIR" => self.getdir(cmd).await,
            "SENDDIR" => self.senddir(cmd).await,
            "SENDFILE" => self.sendfile(cmd, "SENDFILE").await,
            "FILETRANSFER" => self.filetransfer(cmd),
            _ => DispatchOutcome::CmdError,
        }
    }

    async fn reboot(&mut self) -> DispatchOutcome {
        match self.process_at_command("ATZ0").await {
            Ok(reply) => one(ClientCommandResponse::with_value(
                "REBOOT",
                reply.raw().trim(),
            )),
            Err(()) => DispatchOutcome::CmdError,
        }
    }

    async fn load_config(&mut self) -> DispatchOutcome {
        if self.process_at_command("AT@CTRL").await.is_err() {
            return DispatchOutcome::CmdError;
        }
        for (field, mnemonic) in AT_CONFIG_TABLE {
            let value = self.modem_config.field(field).to_string();
            let cmd = format!("{mnemonic}{value}");
            if self.process_at_command(&cmd).await.is_err() {
                warn!("LOADCONFIG: {field} ({mnemonic}) rejected by modem");
                return DispatchOutcome::CmdError;
            }
        }
        if self.process_at_command("AT&W").await.is_err() {
            return DispatchOutcome::CmdError;
        }
        one(ClientCommandResponse::with_value("CONFIG", "OK"))
    }

    async fn modem(&mut self, cmd: &ClientCommand) -> DispatchOutcome {
        let Some(sub) = cmd.positional(0) else {
            return DispatchOutcome::CmdError;
        };
        let sub = sub.to_uppercase();

        if sub == "SETPOWER" {
            let Some(n) = cmd.positional(1) else {
                return DispatchOutcome::CmdError;
            };
            let Some(level) = validate_power_level(n) else {
                return DispatchOutcome::CmdError;
            };
            return match self.process_at_command(&format!("AT!L{level}")).await {
                Ok(_) => one(ClientCommandResponse::with_value("SETPOWER", "OK")),
                Err(()) => DispatchOutcome::CmdError,
            };
        }

        match sub.as_str() {
            "TIME" => match self.process_at_command("AT?UT").await {
                Ok(reply) => one(ClientCommandResponse::with_value("TIME", reply.raw().trim())),
                Err(()) => DispatchOutcome::CmdError,
            },
            "BATTERY" => match self.process_at_command("AT?BV").await {
                Ok(reply) => one(ClientCommandResponse::with_value(
                    "BATTERY",
                    reply.raw().trim(),
                )),
                Err(()) => DispatchOutcome::CmdError,
            },
            "GETPOWER" => match self.process_at_command("AT?L").await {
                Ok(reply) => one(ClientCommandResponse::with_value(
                    "GETPOWER",
                    clean_power_reply(reply.raw().trim()),
                )),
                Err(()) => DispatchOutcome::CmdError,
            },
            "INFO" => self.modem_info().await,
            _ => DispatchOutcome::CmdError,
        }
    }

    async fn modem_info(&mut self) -> DispatchOutcome {
        let mut replies = vec![ClientCommandResponse::with_value(
            "middleware",
            MIDDLEWARE_VERSION,
        )];
        for (label, query) in MODEM_INFO_QUERIES {
            match self.process_at_command(query).await {
                Ok(reply) => {
                    let value = reply.raw().trim();
                    let value = if *label == "firmware" {
                        format_firmware(value)
                    } else {
                        value.to_string()
                    };
                    replies.push(ClientCommandResponse::with_value(*label, value));
                }
                Err(()) => return DispatchOutcome::CmdError,
            }
        }
        DispatchOutcome::Replies(replies)
    }

    async fn ping(&mut self, cmd: &ClientCommand) -> DispatchOutcome {
        let (Some(sub), Some(addr)) = (cmd.positional(0), cmd.positional(1)) else {
            return DispatchOutcome::CmdError;
        };
        let sub = sub.to_uppercase();

        if sub == "POWER" {
            return match self.send_raw_msg(addr, "pow").await {
                Ok(true) => one(ClientCommandResponse::new("PING OK")),
                Ok(false) => one(ClientCommandResponse::new("PING FAILED")),
                Err(()) => DispatchOutcome::CmdError,
            };
        }

        let query = match sub.as_str() {
            "DELAY" => "AT?T",
            "RSSI" => "AT?E",
            "INTEGRITY" => "AT?I",
            _ => return DispatchOutcome::CmdError,
        };

        match self.send_im(addr, "mwp", true).await {
            Ok(true) => match self.process_at_command(query).await {
                Ok(reply) => one(ClientCommandResponse::with_value(&sub, reply.raw().trim())),
                Err(()) => DispatchOutcome::CmdError,
            },
            Ok(false) => one(ClientCommandResponse::new("PING FAILED")),
            Err(()) => DispatchOutcome::CmdError,
        }
    }

    async fn getmeas(&mut self, cmd: &ClientCommand) -> DispatchOutcome {
        let (Some(kind), Some(addr)) = (cmd.positional(0), cmd.keyed("destino")) else {
            return DispatchOutcome::CmdError;
        };
        let Ok(payload) = Measure::getmeas_encode(&kind.to_uppercase()) else {
            return DispatchOutcome::CmdError;
        };
        match self.send_im(addr, &payload, true).await {
            Ok(true) => one(ClientCommandResponse::new("GETMEAS OK")),
            Ok(false) => one(ClientCommandResponse::new("GETMEAS FAILED")),
            Err(()) => DispatchOutcome::CmdError,
        }
    }

    async fn sendmeas(&mut self, cmd: &ClientCommand) -> DispatchOutcome {
        let Some(addr) = cmd.keyed("destino") else {
            return DispatchOutcome::CmdError;
        };
        let kv = cmd.args().iter().find_map(|a| {
            let (k, v) = a.split_once('=')?;
            if k.eq_ignore_ascii_case("destino") {
                return None;
            }
            Measure::code_for_kind(&k.to_uppercase()).map(|_| (k.to_uppercase(), v.to_string()))
        });
        let Some((kind, value)) = kv else {
            return DispatchOutcome::CmdError;
        };
        let Ok(payload) = Measure::setmeas_encode(&kind, &value) else {
            return DispatchOutcome::CmdError;
        };
        match self.send_im(addr, &payload, true).await {
            Ok(true) => one(ClientCommandResponse::new("SENDMEAS OK")),
            Ok(false) => one(ClientCommandResponse::new("SENDMEAS FAILED")),
            Err(()) => DispatchOutcome::CmdError,
        }
    }

    async fn getfile(&mut self, cmd: &ClientCommand) -> DispatchOutcome {
        let (Some(name), Some(addr)) = (cmd.keyed("nombre"), cmd.keyed("destino")) else {
            return DispatchOutcome::CmdError;
        };
        let payload = Measure::getfile_encode(name);
        match self.send_im(addr, &payload, true).await {
            Ok(true) => one(ClientCommandResponse::new("GETFILE OK")),
            Ok(false) => one(ClientCommandResponse::new("GETFILE FAILED")),
            Err(()) => DispatchOutcome::CmdError,
        }
    }

    async fn sendraw(&mut self, cmd: &ClientCommand) -> DispatchOutcome {
        let (Some(addr), Some(data)) = (cmd.keyed("destino"), cmd.keyed("data")) else {
            return DispatchOutcome::CmdError;
        };
        let payload = Measure::sendraw_encode(data);
        match self.send_im(addr, &payload, true).await {
            Ok(true) => one(ClientCommandResponse::new("SENDRAW OK")),
            Ok(false) => one(ClientCommandResponse::new("SENDRAW FAILED")),
            Err(()) => DispatchOutcome::CmdError,
        }
    }

    async fn getdir(&mut self, cmd: &ClientCommand) -> DispatchOutcome {
        let Some(addr) = cmd.keyed("destino") else {
            return DispatchOutcome::CmdError;
        };
        let payload = if cmd.has_flag("FULL") { "lsf" } else { "ls" };
        match self.send_im(addr, payload, true).await {
            Ok(true) => one(ClientCommandResponse::new("GETDIR OK")),
            Ok(false) => one(ClientCommandResponse::new("GETDIR FAILED")),
            Err(()) => DispatchOutcome::CmdError,
        }
    }

    async fn senddir(&mut self, cmd: &ClientCommand) -> DispatchOutcome {
        let Some(addr) = cmd.keyed("destino") else {
            return DispatchOutcome::CmdError;
        };
        let full = cmd.has_flag("FULL");
        if let Err(e) = self.write_dir_listing(full).await {
            warn!("SENDDIR: failed to generate dir.txt: {e}");
            return one(ClientCommandResponse::new("SENDDIR FAILED"));
        }

        let synthetic = ClientCommand::parse(&format!("SENDFILE NOMBRE=dir.txt DESTINO={addr}\n"));
        match self.sendfile(&synthetic, "SENDDIR").await {
            DispatchOutcome::Replies(replies) => {
                let rewritten = replies
                    .into_iter()
                    .map(|r| {
                        let rendered = r.render();
                        let rewritten = rendered.replacen("SENDFILE", "SENDDIR", 1);
                        ClientCommandResponse::new(rewritten.trim_end().trim_end_matches('\r'))
                    })
                    .collect();
                DispatchOutcome::Replies(rewritten)
            }
            other => other,
        }
    }

    async fn write_dir_listing(&self, full: bool) -> std::io::Result<()> {
        let mut entries = tokio::fs::read_dir(&self.file_path).await?;
        let mut lines = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if full {
                let meta = entry.metadata().await?;
                lines.push(format!("{name}\t{}", meta.len()));
            } else {
                lines.push(name);
            }
        }
        tokio::fs::write(self.file_path.join("dir.txt"), lines.join("\n")).await
    }

    async fn sendfile(&mut self, cmd: &ClientCommand, label: &str) -> DispatchOutcome {
        let (Some(name), Some(addr)) = (cmd.keyed("nombre"), cmd.keyed("destino")) else {
            return DispatchOutcome::CmdError;
        };
        let file_cmd = FileCommand {
            filename: name.to_string(),
            destino: addr.to_string(),
            label: label.to_string(),
        };
        if self.file_command_tx.send(file_cmd).await.is_err() {
            return DispatchOutcome::CmdError;
        }
        match self.file_command_reply_rx.recv().await {
            Some(reply) => one(reply),
            None => DispatchOutcome::CmdError,
        }
    }

    fn filetransfer(&mut self, cmd: &ClientCommand) -> DispatchOutcome {
        match cmd.positional(0).map(str::to_uppercase).as_deref() {
            Some("ENABLE") => {
                self.signals.modem_online.set();
                one(ClientCommandResponse::with_value("FILETRANSFER", "OK"))
            }
            Some("DISABLE") => {
                self.signals.modem_online.clear();
                one(ClientCommandResponse::with_value("FILETRANSFER", "OK"))
            }
            _ => DispatchOutcome::CmdError,
        }
    }
}

fn one(resp: ClientCommandResponse) -> DispatchOutcome {
    DispatchOutcome::Replies(vec![resp])
}

/// `SETPOWER`'s argument must be a bare non-negative integer in `0..=3`,
/// checked before the modem is ever contacted (`dispatcher.py::set_power`).
fn validate_power_level(arg: &str) -> Option<u8> {
    if !arg.chars().all(|c| c.is_ascii_digit()) || arg.is_empty() {
        return None;
    }
    let level: u8 = arg.parse().ok()?;
    (level <= 3).then_some(level)
}

/// `AT?L`'s reply wraps the active level in `[*]` markers; the original
/// strips the literal substring wherever it occurs, not just at the ends.
fn clean_power_reply(raw: &str) -> String {
    raw.replace("[*]", "")
}

/// `ATI0`'s firmware string is reported to clients with a leading `v`
/// (`dispatcher.py::get_modem_firmware_version`).
fn format_firmware(raw: &str) -> String {
    format!("v{raw}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_power_level_accepts_in_range_values() {
        assert_eq!(validate_power_level("0"), Some(0));
        assert_eq!(validate_power_level("3"), Some(3));
    }

    #[test]
    fn validate_power_level_rejects_out_of_range() {
        assert_eq!(validate_power_level("4"), None);
        assert_eq!(validate_power_level("255"), None);
    }

    #[test]
    fn validate_power_level_rejects_non_numeric() {
        assert_eq!(validate_power_level("abc"), None);
        assert_eq!(validate_power_level("-1"), None);
        assert_eq!(validate_power_level(""), None);
    }

    #[test]
    fn clean_power_reply_strips_every_occurrence() {
        assert_eq!(clean_power_reply("[*]1[*]"), "1");
        assert_eq!(clean_power_reply("2"), "2");
    }

    #[test]
    fn format_firmware_prepends_v() {
        assert_eq!(format_firmware("1.2.3"), "v1.2.3");
    }

    #[test]
    fn modem_info_queries_use_the_grounded_mnemonics_in_order() {
        assert_eq!(
            MODEM_INFO_QUERIES,
            [
                ("firmware", "ATI0"),
                ("serial", "ATI2"),
                ("address", "AT?AL"),
            ]
        );
    }
}
