//! Message Handler: sole consumer of the command-channel modem-rx stream,
//! sole producer onto the command-channel modem-tx stream. Classifies every
//! inbound line with a total, deterministic order (SPEC_FULL.md §4.1).

use tracing::debug;

use crate::queues::{Receiver, Sender, Signals};
use crate::types::{ClientCommand, ModemMessage};

pub struct MessageHandler {
    at_command_tx_rx: Receiver<String>,
    modem_tx: Sender<String>,

    modem_rx: Receiver<ModemMessage>,
    at_command_rx_tx: Sender<ModemMessage>,
    modem_interrupt_tx: Sender<ModemMessage>,
    tcp_server_rx_tx: Sender<ClientCommand>,
    /// Defensive: a RECV frame that is not ping/sleep/wakeup is file-transfer
    /// traffic. In the deployed topology this never actually happens on the
    /// command channel (the file channel is a separate connection — see
    /// SPEC_FULL.md §2) but the classification order spec.md describes is
    /// total, so an errant file frame seen here is still routed onward
    /// rather than silently dropped.
    file_rx_tx: Sender<ModemMessage>,

    signals: Signals,
}

impl MessageHandler {
    pub fn new(
        at_command_tx_rx: Receiver<String>,
        modem_tx: Sender<String>,
        modem_rx: Receiver<ModemMessage>,
        at_command_rx_tx: Sender<ModemMessage>,
        modem_interrupt_tx: Sender<ModemMessage>,
        tcp_server_rx_tx: Sender<ClientCommand>,
        file_rx_tx: Sender<ModemMessage>,
        signals: Signals,
    ) -> Self {
        Self {
            at_command_tx_rx,
            modem_tx,
            modem_rx,
            at_command_rx_tx,
            modem_interrupt_tx,
            tcp_server_rx_tx,
            file_rx_tx,
            signals,
        }
    }

    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(
            crate::queues::QUEUE_TIMEOUT_MS,
        ));
        loop {
            tokio::select! {
                biased;
                Some(at_command) = self.at_command_tx_rx.recv() => {
                    debug!("AT command forwarded to modem link: {at_command}");
                    let _ = self.modem_tx.send(at_command).await;
                }
                Some(modem_response) = self.modem_rx.recv() => {
                    self.handle_modem_response(modem_response).await;
                }
                _ = ticker.tick() => {}
            }
            if self.signals.kill_threads.is_set() {
                debug!("Message handler CLOSED!");
                return;
            }
        }
    }

    async fn handle_modem_response(&mut self, modem_response: ModemMessage) {
        if modem_response.is_ping_msg() || modem_response.is_power_ping_msg() {
            debug!("dropped ping echo: {}", modem_response.raw());
        } else if modem_response.is_received_im() {
            debug!("IM routed to interrupt queue: {}", modem_response.raw());
            let _ = self.modem_interrupt_tx.send(modem_response).await;
        } else if modem_response.is_sleep_request() {
            let _ = self
                .tcp_server_rx_tx
                .send(ClientCommand::parse("MODEM SLEEP\n\0"))
                .await;
        } else if modem_response.is_wakeup_request() {
            let _ = self
                .tcp_server_rx_tx
                .send(ClientCommand::parse("MODEM WAKEUP\n\0"))
                .await;
        } else if modem_response.is_position_data() {
            debug!("dropped USBL position report: {}", modem_response.raw());
        } else if modem_response.is_received_data() {
            debug!("file-transfer frame seen on command channel, forwarding");
            let _ = self.file_rx_tx.send(modem_response).await;
        } else {
            debug!("AT reply routed to dispatcher: {}", modem_response.raw());
            let _ = self.at_command_rx_tx.send(modem_response).await;
        }
    }
}
