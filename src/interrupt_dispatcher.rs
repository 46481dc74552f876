//! Interrupt Dispatcher: sole consumer of the modem-interrupt queue. Decodes
//! instant-message payloads into the client-facing event line pushed to the
//! Interrupt Server (SPEC_FULL.md §4.3).

use tracing::debug;

use crate::queues::{Receiver, Sender, Signals};
use crate::types::{Measure, ModemMessage};

pub struct InterruptDispatcher {
    modem_interrupt_rx: Receiver<ModemMessage>,
    client_interrupt_tx: Sender<String>,
    signals: Signals,
}

impl InterruptDispatcher {
    pub fn new(
        modem_interrupt_rx: Receiver<ModemMessage>,
        client_interrupt_tx: Sender<String>,
        signals: Signals,
    ) -> Self {
        Self {
            modem_interrupt_rx,
            client_interrupt_tx,
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
                Some(raw) = self.modem_interrupt_rx.recv() => {
                    self.process_interrupt(&raw).await;
                }
                _ = ticker.tick() => {}
            }
            if self.signals.kill_threads.is_set() {
                debug!("Interrupt dispatcher CLOSED!");
                return;
            }
        }
    }

    async fn process_interrupt(&mut self, raw: &ModemMessage) {
        let Some(source) = raw.source_address() else {
            return;
        };
        let Some(payload) = raw.payload() else { return };

        let decoded = if Measure::is_meas_msg(&payload) {
            Measure::meas_decode(&payload)
        } else if Measure::is_file_request(&payload) {
            Measure::getfile_decode(&payload)
        } else if Measure::is_raw_msg(&payload) {
            Measure::rawmsg_decode(&payload)
        } else if Measure::is_list_dir_request(&payload) {
            Measure::listdir_decode(&payload)
        } else {
            None
        };

        let Some(decoded) = decoded else {
            return;
        };

        let line = format!("{decoded} ORIGEN={source}\r\n");
        let _ = self.client_interrupt_tx.send(line).await;
    }
}
