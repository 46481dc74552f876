//! File-channel modem link: a second, independent TCP connection used only
//! for file-transfer frames, gated by the `modem_online` flag (SPEC_FULL.md
//! §2, §6). Disconnects whenever `modem_online` clears (low-power mode) and
//! reconnects once it's set again — unlike the command link, which is
//! always-on.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, error, info};

use crate::queues::{Receiver, Sender, Signals};
use crate::types::{ModemMessage, SocketAddress};

const WAIT_POLL: Duration = Duration::from_millis(crate::queues::QUEUE_TIMEOUT_MS);

pub async fn run(
    address: SocketAddress,
    mut file_tx_rx: Receiver<String>,
    file_rx_tx: Sender<ModemMessage>,
    signals: Signals,
) {
    loop {
        tokio::select! {
            () = signals.modem_online.wait() => {}
            () = tokio::time::sleep(WAIT_POLL) => {}
        }

        if signals.modem_online.is_set() {
            match TcpStream::connect(address.to_socket_addr()).await {
                Ok(stream) => {
                    info!(
                        "connected to modem data channel at {}",
                        address.to_socket_addr()
                    );
                    process(stream, &mut file_tx_rx, &file_rx_tx, &signals).await;
                }
                Err(err) => {
                    error!(
                        "failed to connect to modem data channel at {}: {err}",
                        address.to_socket_addr()
                    );
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }

        if signals.kill_threads.is_set() {
            debug!("TCP modem file client socket CLOSED!");
            return;
        }
    }
}

async fn process(
    stream: TcpStream,
    file_tx_rx: &mut Receiver<String>,
    file_rx_tx: &Sender<ModemMessage>,
    signals: &Signals,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut ticker = tokio::time::interval(WAIT_POLL);

    loop {
        tokio::select! {
            biased;
            line = lines.next_line() => {
                match line {
                    Ok(Some(raw)) => {
                        let _ = file_rx_tx.send(ModemMessage::new(raw)).await;
                    }
                    Ok(None) => {
                        debug!("data channel connection dropped");
                        return;
                    }
                    Err(err) => {
                        error!("modem data channel read error: {err}");
                        return;
                    }
                }
            }
            Some(cmd) = file_tx_rx.recv() => {
                if let Err(err) = write_half.write_all(format!("{cmd}\n").as_bytes()).await {
                    error!("modem data channel write error: {err}");
                    return;
                }
            }
            _ = ticker.tick() => {}
        }

        if !signals.modem_online.is_set() {
            debug!("data channel disconnected, modem in low-power mode");
            let _ = write_half.shutdown().await;
            return;
        }
        if signals.kill_threads.is_set() {
            let _ = write_half.shutdown().await;
            return;
        }
    }
}
