//! Command Server: single-client TCP server accepting client connections on
//! `[MIDDLEWARE] command_port`. Reads `\n`-delimited command lines onto the
//! command queue and writes dispatcher replies back out (SPEC_FULL.md §6).
//!
//! Only one client is accepted at a time (`listen(1)` in the original); a
//! second connection attempt waits until the first disconnects.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::queues::{Receiver, Sender, Signals};
use crate::types::{ClientCommand, ClientCommandResponse, SocketAddress};

pub async fn run(
    address: SocketAddress,
    tcp_server_rx_tx: Sender<ClientCommand>,
    mut tcp_server_tx_rx: Receiver<ClientCommandResponse>,
    signals: Signals,
) {
    let listener = match TcpListener::bind(address.to_socket_addr()).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(
                "could not create command server on {}: {err}",
                address.to_socket_addr()
            );
            signals.kill_request.set();
            return;
        }
    };
    info!("command server listening on {}", address.to_socket_addr());

    loop {
        tokio::select! {
            biased;
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        info!("{peer} connected to the command server");
                        process(stream, &tcp_server_rx_tx, &mut tcp_server_tx_rx, &signals).await;
                    }
                    Err(err) => error!("command server accept error: {err}"),
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(crate::queues::QUEUE_TIMEOUT_MS)) => {}
        }
        if signals.kill_threads.is_set() {
            debug!("Command server CLOSED!");
            return;
        }
    }
}

async fn process(
    stream: TcpStream,
    tcp_server_rx_tx: &Sender<ClientCommand>,
    tcp_server_tx_rx: &mut Receiver<ClientCommandResponse>,
    signals: &Signals,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(
        crate::queues::QUEUE_TIMEOUT_MS,
    ));

    loop {
        tokio::select! {
            biased;
            line = lines.next_line() => {
                match line {
                    Ok(Some(raw)) => {
                        debug!("DATOS RECIBIDOS EN TCP COMMAND THREAD: {raw}");
                        let _ = tcp_server_rx_tx.send(ClientCommand::parse(&raw)).await;
                    }
                    Ok(None) => {
                        info!("client disconnected from the command server");
                        return;
                    }
                    Err(err) => {
                        error!("command server read error: {err}");
                        return;
                    }
                }
            }
            Some(resp) = tcp_server_tx_rx.recv() => {
                if let Err(err) = write_half.write_all(resp.render().as_bytes()).await {
                    error!("command server write error: {err}");
                    return;
                }
            }
            _ = ticker.tick() => {}
        }
        if signals.kill_threads.is_set() {
            let _ = write_half.shutdown().await;
            return;
        }
    }
}
