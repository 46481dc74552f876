//! Interrupt Server: single-client, push-only TCP server on
//! `[MIDDLEWARE] interrupt_port`. Never reads from the client, only drains
//! the client-interrupt queue onto the socket (SPEC_FULL.md §6).

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

use crate::queues::{Receiver, Signals};
use crate::types::SocketAddress;

pub async fn run(address: SocketAddress, mut client_interrupt_rx: Receiver<String>, signals: Signals) {
    let listener = match TcpListener::bind(address.to_socket_addr()).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(
                "could not create interrupt server on {}: {err}",
                address.to_socket_addr()
            );
            signals.kill_request.set();
            return;
        }
    };
    info!(
        "interrupt server listening on {}",
        address.to_socket_addr()
    );

    loop {
        tokio::select! {
            biased;
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        info!("{peer} connected to the interrupt server");
                        process(stream, &mut client_interrupt_rx, &signals).await;
                    }
                    Err(err) => error!("interrupt server accept error: {err}"),
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(crate::queues::QUEUE_TIMEOUT_MS)) => {}
        }
        if signals.kill_threads.is_set() {
            debug!("Interrupt server CLOSED!");
            return;
        }
    }
}

async fn process(
    stream: TcpStream,
    client_interrupt_rx: &mut Receiver<String>,
    signals: &Signals,
) {
    let mut stream = stream;
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(
        crate::queues::QUEUE_TIMEOUT_MS,
    ));

    loop {
        tokio::select! {
            biased;
            Some(line) = client_interrupt_rx.recv() => {
                if let Err(err) = stream.write_all(line.as_bytes()).await {
                    error!("interrupt server write error: {err}");
                    return;
                }
            }
            _ = ticker.tick() => {}
        }
        if signals.kill_threads.is_set() {
            let _ = stream.shutdown().await;
            return;
        }
    }
}
