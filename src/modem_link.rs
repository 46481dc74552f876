//! Command-channel modem link: the single physical connection to the modem
//! that Message Handler exchanges AT traffic over (SPEC_FULL.md §6). Either
//! a TCP socket or an RS-232 port, selected by `[MODEM] connection_mode`.
//!
//! Both variants are reconnect loops: lose the connection, retry. Neither
//! variant owns any protocol knowledge — that is Message Handler's job, this
//! module only turns `String` AT command lines into bytes on the wire and
//! raw lines back into [`ModemMessage`].

use std::io;
use std::time::Duration;

use nix::sys::termios::{self, BaudRate, SetArg};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, error, info};

use crate::config::{ConnectionMode, ModemConfig};
use crate::queues::{Receiver, Sender, Signals};
use crate::types::{ModemMessage, SocketAddress};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

pub enum ModemLink {
    Tcp {
        address: SocketAddress,
    },
    Serial {
        port: String,
        baudrate: u32,
    },
}

impl ModemLink {
    pub fn from_config(config: &ModemConfig, address: SocketAddress) -> Self {
        match config.connection_mode {
            ConnectionMode::Tcp => ModemLink::Tcp { address },
            ConnectionMode::Rs232 => ModemLink::Serial {
                port: config.com_port.clone(),
                baudrate: config.baudrate,
            },
        }
    }

    pub async fn run(
        self,
        modem_tx_rx: Receiver<String>,
        modem_rx_tx: Sender<ModemMessage>,
        signals: Signals,
    ) {
        match self {
            ModemLink::Tcp { address } => {
                run_tcp(address, modem_tx_rx, modem_rx_tx, signals).await;
            }
            ModemLink::Serial { port, baudrate } => {
                run_serial(&port, baudrate, modem_tx_rx, modem_rx_tx, signals).await;
            }
        }
    }
}

async fn run_tcp(
    address: SocketAddress,
    mut modem_tx_rx: Receiver<String>,
    modem_rx_tx: Sender<ModemMessage>,
    signals: Signals,
) {
    loop {
        match TcpStream::connect(address.to_socket_addr()).await {
            Ok(stream) => {
                info!("connected to modem at {}", address.to_socket_addr());
                process_tcp(stream, &mut modem_tx_rx, &modem_rx_tx, &signals).await;
            }
            Err(err) => {
                error!(
                    "failed to connect to modem at {}: {err}",
                    address.to_socket_addr()
                );
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
        if signals.kill_threads.is_set() {
            debug!("TCP modem client socket CLOSED!");
            return;
        }
    }
}

async fn process_tcp(
    stream: TcpStream,
    modem_tx_rx: &mut Receiver<String>,
    modem_rx_tx: &Sender<ModemMessage>,
    signals: &Signals,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut modem_rebooting = false;
    let mut ticker = tokio::time::interval(Duration::from_millis(
        crate::queues::QUEUE_TIMEOUT_MS,
    ));

    loop {
        tokio::select! {
            biased;
            line = lines.next_line() => {
                match line {
                    Ok(Some(raw)) => {
                        debug!("RECIBIDO TCP: {raw}");
                        let _ = modem_rx_tx.send(ModemMessage::new(raw)).await;
                    }
                    Ok(None) => {
                        if modem_rebooting {
                            info!("modem is rebooting");
                            tokio::time::sleep(Duration::from_secs(1)).await;
                            modem_rebooting = false;
                        } else {
                            debug!("modem connection dropped");
                        }
                        return;
                    }
                    Err(err) => {
                        error!("modem socket read error: {err}");
                        return;
                    }
                }
            }
            Some(cmd) = modem_tx_rx.recv() => {
                debug!("ENVIADO TCP: {cmd}");
                if cmd.contains("ATZ0") {
                    modem_rebooting = true;
                }
                if let Err(err) = write_half.write_all(format!("{cmd}\n").as_bytes()).await {
                    error!("modem socket write error: {err}");
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

async fn run_serial(
    port: &str,
    baudrate: u32,
    mut modem_tx_rx: Receiver<String>,
    modem_rx_tx: Sender<ModemMessage>,
    signals: Signals,
) {
    loop {
        match open_serial(port, baudrate) {
            Ok(file) => {
                info!("opened serial modem port {port} at {baudrate} baud");
                process_serial(file, &mut modem_tx_rx, &modem_rx_tx, &signals).await;
            }
            Err(err) => {
                error!("failed to open serial port {port}: {err}");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
        if signals.kill_threads.is_set() {
            debug!("Serial modem CLOSED!");
            return;
        }
    }
}

fn open_serial(port: &str, baudrate: u32) -> io::Result<tokio::fs::File> {
    let std_file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(port)?;

    let mut tio = termios::tcgetattr(&std_file)?;
    termios::cfmakeraw(&mut tio);
    let speed = baud_rate(baudrate);
    termios::cfsetspeed(&mut tio, speed)?;
    termios::tcsetattr(&std_file, SetArg::TCSANOW, &tio)?;

    Ok(tokio::fs::File::from_std(std_file))
}

fn baud_rate(baudrate: u32) -> BaudRate {
    match baudrate {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        _ => BaudRate::B9600,
    }
}

async fn process_serial(
    file: tokio::fs::File,
    modem_tx_rx: &mut Receiver<String>,
    modem_rx_tx: &Sender<ModemMessage>,
    signals: &Signals,
) {
    let (read_half, mut write_half) = tokio::io::split(file);
    let mut lines = BufReader::new(read_half).lines();
    let mut ticker = tokio::time::interval(Duration::from_millis(
        crate::queues::QUEUE_TIMEOUT_MS,
    ));

    loop {
        tokio::select! {
            biased;
            line = lines.next_line() => {
                match line {
                    Ok(Some(raw)) => {
                        let _ = modem_rx_tx.send(ModemMessage::new(raw)).await;
                    }
                    Ok(None) => return,
                    Err(err) => {
                        error!("serial modem read error: {err}");
                        return;
                    }
                }
            }
            Some(cmd) = modem_tx_rx.recv() => {
                if let Err(err) = write_half.write_all(format!("{cmd}\r").as_bytes()).await {
                    error!("serial modem write error: {err}");
                    return;
                }
                let _ = write_half.flush().await;
            }
            _ = ticker.tick() => {}
        }
        if signals.kill_threads.is_set() {
            return;
        }
    }
}
