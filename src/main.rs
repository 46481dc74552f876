#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # s2c-middleware
//!
//! Middleware between line-oriented TCP clients and an S2C-family acoustic
//! underwater modem. Exposes a command TCP server and a push-only interrupt
//! TCP server; talks AT commands to the modem over TCP or RS-232, and runs
//! an independent file-transfer channel alongside it.
//!
//! ## Usage
//!
//! `s2c-middleware <config.ini>`

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info, warn};

use s2c_middleware::command_server;
use s2c_middleware::config::Config;
use s2c_middleware::dispatcher::Dispatcher;
use s2c_middleware::file_handler::FileHandler;
use s2c_middleware::file_link;
use s2c_middleware::interrupt_dispatcher::InterruptDispatcher;
use s2c_middleware::interrupt_server;
use s2c_middleware::message_handler::MessageHandler;
use s2c_middleware::modem_link::ModemLink;
use s2c_middleware::queues::{self, Signals};
use s2c_middleware::types::ClientCommand;

/// Middleware between line-oriented TCP clients and an S2C-family acoustic
/// underwater modem.
#[derive(Parser)]
#[command(name = "s2c-middleware", version)]
struct Cli {
    /// Path to the INI configuration file.
    ini_file_path: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load(&cli.ini_file_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load config from {}: {err:#}", cli.ini_file_path);
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.log_level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    let (command_addr, interrupt_addr, modem_cmd_addr) = match config.resolve_addresses().await {
        Ok(addrs) => addrs,
        Err(err) => {
            error!("failed to resolve configured addresses: {err:#}");
            std::process::exit(1);
        }
    };
    let modem_file_addr = match config.resolve_modem_file_address().await {
        Ok(addr) => addr,
        Err(err) => {
            error!("failed to resolve modem data-channel address: {err:#}");
            std::process::exit(1);
        }
    };

    info!("s2c-middleware v{} starting", env!("CARGO_PKG_VERSION"));

    let signals = Signals::new(config.middleware.file_transfer);

    // ---- command-channel queues ----
    let (tcp_server_rx_tx, tcp_server_rx_rx) = queues::bounded::<ClientCommand>();
    let (tcp_server_tx_tx, tcp_server_tx_rx) = queues::bounded();
    let (at_command_tx_tx, at_command_tx_rx) = queues::bounded::<String>();
    let (at_command_rx_tx, at_command_rx_rx) = queues::bounded();
    let (modem_tx_tx, modem_tx_rx) = queues::bounded::<String>();
    let (modem_rx_tx, modem_rx_rx) = queues::bounded();
    let (modem_interrupt_tx, modem_interrupt_rx) = queues::bounded();
    let (client_interrupt_tx, client_interrupt_rx) = queues::bounded::<String>();

    // ---- file-channel queues (entirely independent of the above) ----
    let (file_modem_in_tx, file_modem_in_rx) = queues::bounded();
    let (file_modem_out_tx, file_modem_out_rx) = queues::bounded::<String>();
    let (file_command_tx, file_command_rx) = queues::bounded();
    let (file_command_reply_tx, file_command_reply_rx) = queues::bounded();

    let file_path = PathBuf::from(&config.middleware.file_path);

    let dispatcher = Dispatcher::new(
        tcp_server_rx_rx,
        tcp_server_tx_tx,
        at_command_tx_tx,
        at_command_rx_rx,
        file_command_tx,
        file_command_reply_rx,
        signals.clone(),
        config.modem.clone(),
        file_path.clone(),
    );

    let message_handler = MessageHandler::new(
        at_command_tx_rx,
        modem_tx_tx,
        modem_rx_rx,
        at_command_rx_tx,
        modem_interrupt_tx,
        tcp_server_rx_tx.clone(),
        file_modem_in_tx.clone(),
        signals.clone(),
    );

    let interrupt_dispatcher =
        InterruptDispatcher::new(modem_interrupt_rx, client_interrupt_tx.clone(), signals.clone());

    let file_handler = FileHandler::new(
        file_command_rx,
        file_command_reply_tx,
        file_modem_in_rx,
        file_modem_out_tx,
        client_interrupt_tx,
        signals.clone(),
        file_path,
        config.middleware.block_size,
        config.modem.modem_address.clone(),
    );

    let modem_link = ModemLink::from_config(&config.modem, modem_cmd_addr);

    // boot-time auto-LOADCONFIG, ahead of any real client traffic
    let _ = tcp_server_rx_tx
        .send(ClientCommand::parse("LOADCONFIG\n"))
        .await;

    let command_server_signals = signals.clone();
    let command_server_task = tokio::spawn(command_server::run(
        command_addr,
        tcp_server_rx_tx,
        tcp_server_tx_rx,
        command_server_signals,
    ));
    let interrupt_server_task = tokio::spawn(interrupt_server::run(
        interrupt_addr,
        client_interrupt_rx,
        signals.clone(),
    ));
    let modem_link_signals = signals.clone();
    let modem_link_task = tokio::spawn(modem_link.run(modem_tx_rx, modem_rx_tx, modem_link_signals));
    let file_link_task = tokio::spawn(file_link::run(
        modem_file_addr,
        file_modem_out_rx,
        file_modem_in_tx,
        signals.clone(),
    ));
    let message_handler_task = tokio::spawn(message_handler.run());
    let interrupt_dispatcher_task = tokio::spawn(interrupt_dispatcher.run());
    let file_handler_task = tokio::spawn(file_handler.run());
    let dispatcher_task = tokio::spawn(dispatcher.run());

    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT"),
                _ = sigterm.recv() => info!("received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("received SIGINT");
        }
    };

    let kill_watcher = {
        let signals = signals.clone();
        async move {
            signals.kill_request.wait().await;
        }
    };

    tokio::select! {
        () = shutdown => {}
        () = kill_watcher => { info!("KILL requested by a client"); }
        result = command_server_task => {
            error!("command server task exited: {result:?}");
            std::process::exit(1);
        }
        result = modem_link_task => {
            warn!("modem link task exited: {result:?}");
        }
    }

    info!("shutting down...");
    signals.kill_threads.set();

    let joined = tokio::time::timeout(
        std::time::Duration::from_secs(queues::T_QUIT_SECS),
        futures_join(vec![
            interrupt_server_task,
            file_link_task,
            message_handler_task,
            interrupt_dispatcher_task,
            file_handler_task,
            dispatcher_task,
        ]),
    )
    .await;

    if joined.is_err() {
        warn!("shutdown watchdog expired, forcing exit");
        std::process::exit(1);
    }

    info!("goodbye");
}

async fn futures_join(tasks: Vec<tokio::task::JoinHandle<()>>) {
    for task in tasks {
        let _ = task.await;
    }
}
