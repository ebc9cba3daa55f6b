use anyhow::{Context, Result};
use launcher::daemon::{DaemonClient, Launcher, ServiceInfo};
use std::io::Write;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

const MIB: i64 = 1024 * 1024;

fn client(socket: Option<PathBuf>) -> DaemonClient {
    match socket {
        Some(path) => DaemonClient::with_socket(path),
        None => DaemonClient::new(),
    }
}

/// Token cancelled on Ctrl+C, so a stuck request can be abandoned.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let handle = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.cancel();
        }
    });
    token
}

pub(crate) async fn cmd_list_services(socket: Option<PathBuf>, running: bool, json: bool) -> Result<()> {
    let client = client(socket);
    let services = client.list(running, &interrupt_token()).await?;

    let mut out = std::io::stdout().lock();
    if json {
        serde_json::to_writer_pretty(&mut out, &services)
            .context("Failed to serialize service list")?;
        writeln!(out)?;
    } else {
        print_services(&mut out, &services)?;
    }
    Ok(())
}

pub(crate) async fn cmd_start_service(socket: Option<PathBuf>, name: &str) -> Result<()> {
    let client = client(socket);
    let cancel = interrupt_token();

    if name == "all" {
        client.start_all(&cancel).await?;
        println!("All services started");
    } else {
        let info = client.start_service(name, &cancel).await?;
        println!("Service '{}' started", info.name);
    }

    let services = client.list(false, &cancel).await?;
    print_services(&mut std::io::stdout().lock(), &services)?;
    Ok(())
}

pub(crate) async fn cmd_stop_service(socket: Option<PathBuf>, name: &str) -> Result<()> {
    let client = client(socket);
    let cancel = interrupt_token();

    if name == "all" {
        client.stop_all(&cancel).await?;
        println!("All services stopped");
    } else {
        let info = client.stop_service(name, &cancel).await?;
        println!("Service '{}' stopped", info.name);
    }

    let services = client.list(false, &cancel).await?;
    print_services(&mut std::io::stdout().lock(), &services)?;
    Ok(())
}

fn print_services(out: &mut impl Write, services: &[ServiceInfo]) -> std::io::Result<()> {
    writeln!(
        out,
        "Service                      Size   Starts       PID    CPU   Memory   Status    Last Error"
    )?;
    writeln!(
        out,
        "-------                      ----   ------   -------   ----   ------   -------   -----------"
    )?;
    for service in services {
        writeln!(out, "{}", format_row(service))?;
    }
    Ok(())
}

fn format_row(service: &ServiceInfo) -> String {
    format!(
        "{:<25} {:>4} MB   {:>6}   {:>7}   {:>4}   {:>6}   {:>7}   {}",
        service.name,
        service.size / MIB,
        service.start_count,
        service.pid,
        format!("{}%", service.cpu),
        format!("{} MB", service.rss / MIB),
        service.state_str(),
        service.status,
    )
}
