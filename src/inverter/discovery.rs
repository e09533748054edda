//! The dongle never accepts connections. We listen, tell it where over UDP,
//! and wait for it to dial back.

use crate::prelude::*;

use net2::TcpStreamExt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};

const TCP_KEEPALIVE_SECS: u64 = 60;

pub fn announcement(local_ip: &str, local_port: u16) -> String {
    format!("set>server={}:{};", local_ip, local_port)
}

/// Bind the passive listener. Returns it with the port actually bound, which
/// differs from the configured one when that is 0.
pub async fn listen(local_ip: &str, local_port: u16) -> Result<(TcpListener, u16), Error> {
    let listener = TcpListener::bind((local_ip, local_port))
        .await
        .map_err(|e| {
            Error::Connection(format!(
                "cannot listen on {}:{}: {}",
                local_ip, local_port, e
            ))
        })?;
    let port = listener.local_addr()?.port();

    Ok((listener, port))
}

pub async fn announce(
    inverter_host: &str,
    discovery_port: u16,
    local_ip: &str,
    local_port: u16,
) -> Result<(), Error> {
    let message = announcement(local_ip, local_port);

    let socket = UdpSocket::bind(("0.0.0.0", 0)).await?;
    socket
        .send_to(message.as_bytes(), (inverter_host, discovery_port))
        .await
        .map_err(|e| {
            Error::Connection(format!(
                "discovery datagram to {}:{} failed: {}",
                inverter_host, discovery_port, e
            ))
        })?;
    debug!("sent {:?} to {}:{}", message, inverter_host, discovery_port);

    Ok(())
}

/// Wait for the inverter's reverse connection.
pub async fn accept(
    listener: &TcpListener,
    connect_timeout: Duration,
) -> Result<(TcpStream, SocketAddr), Error> {
    match tokio::time::timeout(connect_timeout, listener.accept()).await {
        Ok(Ok(accepted)) => Ok(accepted),
        Ok(Err(e)) => Err(Error::Connection(format!("accept failed: {}", e))),
        Err(_) => Err(Error::Connection(format!(
            "inverter did not connect back within {:?}",
            connect_timeout
        ))),
    }
}

/// Keepalive and nodelay are best effort; failures are only logged.
pub fn tune(stream: TcpStream, nodelay: bool) -> Result<TcpStream, Error> {
    let std_stream = stream.into_std()?;
    if let Err(e) = std_stream.set_keepalive(Some(Duration::new(TCP_KEEPALIVE_SECS, 0))) {
        warn!("Failed to set TCP keepalive: {}", e);
    }

    let stream = TcpStream::from_std(std_stream)?;
    if nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
    }

    Ok(stream)
}

/// Accept and immediately drop anything else that dials in while a session
/// is live. Runs until aborted, which also closes the listener.
pub async fn reject_extra(listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                warn!("closing extra connection from {}", peer);
                drop(stream);
            }
            Err(e) => {
                warn!("listener failed, no longer rejecting: {}", e);
                break;
            }
        }
    }
}
