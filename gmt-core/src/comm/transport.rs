//! Point-to-point transport between nodes (spec.md §4.4).
//!
//! One TCP connection per peer, framed with a 4-byte little-endian length
//! prefix, built on `tokio`'s non-blocking sockets: a socket fully owned by
//! one async task that the rest of the node talks to over channels, no
//! gossip/discovery machinery since GMT's peer set is fixed at boot.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::{GmtError, Result};

/// Establishes one `TcpStream` per peer. Lower-ranked nodes listen; each
/// higher-ranked node dials out in ascending order, so every pair of nodes
/// agrees on which side connects without a handshake round.
pub async fn connect_mesh(self_node: u32, addresses: &[String]) -> Result<Vec<Option<TcpStream>>> {
    let num_nodes = addresses.len() as u32;
    let mut conns: Vec<Option<TcpStream>> = (0..num_nodes).map(|_| None).collect();

    let listener = TcpListener::bind(&addresses[self_node as usize])
        .await
        .map_err(|e| GmtError::Network(format!("bind {}: {e}", addresses[self_node as usize])))?;

    let expected_incoming = self_node; // peers with lower rank dial us
    let accept_task = tokio::spawn(async move {
        let mut accepted = Vec::new();
        for _ in 0..expected_incoming {
            match listener.accept().await {
                Ok((stream, _addr)) => accepted.push(stream),
                Err(_) => break,
            }
        }
        (listener, accepted)
    });

    for peer in (self_node + 1)..num_nodes {
        let addr = addresses[peer as usize].clone();
        let stream = retry_connect(&addr).await?;
        conns[peer as usize] = Some(stream);
    }

    let (_listener, accepted) = accept_task
        .await
        .map_err(|e| GmtError::Network(format!("accept task join error: {e}")))?;

    // Peers identify themselves with a one-shot 4-byte rank handshake right
    // after connecting, so we can place each accepted stream at the right
    // index regardless of accept order.
    for mut stream in accepted {
        let mut rank_buf = [0u8; 4];
        stream
            .read_exact(&mut rank_buf)
            .await
            .map_err(|e| GmtError::Network(format!("rank handshake read: {e}")))?;
        let rank = u32::from_le_bytes(rank_buf);
        conns[rank as usize] = Some(stream);
    }

    for peer in (self_node + 1)..num_nodes {
        if let Some(stream) = conns[peer as usize].as_mut() {
            stream
                .write_all(&self_node.to_le_bytes())
                .await
                .map_err(|e| GmtError::Network(format!("rank handshake write: {e}")))?;
        }
    }

    Ok(conns)
}

async fn retry_connect(addr: &str) -> Result<TcpStream> {
    let mut delay = std::time::Duration::from_millis(20);
    for _ in 0..50 {
        match TcpStream::connect(addr).await {
            Ok(s) => return Ok(s),
            Err(_) => {
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(std::time::Duration::from_millis(500));
            }
        }
    }
    TcpStream::connect(addr)
        .await
        .map_err(|e| GmtError::Network(format!("connect {addr}: {e}")))
}

/// Write one length-prefixed frame.
pub async fn send_frame(stream: &mut TcpStream, bytes: &[u8]) -> Result<()> {
    stream
        .write_all(&(bytes.len() as u32).to_le_bytes())
        .await
        .map_err(|e| GmtError::Network(e.to_string()))?;
    stream.write_all(bytes).await.map_err(|e| GmtError::Network(e.to_string()))
}

/// Read one length-prefixed frame; `Ok(None)` on clean peer shutdown.
pub async fn recv_frame(stream: &mut TcpStream) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(GmtError::Network(e.to_string())),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.map_err(|e| GmtError::Network(e.to_string()))?;
    Ok(Some(buf))
}
