//! Request/reply exchange over a live connection. One command is on the
//! wire at a time.

use crate::inverter::frame::{self, Command, EnvelopeCodec};
use crate::prelude::*;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

pub type Connection = Framed<TcpStream, EnvelopeCodec>;

pub const FIRST_TRANSACTION_ID: u16 = 0x0772;

/// Transaction id allocator. Survives reconnects.
#[derive(Debug)]
pub struct TransactionIds {
    next: u16,
}

impl Default for TransactionIds {
    fn default() -> Self {
        Self {
            next: FIRST_TRANSACTION_ID,
        }
    }
}

impl TransactionIds {
    /// Hand out the next id and advance, wrapping past 0xFFFF.
    pub fn next(&mut self) -> u16 {
        let tid = self.next;
        self.next = self.next.wrapping_add(1);
        tid
    }

    /// The id the next command will carry.
    pub fn peek(&self) -> u16 {
        self.next
    }
}

/// Per-command timeout and the pause between commands of a batch.
#[derive(Clone, Copy, Debug)]
pub struct Timing {
    pub command_timeout: Duration,
    pub pacing: Duration,
}

/// Send one command and wait for the reply carrying its transaction id.
pub async fn exchange(
    conn: &mut Connection,
    transaction_id: u16,
    command: &Command,
    command_timeout: Duration,
) -> Result<Bytes, Error> {
    let request = frame::encode(transaction_id, command);
    debug!("TX {:#06x} [{}] {}", transaction_id, command, Utils::hex(&request));

    tokio::time::timeout(command_timeout, conn.send(request))
        .await
        .map_err(|_| Error::Timeout(command_timeout))??;

    let reply = match tokio::time::timeout(command_timeout, conn.next()).await {
        Err(_) => return Err(Error::Timeout(command_timeout)),
        Ok(None) => {
            return Err(Error::Connection(
                "inverter closed the connection".to_string(),
            ))
        }
        Ok(Some(reply)) => reply?.freeze(),
    };
    debug!("RX {:#06x} {}", transaction_id, Utils::hex(&reply));

    let got = Utils::u16ify(&reply, 0);
    if got != transaction_id {
        return Err(Error::Frame(format!(
            "transaction id mismatch: sent {:#06x}, got {:#06x}",
            transaction_id, got
        )));
    }

    Ok(reply)
}

/// Run `commands` strictly one after another. Either every reply comes back
/// or the whole batch fails; partial results are discarded.
pub async fn run_batch(
    conn: &mut Connection,
    ids: &mut TransactionIds,
    commands: &[Command],
    timing: Timing,
) -> Result<Vec<Bytes>, Error> {
    let mut replies = Vec::with_capacity(commands.len());

    for (i, command) in commands.iter().enumerate() {
        if i > 0 && !timing.pacing.is_zero() {
            tokio::time::sleep(timing.pacing).await;
        }
        let tid = ids.next();
        let reply = exchange(conn, tid, command, timing.command_timeout).await?;
        replies.push(reply);
    }

    Ok(replies)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inverter::frame::{RegisterRead, FUNCTION_MARKER, PROTOCOL_ID, UNIT_MARKER};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn reply(tid: u16, body: &[u8]) -> Vec<u8> {
        let mut r = tid.to_be_bytes().to_vec();
        r.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
        r.extend_from_slice(&((body.len() + 2) as u16).to_be_bytes());
        r.extend_from_slice(&[UNIT_MARKER, FUNCTION_MARKER]);
        r.extend_from_slice(body);
        r
    }

    async fn pair() -> Result<(Connection, TcpStream)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let peer = TcpStream::connect(listener.local_addr()?).await?;
        let (ours, _) = listener.accept().await?;
        Ok((Framed::new(ours, EnvelopeCodec), peer))
    }

    async fn read_request(peer: &mut TcpStream) -> Result<u16> {
        let mut header = [0u8; 6];
        peer.read_exact(&mut header).await?;
        let len = Utils::u16ify(&header, 4) as usize;
        let mut rest = vec![0u8; len];
        peer.read_exact(&mut rest).await?;
        Ok(Utils::u16ify(&header, 0))
    }

    fn timing() -> Timing {
        Timing {
            command_timeout: Duration::from_millis(200),
            pacing: Duration::ZERO,
        }
    }

    fn reads(n: u16) -> Vec<Command> {
        (0..n)
            .map(|i| Command::Read(RegisterRead::holding(1, 100 + i, 1)))
            .collect()
    }

    #[test]
    fn transaction_ids_start_at_0772_and_wrap() {
        let mut ids = TransactionIds::default();
        assert_eq!(ids.next(), 0x0772);
        assert_eq!(ids.next(), 0x0773);

        let mut ids = TransactionIds { next: 0xffff };
        assert_eq!(ids.next(), 0xffff);
        assert_eq!(ids.next(), 0x0000);
    }

    #[tokio::test]
    async fn batch_returns_replies_in_order() -> Result<()> {
        let (mut conn, mut peer) = pair().await?;

        let responder = tokio::spawn(async move {
            for i in 0..3u8 {
                let tid = read_request(&mut peer).await?;
                peer.write_all(&reply(tid, &[0x02, 0x00, i])).await?;
            }
            Ok::<_, anyhow::Error>(peer)
        });

        let mut ids = TransactionIds::default();
        let replies = run_batch(&mut conn, &mut ids, &reads(3), timing()).await?;
        assert_eq!(replies.len(), 3);
        for (i, r) in replies.iter().enumerate() {
            assert_eq!(Utils::u16ify(r, 0), FIRST_TRANSACTION_ID + i as u16);
            assert_eq!(r[r.len() - 1], i as u8);
        }
        assert_eq!(ids.peek(), FIRST_TRANSACTION_ID + 3);

        responder.await??;
        Ok(())
    }

    #[tokio::test]
    async fn stalled_reply_fails_whole_batch() -> Result<()> {
        let (mut conn, mut peer) = pair().await?;

        let responder = tokio::spawn(async move {
            for _ in 0..2 {
                let tid = read_request(&mut peer).await?;
                peer.write_all(&reply(tid, &[0x02, 0x00, 0x01])).await?;
            }
            // swallow the third request
            read_request(&mut peer).await?;
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, anyhow::Error>(())
        });

        let mut ids = TransactionIds::default();
        let result = run_batch(&mut conn, &mut ids, &reads(5), timing()).await;
        assert!(matches!(result, Err(Error::Timeout(_))));

        responder.await??;
        Ok(())
    }

    #[tokio::test]
    async fn mismatched_transaction_id_is_a_frame_error() -> Result<()> {
        let (mut conn, mut peer) = pair().await?;

        tokio::spawn(async move {
            let tid = read_request(&mut peer).await?;
            peer.write_all(&reply(tid.wrapping_add(7), &[0x02, 0x00, 0x01]))
                .await?;
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok::<_, anyhow::Error>(())
        });

        let mut ids = TransactionIds::default();
        let result = run_batch(&mut conn, &mut ids, &reads(1), timing()).await;
        assert!(matches!(result, Err(Error::Frame(_))));
        Ok(())
    }

    #[tokio::test]
    async fn peer_close_is_a_connection_error() -> Result<()> {
        let (mut conn, mut peer) = pair().await?;

        tokio::spawn(async move {
            read_request(&mut peer).await?;
            drop(peer);
            Ok::<_, anyhow::Error>(())
        });

        let mut ids = TransactionIds::default();
        let result = run_batch(&mut conn, &mut ids, &reads(1), timing()).await;
        assert!(matches!(result, Err(Error::Connection(_))));
        Ok(())
    }
}
