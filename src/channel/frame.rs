// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::PoolError;

/// Fixed width of the ASCII-hex length prefix.
pub const HEADER_LEN: usize = 8;

/// A framed channel over a reader/writer pair. No magic, no version, no
/// checksum: the channel is trusted, same-host, parent-child.
pub struct Channel<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> Channel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }

    /// Reads exactly one frame, blocking until it is fully available.
    pub async fn read_blocking(&mut self) -> Result<Vec<u8>, PoolError> {
        let mut header = [0u8; HEADER_LEN];
        read_exact_or_closed(&mut self.reader, &mut header).await?;
        let len = decode_header(&header)?;

        let mut payload = vec![0u8; len];
        read_exact_or_closed(&mut self.reader, &mut payload).await?;
        Ok(payload)
    }

    /// Reads one frame if it becomes available within `wait`, otherwise
    /// returns `None`. A zero `wait` still yields once to the runtime, so a
    /// frame already buffered is still observed.
    ///
    /// Only the readiness of the frame's first byte is raced against the
    /// timeout. `read_exact` on a one-byte buffer either consumes that byte
    /// or, if it is still pending when the timer wins, consumes nothing —
    /// so dropping the losing branch never discards already-read header
    /// bytes. Once the first byte is in hand, the rest of the frame (the
    /// remaining header, then the payload) is read to completion with no
    /// cancellable timer in the loop, so a frame cannot be torn in half by
    /// this call (§4.1: "otherwise behaves as blocking for the remainder of
    /// the frame").
    pub async fn read_nonblocking(
        &mut self,
        wait: Duration,
    ) -> Result<Option<Vec<u8>>, PoolError> {
        let mut header = [0u8; HEADER_LEN];
        let first_byte = tokio::select! {
            biased;
            res = self.reader.read_exact(&mut header[..1]) => res,
            () = tokio::time::sleep(wait) => return Ok(None),
        };
        match first_byte {
            Ok(_) => {},
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(PoolError::ChannelClosed);
            },
            Err(e) => return Err(PoolError::Io(e)),
        }

        read_exact_or_closed(&mut self.reader, &mut header[1..]).await?;
        let len = decode_header(&header)?;

        let mut payload = vec![0u8; len];
        read_exact_or_closed(&mut self.reader, &mut payload).await?;
        Ok(Some(payload))
    }

    /// Writes one frame, looping until the header and payload are fully
    /// flushed.
    pub async fn write(&mut self, payload: &[u8]) -> Result<(), PoolError> {
        let header = encode_header(payload.len())?;
        self.writer
            .write_all(&header)
            .await
            .map_err(|e| PoolError::ChannelBroken(e.to_string()))?;
        self.writer
            .write_all(payload)
            .await
            .map_err(|e| PoolError::ChannelBroken(e.to_string()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| PoolError::ChannelBroken(e.to_string()))?;
        Ok(())
    }
}

async fn read_exact_or_closed<R: AsyncRead + Unpin>(
    reader: &mut R,
    buf: &mut [u8],
) -> Result<(), PoolError> {
    match reader.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(PoolError::ChannelClosed),
        Err(e) => Err(PoolError::Io(e)),
    }
}

fn encode_header(len: usize) -> Result<[u8; HEADER_LEN], PoolError> {
    let len_u32 = u32::try_from(len)
        .map_err(|_| PoolError::ChannelProtocol(format!("payload too large: {len} bytes")))?;
    let mut buf = [0u8; HEADER_LEN];
    buf.copy_from_slice(format!("{len_u32:08x}").as_bytes());
    Ok(buf)
}

fn decode_header(header: &[u8; HEADER_LEN]) -> Result<usize, PoolError> {
    let s = std::str::from_utf8(header)
        .map_err(|_| PoolError::ChannelProtocol("non-hex frame header".to_string()))?;
    u32::from_str_radix(s, 16)
        .map(|n| n as usize)
        .map_err(|_| PoolError::ChannelProtocol(format!("non-hex frame header: {s:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_of_write_round_trips() {
        let (client, server) = tokio::io::duplex(4096);
        let (client_r, client_w) = tokio::io::split(client);
        let (server_r, server_w) = tokio::io::split(server);
        let mut a = Channel::new(client_r, client_w);
        let mut b = Channel::new(server_r, server_w);

        let payload = b"hello worker pool".to_vec();
        a.write(&payload).await.unwrap();
        let got = b.read_blocking().await.unwrap();
        assert_eq!(got, payload);
    }

    #[tokio::test]
    async fn read_of_write_round_trips_empty_payload() {
        let (client, server) = tokio::io::duplex(64);
        let (client_r, client_w) = tokio::io::split(client);
        let (server_r, server_w) = tokio::io::split(server);
        let mut a = Channel::new(client_r, client_w);
        let mut b = Channel::new(server_r, server_w);

        a.write(&[]).await.unwrap();
        let got = b.read_blocking().await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn read_nonblocking_returns_none_when_no_frame_pending() {
        let (client, server) = tokio::io::duplex(64);
        let (_client_r, _client_w) = tokio::io::split(client);
        let (server_r, server_w) = tokio::io::split(server);
        let mut b = Channel::new(server_r, server_w);

        let got = b.read_nonblocking(Duration::from_millis(10)).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn read_blocking_fails_with_closed_on_eof_before_header() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let (server_r, server_w) = tokio::io::split(server);
        let mut b = Channel::new(server_r, server_w);

        let err = b.read_blocking().await.unwrap_err();
        assert!(matches!(err, PoolError::ChannelClosed));
    }

    #[tokio::test]
    async fn read_blocking_fails_with_protocol_error_on_non_hex_header() {
        let (client, server) = tokio::io::duplex(64);
        let (client_r, mut client_w) = tokio::io::split(client);
        let (server_r, server_w) = tokio::io::split(server);
        let mut b = Channel::new(server_r, server_w);

        client_w.write_all(b"NOTAHEX!").await.unwrap();
        let err = b.read_blocking().await.unwrap_err();
        assert!(matches!(err, PoolError::ChannelProtocol(_)));
        drop(client_r);
    }

    /// Once the header has started arriving, a `read_nonblocking` call must
    /// not time out and discard it even if the payload is still in flight —
    /// it has to block for the rest of the frame, exactly like
    /// `read_blocking` would, per §4.1.
    #[tokio::test]
    async fn read_nonblocking_does_not_lose_a_header_while_the_payload_is_still_in_flight() {
        let (client, server) = tokio::io::duplex(64);
        let (client_r, mut client_w) = tokio::io::split(client);
        let (server_r, server_w) = tokio::io::split(server);
        let mut b = Channel::new(server_r, server_w);

        client_w.write_all(b"00000005").await.unwrap();

        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            client_w.write_all(b"hello").await.unwrap();
            client_w
        });

        let got = b.read_nonblocking(Duration::from_millis(500)).await.unwrap();
        assert_eq!(got, Some(b"hello".to_vec()));

        drop(writer.await.unwrap());
        drop(client_r);
    }
}
