use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::message::Envelope;

pub const MESSAGE_CHUNK_SIZE: usize = 8 * 1024;

/// Upper bound on a single frame. The peer is trusted, but a corrupted
/// length prefix must not turn into an arbitrary allocation.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Clean end of stream between frames. The connection is simply gone.
    #[error("end of stream")]
    Eof,
    #[error("stream closed mid-frame: {0}")]
    Truncated(io::Error),
    #[error("frame length {length} exceeds limit of {limit} bytes")]
    FrameTooLarge { length: usize, limit: usize },
    #[error("envelope violates protocol invariant: {0}")]
    Invalid(&'static str),
    #[error("envelope encoding failed: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("envelope decoding failed: {0}")]
    Decode(#[source] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl WireError {
    /// Every wire error except a per-frame decode failure tears the
    /// connection down; a decode failure means the stream framing itself
    /// can no longer be trusted, so it is fatal too.
    pub fn is_connection_fatal(&self) -> bool {
        !matches!(self, Self::Invalid(_))
    }
}

pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    envelope.validate().map_err(WireError::Invalid)?;
    let body = serde_json::to_vec(envelope).map_err(WireError::Encode)?;
    let length = u32::try_from(body.len()).map_err(|_| WireError::FrameTooLarge {
        length: body.len(),
        limit: u32::MAX as usize,
    })?;

    writer.write_all(&length.to_be_bytes()).await?;
    for chunk in body.chunks(MESSAGE_CHUNK_SIZE) {
        writer.write_all(chunk).await?;
    }
    writer.flush().await?;
    Ok(())
}

pub async fn read_envelope<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Envelope, WireError>
where
    R: AsyncRead + Unpin,
{
    let mut length_prefix = [0_u8; 4];

    // A clean close lands exactly on a frame boundary; anything else is a
    // truncated frame.
    let first = reader.read(&mut length_prefix[..1]).await?;
    if first == 0 {
        return Err(WireError::Eof);
    }
    reader
        .read_exact(&mut length_prefix[1..])
        .await
        .map_err(WireError::Truncated)?;

    let length = u32::from_be_bytes(length_prefix) as usize;
    if length > max_frame_bytes {
        return Err(WireError::FrameTooLarge {
            length,
            limit: max_frame_bytes,
        });
    }

    let mut body = vec![0_u8; length];
    reader
        .read_exact(&mut body)
        .await
        .map_err(WireError::Truncated)?;

    let envelope: Envelope = serde_json::from_slice(&body).map_err(WireError::Decode)?;
    envelope.validate().map_err(WireError::Invalid)?;
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Command, CommandRequest, CommandResponse};

    #[tokio::test]
    async fn frame_round_trips_over_duplex_stream() {
        let (mut client, mut server) = tokio::io::duplex(256);

        let envelope = Envelope::request(
            "CLIENT-1",
            CommandRequest::with_bytes(Command::ServerDownloadFile, vec![0, 159, 146, 150]),
        );
        let expected = envelope.clone();

        let writer = tokio::spawn(async move {
            write_envelope(&mut client, &envelope)
                .await
                .expect("write frame");
            client
        });

        let received = read_envelope(&mut server, DEFAULT_MAX_FRAME_BYTES)
            .await
            .expect("read frame");
        assert_eq!(received, expected);
        writer.await.expect("writer task");
    }

    #[tokio::test]
    async fn multiple_frames_are_read_in_order() {
        let (mut client, mut server) = tokio::io::duplex(4096);

        let first = Envelope::request("CLIENT-a", CommandRequest::new(Command::ServerGetEnv));
        let second = Envelope::response("CLIENT-a", CommandResponse::ok());
        write_envelope(&mut client, &first).await.expect("write 1");
        write_envelope(&mut client, &second).await.expect("write 2");

        let got_first = read_envelope(&mut server, DEFAULT_MAX_FRAME_BYTES)
            .await
            .expect("read 1");
        let got_second = read_envelope(&mut server, DEFAULT_MAX_FRAME_BYTES)
            .await
            .expect("read 2");
        assert_eq!(got_first, first);
        assert_eq!(got_second, second);
    }

    #[tokio::test]
    async fn payload_larger_than_chunk_size_round_trips() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        let payload: Vec<u8> = (0..3 * MESSAGE_CHUNK_SIZE).map(|i| (i % 251) as u8).collect();
        let envelope = Envelope::request(
            "CLIENT-big",
            CommandRequest::with_bytes(Command::ServerExecuteHttpRequest, payload),
        );
        let expected = envelope.clone();

        let writer = tokio::spawn(async move {
            write_envelope(&mut client, &envelope)
                .await
                .expect("write large frame");
        });
        let received = read_envelope(&mut server, DEFAULT_MAX_FRAME_BYTES)
            .await
            .expect("read large frame");
        writer.await.expect("writer task");
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn clean_close_reads_as_eof() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);

        let error = read_envelope(&mut server, DEFAULT_MAX_FRAME_BYTES)
            .await
            .expect_err("closed stream");
        assert!(matches!(error, WireError::Eof));
    }

    #[tokio::test]
    async fn close_mid_frame_reads_as_truncated() {
        let (mut client, mut server) = tokio::io::duplex(64);

        // Announce a 100-byte frame but deliver only 3 bytes.
        tokio::io::AsyncWriteExt::write_all(&mut client, &100_u32.to_be_bytes())
            .await
            .expect("write prefix");
        tokio::io::AsyncWriteExt::write_all(&mut client, b"abc")
            .await
            .expect("write partial body");
        drop(client);

        let error = read_envelope(&mut server, DEFAULT_MAX_FRAME_BYTES)
            .await
            .expect_err("truncated frame");
        assert!(matches!(error, WireError::Truncated(_)), "{error:?}");
    }

    #[tokio::test]
    async fn oversized_length_prefix_is_rejected_without_allocating() {
        let (mut client, mut server) = tokio::io::duplex(64);

        tokio::io::AsyncWriteExt::write_all(&mut client, &u32::MAX.to_be_bytes())
            .await
            .expect("write prefix");

        let error = read_envelope(&mut server, 1024)
            .await
            .expect_err("oversized frame");
        assert!(
            matches!(error, WireError::FrameTooLarge { limit: 1024, .. }),
            "{error:?}"
        );
    }

    #[tokio::test]
    async fn invalid_envelope_is_rejected_before_writing() {
        let (mut client, _server) = tokio::io::duplex(64);

        let mut envelope = Envelope::request("id", CommandRequest::new(Command::HeartBeat));
        envelope.request = None;

        let error = write_envelope(&mut client, &envelope)
            .await
            .expect_err("invalid envelope");
        assert!(matches!(error, WireError::Invalid(_)));
    }
}
