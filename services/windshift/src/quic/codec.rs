// QUIC frame/message encoding and decoding helpers with size limits.
use anyhow::{anyhow, Context, Result};
use bytes::BytesMut;
use quinn::{ReadExactError, RecvStream, SendStream};
use windshift_wire::{Frame, FrameHeader, Message};

// Read one message, or None when the peer half-closed the stream.
pub async fn read_message_limited(
    recv: &mut RecvStream,
    max_frame_bytes: usize,
    frame_scratch: &mut BytesMut,
) -> Result<Option<Message>> {
    let frame = match read_frame_limited_into(recv, max_frame_bytes, frame_scratch).await? {
        Some(frame) => frame,
        None => return Ok(None),
    };
    Message::decode(frame).map(Some).context("decode message")
}

// Helper to encode + write a single message.
pub async fn write_message(send: &mut SendStream, message: &Message) -> Result<()> {
    let frame = message.encode().context("encode message")?;
    write_frame(send, &frame).await
}

// Low-level frame reader with a max payload cap.
async fn read_frame_limited_into(
    recv: &mut RecvStream,
    max_payload_bytes: usize,
    scratch: &mut BytesMut,
) -> Result<Option<Frame>> {
    let mut header_bytes = [0u8; FrameHeader::LEN];
    match recv.read_exact(&mut header_bytes).await {
        Ok(()) => {}
        Err(ReadExactError::FinishedEarly(_)) => return Ok(None),
        Err(ReadExactError::ReadError(err)) => return Err(err.into()),
    }

    let header = FrameHeader::decode(&header_bytes).context("decode frame header")?;
    let length = usize::try_from(header.length).context("frame length")?;
    if length > max_payload_bytes {
        return Err(anyhow!(
            "frame length {length} exceeds max_payload_bytes {max_payload_bytes}"
        ));
    }
    scratch.clear();
    scratch.resize(length, 0u8);
    recv.read_exact(&mut scratch[..])
        .await
        .context("read frame payload")?;
    Ok(Some(Frame {
        header,
        payload: scratch.split().freeze(),
    }))
}

// Low-level frame writer for QUIC streams.
async fn write_frame(send: &mut SendStream, frame: &Frame) -> Result<()> {
    let mut header_bytes = [0u8; FrameHeader::LEN];
    frame.header.encode_into(&mut header_bytes);
    send.write_all(&header_bytes)
        .await
        .context("write frame header")?;
    send.write_all(&frame.payload)
        .await
        .context("write frame payload")?;
    Ok(())
}
