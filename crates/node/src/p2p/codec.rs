use libp2p::request_response::Codec as RequestResponseCodec;
use libp2p::StreamProtocol;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io;
use std::marker::PhantomData;

/// Largest frame accepted from a stream; a replica piece is one whole segment.
pub const MAX_FRAME_SIZE: u64 = 64 * 1024 * 1024;

/// One bincode frame per stream direction, terminated by closing the stream.
pub struct FrameCodec<Req, Resp> {
    _frames: PhantomData<fn() -> (Req, Resp)>,
}

impl<Req, Resp> Clone for FrameCodec<Req, Resp> {
    fn clone(&self) -> Self {
        Self::default()
    }
}

impl<Req, Resp> Default for FrameCodec<Req, Resp> {
    fn default() -> Self {
        Self {
            _frames: PhantomData,
        }
    }
}

async fn read_frame<T, M>(io: &mut T) -> io::Result<M>
where
    T: futures::AsyncRead + Unpin + Send,
    M: DeserializeOwned,
{
    let mut buf = Vec::new();
    futures::AsyncReadExt::read_to_end(
        &mut futures::AsyncReadExt::take(&mut *io, MAX_FRAME_SIZE + 1),
        &mut buf,
    )
    .await?;
    if buf.len() as u64 > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame larger than {MAX_FRAME_SIZE} bytes"),
        ));
    }
    bincode::deserialize(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn write_frame<T, M>(io: &mut T, frame: &M) -> io::Result<()>
where
    T: futures::AsyncWrite + Unpin + Send,
    M: Serialize,
{
    let data = bincode::serialize(frame).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    futures::AsyncWriteExt::write_all(io, &data).await?;
    futures::AsyncWriteExt::close(io).await?;
    Ok(())
}

#[async_trait::async_trait]
impl<Req, Resp> RequestResponseCodec for FrameCodec<Req, Resp>
where
    Req: Serialize + DeserializeOwned + Send + Sync + 'static,
    Resp: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    type Protocol = StreamProtocol;
    type Request = Req;
    type Response = Resp;

    async fn read_request<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: futures::AsyncRead + Unpin + Send,
    {
        read_frame(io).await
    }

    async fn read_response<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<Self::Response>
    where
        T: futures::AsyncRead + Unpin + Send,
    {
        read_frame(io).await
    }

    async fn write_request<T>(&mut self, _: &StreamProtocol, io: &mut T, request: Req) -> io::Result<()>
    where
        T: futures::AsyncWrite + Unpin + Send,
    {
        write_frame(io, &request).await
    }

    async fn write_response<T>(&mut self, _: &StreamProtocol, io: &mut T, response: Resp) -> io::Result<()>
    where
        T: futures::AsyncWrite + Unpin + Send,
    {
        write_frame(io, &response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;
    use strata_protocol::{Ack, Ping};

    #[tokio::test]
    async fn frame_survives_the_wire() {
        let mut codec = FrameCodec::<Ping, Ack>::default();
        let protocol = StreamProtocol::new(strata_protocol::PING_PROTOCOL);
        let ping = Ping {
            sp_operator_address: "0xabc".into(),
            signature: vec![7; 65],
        };
        let mut wire = Cursor::new(Vec::new());
        codec
            .write_request(&protocol, &mut wire, ping.clone())
            .await
            .expect("write");
        let mut read = Cursor::new(wire.into_inner());
        assert_eq!(codec.read_request(&protocol, &mut read).await.expect("read"), ping);
    }

    #[tokio::test]
    async fn garbage_is_invalid_data() {
        let mut codec = FrameCodec::<Ping, Ack>::default();
        let protocol = StreamProtocol::new(strata_protocol::PING_PROTOCOL);
        let mut read = Cursor::new(vec![0xff; 3]);
        let err = codec.read_request(&protocol, &mut read).await.expect_err("invalid");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
