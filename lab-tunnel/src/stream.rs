use std::io;

use bytes::{Bytes, BytesMut};
use futures_util::{Sink, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{BytesCodec, FramedRead, FramedWrite};

/// Adapt a raw byte stream into the message-oriented client interface of
/// [`TunnelService::open_session`](crate::TunnelService::open_session).
pub fn framed_client<S>(
    stream: S,
) -> (
    impl Stream<Item = io::Result<Bytes>> + Send + Unpin,
    impl Sink<Bytes, Error = io::Error> + Send + Unpin,
)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let reader = FramedRead::new(read_half, BytesCodec::new())
        .map(|chunk: io::Result<BytesMut>| chunk.map(BytesMut::freeze));
    let writer = FramedWrite::new(write_half, BytesCodec::new());
    (reader, writer)
}
