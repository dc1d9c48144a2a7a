use crate::error::Error;
use async_compression::tokio::bufread::{GzipDecoder, ZlibDecoder};
use bytes::Bytes;
use futures::Stream;
use hyper::{Body, Error as HyperError};
use std::{
    io,
    io::Error as IoError,
    pin::Pin,
    task::{Context, Poll},
};
use tokio::io::AsyncRead;
use tokio_util::io::{ReaderStream, StreamReader};

struct IoStream<T: Stream<Item = Result<Bytes, HyperError>> + Unpin>(T);

impl<T: Stream<Item = Result<Bytes, HyperError>> + Unpin> Stream for IoStream<T> {
    type Item = Result<Bytes, IoError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context) -> Poll<Option<Self::Item>> {
        match futures::ready!(Pin::new(&mut self.0).poll_next(cx)) {
            Some(Ok(chunk)) => Poll::Ready(Some(Ok(chunk))),
            Some(Err(err)) => Poll::Ready(Some(Err(IoError::new(io::ErrorKind::Other, err)))),
            None => Poll::Ready(None),
        }
    }
}

/// Reports whether [`decode_body`] understands the encoding.
pub fn is_supported(encoding: &str) -> bool {
    matches!(
        encoding.trim().to_ascii_lowercase().as_str(),
        "" | "identity" | "gzip" | "x-gzip" | "deflate"
    )
}

/// Wraps a response body in a decoder selected by the `Content-Encoding`
/// value. Supported encodings are `gzip`, `deflate` and `identity` (or the
/// empty string). Anything else fails with [`Error::UnsupportedEncoding`].
///
/// Dropping the returned body drops the codec state along with it.
pub fn decode_body(body: Body, encoding: &str) -> Result<Body, Error> {
    let reader = StreamReader::new(IoStream(body));

    let decoder: Box<dyn AsyncRead + Send + Unpin> =
        match encoding.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => return Ok(Body::wrap_stream(ReaderStream::new(reader))),
            "gzip" | "x-gzip" => Box::new(GzipDecoder::new(reader)),
            "deflate" => Box::new(ZlibDecoder::new(reader)),
            other => return Err(Error::UnsupportedEncoding(other.to_string())),
        };

    Ok(Body::wrap_stream(ReaderStream::new(decoder)))
}
