//! Caller-supplied producers of entry content

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Output sink handed to a [`WriterCallback`].
pub type BlobSink = dyn AsyncWrite + Send + Unpin;

/// Writes the bytes of one entry into a not-yet-visible location.
///
/// Returning an error aborts the insert: the partial output is deleted and
/// the cache is left as if the insert never happened.
#[async_trait]
pub trait WriterCallback: Send + Sync {
    async fn write(&self, sink: &mut BlobSink) -> std::io::Result<()>;
}

#[async_trait]
impl WriterCallback for [u8] {
    async fn write(&self, sink: &mut BlobSink) -> std::io::Result<()> {
        sink.write_all(self).await
    }
}

#[async_trait]
impl WriterCallback for Vec<u8> {
    async fn write(&self, sink: &mut BlobSink) -> std::io::Result<()> {
        sink.write_all(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_byte_writers() {
        let mut out: Vec<u8> = Vec::new();
        let greeting: &[u8] = b"hello";
        let tail: Vec<u8> = vec![b' ', b'!'];

        WriterCallback::write(greeting, &mut out).await.unwrap();
        WriterCallback::write(&tail, &mut out).await.unwrap();
        assert_eq!(out, b"hello !");
    }
}
