use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::protocol::{FileDescriptor, Request};

async fn connect(addr: &str) -> Result<TcpStream> {
    TcpStream::connect(addr).await.map_err(|source| Error::Connect {
        addr: addr.to_string(),
        source,
    })
}

/// Asks `addr` for its catalog on a dedicated connection.
///
/// The write half is shut down after the request so the peer closes the
/// connection once the listing is sent; the listing has no terminator.
#[tracing::instrument(level = "debug")]
pub async fn query_catalog(addr: &str) -> Result<Vec<FileDescriptor>> {
    let mut stream = connect(addr).await?;
    stream.write_all(Request::List.to_string().as_bytes()).await?;
    stream.shutdown().await?;

    let mut body = Vec::new();
    stream.read_to_end(&mut body).await?;

    let mut files = Vec::new();
    for line in String::from_utf8_lossy(&body).lines() {
        match FileDescriptor::parse_line(line) {
            Some(file) => files.push(file),
            None => tracing::warn!(peer = addr, line, "skipping malformed catalog line"),
        }
    }
    Ok(files)
}

/// Fetches `length` bytes of `file_id` starting at `start_offset` on a fresh
/// connection.
pub async fn fetch_range(
    addr: &str,
    file_id: u64,
    start_offset: u64,
    length: u64,
) -> Result<Vec<u8>> {
    let mut conn = PeerConnection::new(addr);
    conn.fetch(file_id, start_offset, length).await
}

/// A connection to one peer reused across sequential `FETCH` requests.
///
/// It is opened on first use and dropped after any failure, so the next
/// request reconnects instead of reading the leftovers of a broken exchange.
pub struct PeerConnection {
    addr: String,
    stream: Option<TcpStream>,
}

impl PeerConnection {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            stream: None,
        }
    }

    pub async fn fetch(&mut self, file_id: u64, start_offset: u64, length: u64) -> Result<Vec<u8>> {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => connect(&self.addr).await?,
        };

        let data = self.exchange(&mut stream, file_id, start_offset, length).await?;
        self.stream = Some(stream);
        Ok(data)
    }

    async fn exchange(
        &self,
        stream: &mut TcpStream,
        file_id: u64,
        start_offset: u64,
        length: u64,
    ) -> Result<Vec<u8>> {
        let request = Request::Fetch {
            file_id,
            start_offset,
            length,
        };
        stream.write_all(request.to_string().as_bytes()).await?;

        let mut buf = vec![0u8; length as usize];
        let mut received = 0;
        while received < buf.len() {
            let n = stream.read(&mut buf[received..]).await?;
            if n == 0 {
                return Err(Error::ShortRead {
                    addr: self.addr.clone(),
                    expected: length,
                    received: received as u64,
                });
            }
            received += n;
        }
        Ok(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    /// Accepts one connection, reads one request line and answers `reply`.
    async fn one_shot_peer(reply: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut reader = BufReader::new(stream);
            let mut line = String::new();
            reader.read_line(&mut line).await.unwrap();
            reader.get_mut().write_all(reply).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn test_query_catalog_parses_listing() {
        let addr = one_shot_peer(b"[7] movie.mkv - 1048576 bytes\n").await;

        let files = query_catalog(&addr).await.unwrap();
        assert_eq!(files, vec![FileDescriptor::new(7, "movie.mkv", 1048576)]);
    }

    #[tokio::test]
    async fn test_query_catalog_empty_and_malformed() {
        let addr = one_shot_peer(b"").await;
        assert!(query_catalog(&addr).await.unwrap().is_empty());

        let addr = one_shot_peer(b"garbage\n[1] a - 2 bytes\n").await;
        assert_eq!(
            query_catalog(&addr).await.unwrap(),
            vec![FileDescriptor::new(1, "a", 2)]
        );
    }

    #[tokio::test]
    async fn test_fetch_short_read() {
        let addr = one_shot_peer(b"abc").await;

        match fetch_range(&addr, 1, 0, 8).await {
            Err(Error::ShortRead {
                expected, received, ..
            }) => {
                assert_eq!(expected, 8);
                assert_eq!(received, 3);
            }
            other => panic!("expected short read, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_connection_refused() {
        // Bind and drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(matches!(
            fetch_range(&addr, 1, 0, 8).await,
            Err(Error::Connect { .. })
        ));
    }

    #[tokio::test]
    async fn test_connection_dropped_after_failure() {
        let addr = one_shot_peer(b"").await;
        let mut conn = PeerConnection::new(addr);

        assert!(conn.fetch(1, 0, 4).await.is_err());
        assert!(conn.stream.is_none());
    }
}
