// Client side of the relay protocol

use crate::relay::config::DEFAULT_MAX_LINE_BYTES;
use crate::relay::message::{ClientRecord, Credentials, ServerRecord, AUTH_FAILED, AUTH_SUCCESS};
use crate::relay::wire::LineReader;
use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use uuid::Uuid;

/// A connection to a relay server, generic over the byte stream
pub struct RelayClient<S> {
    reader: LineReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    identity: Option<String>,
}

impl RelayClient<TcpStream> {
    /// Connect to a relay at `addr` (host:port)
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;
        Ok(Self::new(stream))
    }
}

impl<S: AsyncRead + AsyncWrite> RelayClient<S> {
    pub fn new(stream: S) -> Self {
        let (read_half, writer) = tokio::io::split(stream);
        Self {
            reader: LineReader::new(read_half, DEFAULT_MAX_LINE_BYTES),
            writer,
            identity: None,
        }
    }

    /// Identity we logged in as
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    /// Send the handshake. Returns whether the server accepted it.
    pub async fn login(&mut self, email: &str, password: &str) -> Result<bool> {
        let handshake = serde_json::to_string(&Credentials::new(email, password))?;
        self.send_line(&handshake).await?;

        let accepted = self.auth_reply().await?;
        if accepted {
            self.identity = Some(email.to_string());
        }
        Ok(accepted)
    }

    /// Read the bare handshake reply
    pub async fn auth_reply(&mut self) -> Result<bool> {
        let line = self
            .reader
            .next_line()
            .await?
            .context("Connection closed before the handshake reply")?;

        match line.as_str() {
            AUTH_SUCCESS => Ok(true),
            AUTH_FAILED => Ok(false),
            other => anyhow::bail!("Unexpected handshake reply: {}", other),
        }
    }

    /// Send a chat message with a fresh id. Returns the id.
    pub async fn send_chat(&mut self, to: &str, content: &str) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let record = ClientRecord::Chat {
            id: Some(id.clone()),
            sender_email: self.identity.clone(),
            receiver_email: Some(to.to_string()),
            content: Some(content.to_string()),
        };
        self.send_record(&record).await?;
        Ok(id)
    }

    pub async fn acknowledge(&mut self, id: &str) -> Result<()> {
        self.send_record(&ClientRecord::Acknowledge { id: id.to_string() })
            .await
    }

    pub async fn logout(&mut self) -> Result<()> {
        let record = ClientRecord::Logout {
            sender_email: self.identity.clone(),
        };
        self.send_record(&record).await
    }

    pub async fn send_record(&mut self, record: &ClientRecord) -> Result<()> {
        let bytes = record.to_bytes()?;
        self.writer
            .write_all(&bytes)
            .await
            .context("Failed to send record")?;
        Ok(())
    }

    /// Send one raw line; the newline is added here
    pub async fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer
            .write_all(b"\n")
            .await
            .context("Failed to send line")?;
        Ok(())
    }

    /// Next record from the server, or `None` once the server hangs up
    pub async fn next_record(&mut self) -> Result<Option<ServerRecord>> {
        match self.reader.next_line().await? {
            Some(line) => {
                let record = ServerRecord::from_bytes(line.as_bytes())
                    .with_context(|| format!("Unexpected record from server: {}", line))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Close our side of the connection
    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::message::DeliveryOutcome;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[tokio::test]
    async fn test_client_speaks_the_wire_format() {
        let (client_end, server_end) = tokio::io::duplex(4096);
        let (server_read, mut server_write) = tokio::io::split(server_end);
        let mut server_lines = BufReader::new(server_read).lines();

        let server = tokio::spawn(async move {
            let handshake = server_lines.next_line().await.unwrap().unwrap();
            let credentials = Credentials::parse(&handshake).unwrap();
            assert_eq!(credentials.email, "x@example.com");
            server_write.write_all(b"AUTH_SUCCESS\n").await.unwrap();

            let chat = server_lines.next_line().await.unwrap().unwrap();
            let ClientRecord::Chat { id, sender_email, receiver_email, .. } =
                ClientRecord::parse(&chat).unwrap()
            else {
                panic!("expected a chat record");
            };
            assert_eq!(sender_email.as_deref(), Some("x@example.com"));
            assert_eq!(receiver_email.as_deref(), Some("y@example.com"));

            let confirmation = format!(
                "{{\"type\":\"CONFIRMATION\",\"id\":\"{}\",\"status\":\"delivered\"}}\n",
                id.unwrap()
            );
            server_write.write_all(confirmation.as_bytes()).await.unwrap();
        });

        let mut client = RelayClient::new(client_end);
        assert!(client.login("x@example.com", "pw").await.unwrap());
        assert_eq!(client.identity(), Some("x@example.com"));

        let id = client.send_chat("y@example.com", "hello").await.unwrap();
        assert_eq!(
            client.next_record().await.unwrap(),
            Some(ServerRecord::Confirmation {
                id,
                status: DeliveryOutcome::Delivered,
            })
        );

        server.await.unwrap();
        assert_eq!(client.next_record().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejected_login() {
        let (client_end, mut server_end) = tokio::io::duplex(1024);
        server_end.write_all(b"AUTH_FAILED\n").await.unwrap();

        let mut client = RelayClient::new(client_end);
        assert!(!client.login("x@example.com", "bad").await.unwrap());
        assert_eq!(client.identity(), None);
    }
}
