// NTRIP correction source client
// One TCP session to the caster: HTTP-style handshake with Basic auth,
// then NMEA sentences out / raw RTCM chunks in

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, info};

use crate::constants::{CONNECT_TIMEOUT_SECS, CORRECTION_BUF_LEN, NTRIP_RESPONSE_BUF_LEN};
use crate::error::{Error, Result};

/// Status token the caster must include for a successful mount.
const SUCCESS_TOKEN: &str = "ICY 200 OK";

/// Connection parameters for an NTRIP caster.
#[derive(Debug, Clone)]
pub struct NtripClient {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub mount: String,
}

/// An authenticated caster session.
pub struct NtripSession {
    stream: TcpStream,
}

impl NtripClient {
    pub fn new(host: String, port: u16, user: String, password: String, mount: String) -> Self {
        NtripClient {
            host,
            port,
            user,
            password,
            mount,
        }
    }

    /// Perform the handshake. Any rejection or socket failure is a
    /// recoverable error; the caller decides whether to run without
    /// corrections.
    pub async fn connect(&self) -> Result<NtripSession> {
        let connect_timeout = Duration::from_secs(CONNECT_TIMEOUT_SECS);
        let mut stream = time::timeout(
            connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| Error::ConnectTimeout(connect_timeout))??;

        let auth = base64::encode(format!("{}:{}", self.user, self.password));
        let request = format!(
            "GET /{} HTTP/1.1\r\n\
             User-Agent: NTRIP rtk-fleet\r\n\
             Authorization: Basic {}\r\n\
             Accept: */*\r\nConnection: close\r\n\
             \r\n",
            self.mount, auth
        );
        stream.write_all(request.as_bytes()).await?;

        let mut buf = vec![0u8; NTRIP_RESPONSE_BUF_LEN];
        let n = stream.read(&mut buf).await?;
        let response = String::from_utf8_lossy(&buf[..n]);
        debug!("Caster response: {}", response.trim_end());

        if response.contains(SUCCESS_TOKEN) {
            info!("Connected to caster {}:{} /{}", self.host, self.port, self.mount);
            Ok(NtripSession { stream })
        } else {
            let status = response.lines().next().unwrap_or("").to_string();
            Err(Error::HandshakeRejected(status))
        }
    }
}

impl NtripSession {
    /// Send one position sentence, CRLF-terminated.
    pub async fn send_position(&mut self, sentence: &str) -> Result<()> {
        self.stream.write_all(sentence.as_bytes()).await?;
        self.stream.write_all(b"\r\n").await?;
        Ok(())
    }

    /// One bounded read of correction bytes. Zero bytes means the caster
    /// closed the stream and the session is broken.
    pub async fn receive_correction(&mut self) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; CORRECTION_BUF_LEN];
        let n = self.stream.read(&mut buf).await?;
        if n == 0 {
            return Err(Error::CorrectionStreamClosed);
        }
        buf.truncate(n);
        Ok(buf)
    }
}
