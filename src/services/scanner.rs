use anyhow::{Result, anyhow};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::UploadConfig;

#[derive(Debug, Clone, PartialEq)]
pub enum ScanResult {
    Clean,
    Infected { threat_name: String },
    /// Scan could not be completed
    Error { reason: String },
}

#[async_trait::async_trait]
pub trait VirusScanner: Send + Sync {
    async fn scan(&self, reader: Pin<Box<dyn AsyncRead + Send>>) -> Result<ScanResult>;

    async fn health_check(&self) -> bool;
}

/// Talks to clamd over TCP using the INSTREAM command.
///
/// ```bash
/// docker run -d --name clamav -p 3310:3310 clamav/clamav:latest
/// ```
pub struct ClamAvScanner {
    host: String,
    port: u16,
    timeout: Duration,
}

impl ClamAvScanner {
    pub fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            timeout: Duration::from_secs(300),
        }
    }

    async fn connect(&self) -> Result<TcpStream> {
        let addr = format!("{}:{}", self.host, self.port);
        TcpStream::connect(&addr)
            .await
            .map_err(|e| anyhow!("Failed to connect to ClamAV at {}: {}", addr, e))
    }
}

/// Frames `reader` as `<len:u32 be><bytes>...` followed by a zero length frame.
async fn write_instream(
    stream: &mut TcpStream,
    mut reader: Pin<Box<dyn AsyncRead + Send>>,
) -> Result<()> {
    stream.write_all(b"zINSTREAM\0").await?;

    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        stream.write_all(&(n as u32).to_be_bytes()).await?;
        stream.write_all(&buffer[..n]).await?;
    }

    stream.write_all(&0u32.to_be_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

fn parse_clamd_response(raw: &[u8]) -> ScanResult {
    let response = String::from_utf8_lossy(raw);
    let response = response.trim_end_matches('\0').trim();

    if response.ends_with("OK") {
        ScanResult::Clean
    } else if let Some(found) = response.strip_suffix("FOUND") {
        let threat_name = found
            .split_once(':')
            .map(|(_, threat)| threat.trim())
            .filter(|threat| !threat.is_empty())
            .unwrap_or("Unknown threat")
            .to_string();
        ScanResult::Infected { threat_name }
    } else {
        ScanResult::Error {
            reason: format!("Unexpected ClamAV response: {}", response),
        }
    }
}

#[async_trait::async_trait]
impl VirusScanner for ClamAvScanner {
    async fn scan(&self, reader: Pin<Box<dyn AsyncRead + Send>>) -> Result<ScanResult> {
        let mut stream = self.connect().await?;
        write_instream(&mut stream, reader).await?;

        let mut response = Vec::new();
        tokio::time::timeout(self.timeout, stream.read_to_end(&mut response))
            .await
            .map_err(|_| anyhow!("ClamAV scan timed out after {:?}", self.timeout))??;

        tracing::debug!("ClamAV response: {}", String::from_utf8_lossy(&response));
        Ok(parse_clamd_response(&response))
    }

    async fn health_check(&self) -> bool {
        let Ok(mut stream) = self.connect().await else {
            return false;
        };
        if stream.write_all(b"zPING\0").await.is_err() || stream.flush().await.is_err() {
            return false;
        }
        let mut response = [0u8; 16];
        match stream.read(&mut response).await {
            Ok(n) => String::from_utf8_lossy(&response[..n]).contains("PONG"),
            Err(_) => false,
        }
    }
}

/// Accepts everything. Used when scanning is disabled.
pub struct NoOpScanner;

#[async_trait::async_trait]
impl VirusScanner for NoOpScanner {
    async fn scan(&self, _reader: Pin<Box<dyn AsyncRead + Send>>) -> Result<ScanResult> {
        tracing::debug!("NoOpScanner: skipping virus scan");
        Ok(ScanResult::Clean)
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Flags everything as infected.
pub struct AlwaysInfectedScanner;

#[async_trait::async_trait]
impl VirusScanner for AlwaysInfectedScanner {
    async fn scan(&self, _reader: Pin<Box<dyn AsyncRead + Send>>) -> Result<ScanResult> {
        Ok(ScanResult::Infected {
            threat_name: "Test.Virus.EICAR".to_string(),
        })
    }

    async fn health_check(&self) -> bool {
        true
    }
}

pub fn create_scanner(config: &UploadConfig) -> Arc<dyn VirusScanner> {
    if !config.enable_virus_scan {
        return Arc::new(NoOpScanner);
    }
    match config.virus_scanner_type.to_lowercase().as_str() {
        "clamav" => Arc::new(ClamAvScanner::new(
            config.clamav_host.clone(),
            config.clamav_port,
        )),
        "noop" | "none" | "disabled" => Arc::new(NoOpScanner),
        other => {
            tracing::warn!("Unknown scanner type '{}', using NoOpScanner", other);
            Arc::new(NoOpScanner)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_noop_scanner() {
        let scanner = NoOpScanner;
        let reader = Box::pin(std::io::Cursor::new(b"test content".to_vec()));
        let result = scanner.scan(reader).await.unwrap();
        assert_eq!(result, ScanResult::Clean);
        assert!(scanner.health_check().await);
    }

    #[test]
    fn test_parse_clamd_response() {
        assert_eq!(parse_clamd_response(b"stream: OK\0"), ScanResult::Clean);
        assert_eq!(
            parse_clamd_response(b"stream: Eicar-Test-Signature FOUND\0"),
            ScanResult::Infected {
                threat_name: "Eicar-Test-Signature".to_string()
            }
        );
        assert!(matches!(
            parse_clamd_response(b"INSTREAM size limit exceeded. ERROR"),
            ScanResult::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_disabled_scanning_uses_noop() {
        let config = UploadConfig {
            virus_scanner_type: "clamav".to_string(),
            ..UploadConfig::default()
        };
        let scanner = create_scanner(&config);
        let reader = Box::pin(std::io::Cursor::new(b"x".to_vec()));
        assert_eq!(scanner.scan(reader).await.unwrap(), ScanResult::Clean);
    }
}
