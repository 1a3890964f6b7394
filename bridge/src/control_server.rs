/*!
Line-oriented control server.

Clients send one ASCII command per line. Queries are answered with a single
newline-terminated line; setting commands are applied silently. Queries are
recognized by substring, so SCPI-style prefixes such as `*IDN?` or
`C1:GAIN?` match.
*/

use std::sync::Arc;

use shared::settings::SUPPORTED_RATES_HZ;
use shared::{DeviceSettings, Result, ScopeError, TriggerSlope, CHANNEL_COUNT};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::controller::AcquisitionController;

/// Answer to `IDN?`
pub const IDENTITY: &str = "Hantek,Hantek6xx4B,0001,0.1";

/// Memory depth reported to clients
pub const MEMORY_DEPTH: u32 = 4096;

/// Longest command line accepted, newline included
pub const MAX_LINE_LEN: usize = 1024;

/// A parsed control command
#[derive(Debug, Clone, PartialEq)]
pub enum ControlRequest {
    Identify,
    Channels,
    Rates,
    Depths,
    Gain,
    Offset,
    SetRate(u64),
    SetTriggerLevel(f64),
    SetTriggerSlope(TriggerSlope),
    /// Anything else; answered with nothing
    Unknown,
}

impl ControlRequest {
    /// Parse one command line. Only malformed arguments of known setting
    /// commands are errors.
    pub fn parse(line: &str) -> Result<Self> {
        let line = line.trim();

        // queries match anywhere in the line
        for (needle, request) in [
            ("IDN?", Self::Identify),
            ("CHANS?", Self::Channels),
            ("RATES?", Self::Rates),
            ("DEPTHS?", Self::Depths),
            ("GAIN?", Self::Gain),
            ("OFFS?", Self::Offset),
        ] {
            if line.contains(needle) {
                return Ok(request);
            }
        }

        let mut tokens = line.split_whitespace();
        let Some(head) = tokens.next() else {
            return Ok(Self::Unknown);
        };
        let argument = tokens.next();

        if head == "RATE" {
            let rate = argument
                .and_then(|arg| arg.parse::<u64>().ok())
                .ok_or_else(|| ScopeError::protocol(format!("invalid rate in {:?}", line)))?;
            return Ok(Self::SetRate(rate));
        }

        let mut path = head.split(':');
        if let (Some("TRIG"), Some(leaf)) = (path.next(), path.next()) {
            match leaf {
                "LEV" => {
                    let level = argument
                        .and_then(|arg| arg.parse::<f64>().ok())
                        .filter(|level| level.is_finite())
                        .ok_or_else(|| ScopeError::protocol(format!("invalid trigger level in {:?}", line)))?;
                    return Ok(Self::SetTriggerLevel(level));
                }
                "SLOPE" | "EDGE" => {
                    let slope = argument
                        .and_then(TriggerSlope::parse)
                        .ok_or_else(|| ScopeError::protocol(format!("invalid trigger slope in {:?}", line)))?;
                    return Ok(Self::SetTriggerSlope(slope));
                }
                _ => {}
            }
        }

        Ok(Self::Unknown)
    }
}

/// Read one command line into `buf`. Returns `None` at end of stream.
/// Invalid UTF-8 is replaced rather than rejected; a line longer than
/// [`MAX_LINE_LEN`] is discarded up to its newline and reported as a
/// protocol error.
async fn next_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    let read = (&mut *reader).take(MAX_LINE_LEN as u64).read_until(b'\n', buf).await?;
    if read == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&b'\n') || read < MAX_LINE_LEN {
        return Ok(Some(String::from_utf8_lossy(buf).into_owned()));
    }

    loop {
        buf.clear();
        let read = (&mut *reader).take(MAX_LINE_LEN as u64).read_until(b'\n', buf).await?;
        if read == 0 || buf.last() == Some(&b'\n') {
            break;
        }
    }
    Err(ScopeError::protocol(format!("command line longer than {} bytes", MAX_LINE_LEN)))
}

/// Serves the control protocol, one client at a time
pub struct ControlServer {
    listener: TcpListener,
    controller: Arc<AcquisitionController>,
}

impl ControlServer {
    pub fn new(listener: TcpListener, controller: Arc<AcquisitionController>) -> Self {
        Self { listener, controller }
    }

    /// Accept and serve clients until shutdown is signalled
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> std::io::Result<()> {
        loop {
            let (stream, peer) = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = self.listener.accept() => accepted?,
            };
            info!("🎛️ Control: connected with {}", peer);

            tokio::select! {
                _ = shutdown.changed() => break,
                result = self.serve_session(stream) => match result {
                    Ok(()) => info!("Control: {} disconnected", peer),
                    Err(e) => warn!("Control: session with {} ended: {}", peer, e),
                },
            }
        }

        info!("Control server stopped");
        Ok(())
    }

    async fn serve_session(&self, stream: TcpStream) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = Vec::with_capacity(MAX_LINE_LEN);

        loop {
            let request = match next_line(&mut reader, &mut line).await {
                Ok(None) => break,
                Ok(Some(text)) => {
                    debug!("Control: {:?}", text);
                    ControlRequest::parse(&text)
                }
                Err(e) => Err(e),
            };

            let request = match request {
                Ok(request) => request,
                Err(e) if e.is_session_fatal() => return Err(e),
                Err(e) => {
                    warn!("Ignoring command: {}", e);
                    continue;
                }
            };

            if let Some(response) = self.handle(request).await {
                writer.write_all(response.as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }
        }

        Ok(())
    }

    /// Execute one request; queries yield the line to send back
    pub async fn handle(&self, request: ControlRequest) -> Option<String> {
        match request {
            ControlRequest::Identify => Some(IDENTITY.to_string()),
            ControlRequest::Channels => Some(CHANNEL_COUNT.to_string()),
            ControlRequest::Rates => Some(
                SUPPORTED_RATES_HZ
                    .iter()
                    .map(|rate| rate.to_string())
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            ControlRequest::Depths => Some(MEMORY_DEPTH.to_string()),
            ControlRequest::Gain => Some("1".to_string()),
            ControlRequest::Offset => Some("0".to_string()),
            ControlRequest::SetRate(rate) => {
                self.update(move |settings| settings.sample_rate_hz = rate).await;
                None
            }
            ControlRequest::SetTriggerLevel(level) => {
                info!("Setting trigger level {} V", level);
                self.update(move |settings| settings.trigger_voltage_v = level).await;
                None
            }
            ControlRequest::SetTriggerSlope(slope) => {
                self.update(move |settings| settings.trigger_slope = slope).await;
                None
            }
            ControlRequest::Unknown => None,
        }
    }

    /// Change one field of the settings and hand them to the controller.
    /// Blocks on the controller lock, so it runs off the async workers.
    async fn update<F>(&self, change: F)
    where
        F: FnOnce(&mut DeviceSettings) + Send + 'static,
    {
        let controller = Arc::clone(&self.controller);
        let result = tokio::task::spawn_blocking(move || {
            let mut settings = controller.settings()?;
            change(&mut settings);
            controller.configure(settings)
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Setting rejected: {}", e),
            Err(e) => error!("Settings update task failed: {}", e),
        }
    }
}
