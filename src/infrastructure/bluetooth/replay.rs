//! Replay Transport
//!
//! Plays a recorded JSON-lines capture through the bridge as if the
//! halves were connected, and answers subcommands the way the firmware
//! does so the connect sequence completes.
//!
//! ```text
//! {"at_ms": 0,  "event": "connected",    "endpoint": "L", "name": "Joy-Con 2 (L)"}
//! {"at_ms": 16, "event": "notification", "endpoint": "L", "payload": [161, 0, ...]}
//! {"at_ms": 900,"event": "disconnected", "endpoint": "L"}
//! ```
//!
//! Blank lines and lines starting with `#` are skipped.

use crate::domain::models::{EndpointId, IdentityHint};
use crate::infrastructure::bluetooth::protocol::{
    self, build_reply_frame, frame_sequence, subcommand,
};
use crate::infrastructure::bluetooth::transport::{FrameWriter, Transport, TransportEvent};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CaptureEvent {
    Connected {
        endpoint: EndpointId,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        product_code: Option<u16>,
    },
    Identity {
        endpoint: EndpointId,
        name: String,
        #[serde(default)]
        product_code: Option<u16>,
    },
    Notification {
        endpoint: EndpointId,
        payload: Vec<u8>,
    },
    Disconnected {
        endpoint: EndpointId,
    },
}

/// One line of a capture file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureLine {
    /// Offset from the start of playback
    pub at_ms: u64,
    #[serde(flatten)]
    pub event: CaptureEvent,
}

impl CaptureLine {
    fn into_transport_event(self) -> TransportEvent {
        match self.event {
            CaptureEvent::Connected {
                endpoint,
                name,
                product_code,
            } => TransportEvent::Connected {
                endpoint,
                hint: name.map(|n| IdentityHint::new(n, product_code)),
            },
            CaptureEvent::Identity {
                endpoint,
                name,
                product_code,
            } => TransportEvent::Identity {
                endpoint,
                hint: IdentityHint::new(name, product_code),
            },
            CaptureEvent::Notification { endpoint, payload } => {
                TransportEvent::Notification { endpoint, payload }
            }
            CaptureEvent::Disconnected { endpoint } => TransportEvent::Disconnected { endpoint },
        }
    }
}

type SharedSender = Arc<Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>>;

#[derive(Debug)]
pub struct ReplayTransport {
    lines: Vec<CaptureLine>,
    endpoints: Vec<EndpointId>,
    hints: HashMap<EndpointId, IdentityHint>,
    sender: SharedSender,
    /// Answered to factory calibration reads; blank flash
    calibration_block: Vec<u8>,
    scanned: AtomicBool,
}

impl ReplayTransport {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Could not open capture {}", path.display()))?;
        Self::from_reader(BufReader::new(file))
    }

    pub fn from_reader(reader: impl BufRead) -> Result<Self> {
        let mut lines = Vec::new();
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let parsed: CaptureLine = serde_json::from_str(trimmed)
                .with_context(|| format!("Invalid capture line {}", index + 1))?;
            lines.push(parsed);
        }
        if lines.is_empty() {
            bail!("Capture contains no events");
        }
        lines.sort_by_key(|l| l.at_ms);

        let mut endpoints = Vec::new();
        let mut hints = HashMap::new();
        for line in &lines {
            match &line.event {
                CaptureEvent::Connected {
                    endpoint,
                    name: Some(name),
                    product_code,
                } => {
                    hints
                        .entry(endpoint.clone())
                        .or_insert_with(|| IdentityHint::new(name.clone(), *product_code));
                    if !endpoints.contains(endpoint) {
                        endpoints.push(endpoint.clone());
                    }
                }
                CaptureEvent::Connected { endpoint, .. } => {
                    if !endpoints.contains(endpoint) {
                        endpoints.push(endpoint.clone());
                    }
                }
                _ => {}
            }
        }
        info!(
            "Loaded capture: {} events, {} endpoint(s)",
            lines.len(),
            endpoints.len()
        );

        Ok(Self {
            lines,
            endpoints,
            hints,
            sender: Arc::new(Mutex::new(None)),
            calibration_block: vec![0xFF; protocol::FACTORY_STICK_CALIBRATION_LEN as usize],
            scanned: AtomicBool::new(false),
        })
    }

    pub fn endpoints(&self) -> &[EndpointId] {
        &self.endpoints
    }

    fn reply_for(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let (sub, seq) = frame_sequence(frame)?;
        let data = match sub {
            subcommand::FLASH_READ => {
                // Echo address and length ahead of the block, like the firmware.
                let mut data = protocol::subcommand_args(frame).get(..5)?.to_vec();
                data.extend_from_slice(&self.calibration_block);
                data
            }
            _ => Vec::new(),
        };
        Some(build_reply_frame(seq, true, sub, &data))
    }
}

impl FrameWriter for ReplayTransport {
    fn write(&self, endpoint: &EndpointId, bytes: &[u8]) -> bool {
        let Some(reply) = self.reply_for(bytes) else {
            trace!("Replay swallowed {} byte frame to {}", bytes.len(), endpoint);
            return true;
        };
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(tx) => tx
                .send(TransportEvent::Notification {
                    endpoint: endpoint.clone(),
                    payload: reply,
                })
                .is_ok(),
            None => false,
        }
    }
}

impl Transport for ReplayTransport {
    async fn scan(&self) -> Result<Vec<EndpointId>> {
        if self.scanned.swap(true, Ordering::SeqCst) {
            debug!("Capture already played");
            return Ok(Vec::new());
        }
        Ok(self.endpoints.clone())
    }

    async fn connect(&self, endpoint: &EndpointId) -> Result<()> {
        if !self.endpoints.contains(endpoint) {
            bail!("{} is not in the capture", endpoint);
        }
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        if self.scanned.load(Ordering::SeqCst) {
            // Nothing left to play; the stream closes immediately.
            return rx;
        }
        *self.sender.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx.clone());

        let lines = self.lines.clone();
        let shared = self.sender.clone();
        tokio::spawn(async move {
            let start = tokio::time::Instant::now();
            for line in lines {
                tokio::time::sleep_until(start + Duration::from_millis(line.at_ms)).await;
                if tx.send(line.into_transport_event()).is_err() {
                    break;
                }
            }
            info!("Capture playback finished");
            shared
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
        });
        rx
    }

    fn identity_hint(&self, endpoint: &EndpointId) -> Option<IdentityHint> {
        self.hints.get(endpoint).cloned()
    }
}
