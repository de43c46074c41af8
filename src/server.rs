use crate::config::Config;
use crate::error::Result;
use crate::paths;
use crate::protocol::{Ack, MessageDecoder, ScanMessage};
use crate::store::{ScanRecord, ScanStore};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::Local;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// TCP listener that receives CCCD scans from mobile devices.
///
/// One dedicated accept thread, one thread per live connection. Connection
/// threads write into the shared [`ScanStore`]; they hold no other shared
/// state, so a slow or broken peer affects only its own connection.
pub struct CccdServer {
    bind_address: String,
    max_message_bytes: usize,
    images_dir: PathBuf,
    store: Arc<ScanStore>,
    running: Arc<AtomicBool>,
    local_addr: Mutex<Option<SocketAddr>>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl CccdServer {
    pub fn new(config: &Config, store: Arc<ScanStore>) -> Self {
        Self {
            bind_address: config.server.bind_address.clone(),
            max_message_bytes: config.server.max_message_bytes,
            images_dir: config.storage.cccd_images_dir.clone(),
            store,
            running: Arc::new(AtomicBool::new(false)),
            local_addr: Mutex::new(None),
            accept_thread: Mutex::new(None),
        }
    }

    /// Binds and starts accepting. Returns `Ok(false)` if already running.
    pub fn start(&self) -> Result<bool> {
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::info!("CCCD server is already running");
            return Ok(false);
        }

        std::fs::create_dir_all(&self.images_dir)?;

        let listener = match TcpListener::bind(&self.bind_address) {
            Ok(listener) => listener,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };
        // Non-blocking accept so stop() can take effect without a peer
        // having to connect first.
        listener.set_nonblocking(true)?;

        let local_addr = listener.local_addr()?;
        *lock(&self.local_addr) = Some(local_addr);
        tracing::info!("CCCD server listening on {}", local_addr);

        let running = Arc::clone(&self.running);
        let store = Arc::clone(&self.store);
        let images_dir = self.images_dir.clone();
        let max_message_bytes = self.max_message_bytes;

        let handle = std::thread::spawn(move || {
            accept_loop(listener, running, store, images_dir, max_message_bytes);
        });
        *lock(&self.accept_thread) = Some(handle);

        Ok(true)
    }

    /// Signals shutdown and closes the listening socket. Connections that
    /// are already accepted keep their own threads and are not waited for.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(handle) = lock(&self.accept_thread).take() {
            if handle.join().is_err() {
                tracing::error!("Accept thread panicked during shutdown");
            }
        }
        *lock(&self.local_addr) = None;
        tracing::info!("CCCD server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Address actually bound, useful when the configured port is 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.local_addr)
    }
}

impl Drop for CccdServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn accept_loop(
    listener: TcpListener,
    running: Arc<AtomicBool>,
    store: Arc<ScanStore>,
    images_dir: PathBuf,
    max_message_bytes: usize,
) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                tracing::info!("New connection from {}", peer);
                let store = Arc::clone(&store);
                let images_dir = images_dir.clone();
                std::thread::spawn(move || {
                    if let Err(e) =
                        handle_connection(stream, &store, &images_dir, max_message_bytes)
                    {
                        tracing::warn!("Connection from {} ended with error: {}", peer, e);
                    }
                    tracing::info!("Connection from {} closed", peer);
                });
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL_INTERVAL);
            }
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::error!("Error accepting connection: {}", e);
                }
            }
        }
    }
}

/// Receive loop for one mobile-device connection: read raw bytes, feed the
/// decoder, persist and store each complete message, acknowledge, repeat.
fn handle_connection(
    mut stream: TcpStream,
    store: &ScanStore,
    images_dir: &Path,
    max_message_bytes: usize,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    let mut decoder = MessageDecoder::new(max_message_bytes);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Ok(());
        }

        match decoder.feed(&chunk[..n]) {
            Ok(Some(value)) => {
                // The ack confirms a complete frame; a payload that fails
                // validation is logged and dropped without tearing down
                // the connection.
                if let Err(e) = process_message(&value, store, images_dir) {
                    tracing::warn!("Dropping scan message: {}", e);
                }
                let ack = serde_json::to_vec(&Ack::success())
                    .map_err(|e| anyhow::anyhow!("Failed to serialize ack: {}", e))?;
                stream.write_all(&ack)?;
                stream.flush()?;
            }
            Ok(None) => {}
            Err(e) => {
                // Oversized accumulation; the decoder already discarded
                // its buffer, the connection stays up.
                tracing::warn!("Protocol error on connection: {}", e);
            }
        }
    }
}

fn process_message(value: &Value, store: &ScanStore, images_dir: &Path) -> Result<()> {
    let message = ScanMessage::from_value(value)?;

    let image_bytes = BASE64
        .decode(message.face_image.as_bytes())
        .map_err(|e| anyhow::anyhow!("Invalid base64 face image: {}", e))?;

    let image_path = paths::cccd_image_path(images_dir, &message.citizen_id);
    std::fs::write(&image_path, &image_bytes)?;

    tracing::info!("Received CCCD data for id {}", message.citizen_id);
    store.put(ScanRecord {
        citizen_id: message.citizen_id,
        image_path,
        received_at: Local::now(),
        raw_payload: value.clone(),
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, ServerConfig, StorageConfig};
    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> Config {
        Config {
            server: ServerConfig {
                bind_address: "127.0.0.1:0".to_string(),
                max_message_bytes: 1024 * 1024,
            },
            storage: StorageConfig {
                cccd_images_dir: dir.path().join("cccd_images"),
                captured_faces_dir: dir.path().join("captured_faces"),
            },
            models: ModelConfig {
                detector_path: dir.path().join("detector.onnx"),
                recognizer_path: dir.path().join("recognizer.onnx"),
            },
            detector: Default::default(),
            recognizer: Default::default(),
            verification: Default::default(),
        }
    }

    fn read_ack(stream: &mut TcpStream) -> Value {
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).unwrap();
        serde_json::from_slice(&buf[..n]).unwrap()
    }

    #[test]
    fn scan_sent_in_chunks_is_stored_and_acknowledged() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ScanStore::new());
        let server = CccdServer::new(&test_config(&dir), Arc::clone(&store));
        assert!(server.start().unwrap());

        let photo = b"not really a jpeg";
        let json = serde_json::json!({
            "citizenId": "001204038012",
            "faceImage": BASE64.encode(photo),
        })
        .to_string();

        let mut stream = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        let (head, tail) = json.as_bytes().split_at(json.len() / 2);
        stream.write_all(head).unwrap();
        stream.flush().unwrap();
        std::thread::sleep(Duration::from_millis(20));
        stream.write_all(tail).unwrap();

        let ack = read_ack(&mut stream);
        assert_eq!(ack["status"], "success");
        assert_eq!(ack["message"], "CCCD data received");

        // The record was stored before the ack was written.
        let record = store.get("001204038012").unwrap();
        assert_eq!(std::fs::read(&record.image_path).unwrap(), photo);
        let name = record.image_path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("cccd_001204038012_"));

        server.stop();
    }

    #[test]
    fn connection_survives_multiple_messages() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ScanStore::new());
        let server = CccdServer::new(&test_config(&dir), Arc::clone(&store));
        server.start().unwrap();

        let mut stream = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        for id in ["000000000001", "000000000002"] {
            let json = serde_json::json!({
                "citizenId": id,
                "faceImage": BASE64.encode(b"photo"),
            })
            .to_string();
            stream.write_all(json.as_bytes()).unwrap();
            let ack = read_ack(&mut stream);
            assert_eq!(ack["status"], "success");
        }

        assert!(store.get("000000000001").is_some());
        assert!(store.get("000000000002").is_some());
        server.stop();
    }

    #[test]
    fn malformed_message_is_acked_but_not_stored() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ScanStore::new());
        let server = CccdServer::new(&test_config(&dir), Arc::clone(&store));
        server.start().unwrap();

        let mut stream = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        let json = serde_json::json!({ "citizenId": "001204038012" }).to_string();
        stream.write_all(json.as_bytes()).unwrap();

        let ack = read_ack(&mut stream);
        assert_eq!(ack["status"], "success");
        assert!(store.get("001204038012").is_none());

        server.stop();
    }

    #[test]
    fn start_is_idempotent_and_stop_is_safe_to_repeat() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ScanStore::new());
        let server = CccdServer::new(&test_config(&dir), store);

        assert!(server.start().unwrap());
        assert!(!server.start().unwrap());
        assert!(server.is_running());

        server.stop();
        assert!(!server.is_running());
        assert!(server.local_addr().is_none());
        server.stop();
    }
}
