//! Logging setup
//!
//! `env_logger` writes through an in-memory pipe drained by a background
//! task, so log calls never block on file I/O. Without a configured log
//! file, plain `env_logger::init()` is the right choice instead.

use std::io::{self, Write};

use env_logger::Builder;
use log::LevelFilter;
use tokio::{
    fs::{create_dir_all, metadata, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::{
        mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender},
        watch,
    },
    task::JoinHandle,
};

use crate::config;

/// `std::io::Write` adapter forwarding formatted records to the drain task.
struct PipeWriter {
    sender: UnboundedSender<Vec<u8>>,
}

impl Write for PipeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sender
            .send(buf.to_vec())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// File-backed logger: initializes env_logger against the pipe and spawns
/// the drain task appending to the configured file.
pub struct FileLogger {
    config: config::Log,
    sender: UnboundedSender<Vec<u8>>,
    receiver: UnboundedReceiver<Vec<u8>>,
}

/// Handle to a running drain task; `shutdown` flushes and stops it.
pub struct LogHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl LogHandle {
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

impl FileLogger {
    pub fn new(config: config::Log) -> Self {
        let (sender, receiver) = unbounded_channel::<Vec<u8>>();
        Self {
            config,
            sender,
            receiver,
        }
    }

    /// Install env_logger targeting the pipe and spawn the drain task.
    /// Call once, from the binary, inside a tokio runtime.
    pub fn start(self) -> LogHandle {
        Builder::from_env(env_logger::Env::default())
            .filter(None, LevelFilter::Info)
            .target(env_logger::Target::Pipe(Box::new(PipeWriter {
                sender: self.sender.clone(),
            })))
            .init();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(drain(self.config, self.receiver, shutdown_rx));
        LogHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Append buffered log lines to the file until shutdown flips.
async fn drain(
    config: config::Log,
    mut receiver: UnboundedReceiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Some(parent) = std::path::Path::new(&config.path).parent() {
        if metadata(parent).await.is_err() {
            create_dir_all(parent)
                .await
                .expect("Failed to create log path");
        }
    }

    let mut file = BufWriter::new(
        OpenOptions::new()
            .append(true)
            .create(true)
            .open(&config.path)
            .await
            .expect("Failed to open or create log file"),
    );

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            },

            data = receiver.recv() => {
                match data {
                    Some(data) => {
                        if let Err(e) = file.write_all(&data).await {
                            eprintln!("Failed to write to log file: {e}");
                        }
                    }
                    // all senders gone, nothing further to drain
                    None => break,
                }
            }
        }
    }

    if let Err(e) = file.flush().await {
        eprintln!("Failed to flush log file: {e}");
    }
}
